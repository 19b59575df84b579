use crate::protocol::PromptData;

/// Domain error surfaced by the authentication core to its caller. Maps
/// directly onto the error kinds the helper protocol and the admission
/// throttle can produce.
#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("authentication required")]
    AuthenticationRequired,

    #[error("authentication failed: {message}")]
    AuthenticationFailed {
        message: String,
        prompt: Option<PromptData>,
    },

    #[error("permission denied")]
    PermissionDenied,

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Internal(#[from] gateway_common::GatewayError),
}

impl AuthError {
    pub fn authentication_failed(message: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            message: message.into(),
            prompt: None,
        }
    }

    pub fn with_prompt(message: impl Into<String>, prompt: PromptData) -> Self {
        Self::AuthenticationFailed {
            message: message.into(),
            prompt: Some(prompt),
        }
    }

    /// The "Connection closed by host" wording used for admission drops.
    pub fn connection_closed_by_host() -> Self {
        Self::Failed("Connection closed by host".to_string())
    }
}
