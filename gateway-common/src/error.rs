use std::error::Error;

/// Ambient error type for config loading, I/O, and other edge concerns.
/// Domain errors surfaced by the auth core itself live in
/// `gateway_core::error::AuthError`.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse URL: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("deserialization failed: {0}")]
    DeserializeJson(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(#[from] serde_yaml::Error),
    #[error(transparent)]
    Other(Box<dyn Error + Send + Sync>),
}

impl GatewayError {
    pub fn other<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Other(Box::new(err))
    }
}
