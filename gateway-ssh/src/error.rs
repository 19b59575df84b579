use std::error::Error;

/// Errors from establishing or authenticating an SSH connection. Kept
/// separate from `gateway_core::AuthError` — the core maps these onto its
/// own error kinds rather than exposing SSH internals to callers.
#[derive(thiserror::Error, Debug)]
pub enum SshClientError {
    #[error("SSH protocol error: {0}")]
    Ssh(#[from] russh::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("authentication rejected: {0}")]
    Authentication(String),
    #[error(transparent)]
    Other(Box<dyn Error + Send + Sync>),
}

impl SshClientError {
    pub fn other<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Other(Box::new(err))
    }
}
