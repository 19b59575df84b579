mod client;
mod error;

pub use client::{SshAuthTransport, SshResult, SshSessionHandle};
pub use error::SshClientError;
