use std::sync::Arc;
use std::time::Duration;

use gateway_common::Secret;
use russh::client::{self, Handle};
use russh::{Disconnect, MethodSet};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::error::SshClientError;

/// Accepts any host key. The original gateway's loopback SSH method runs
/// with `ignore-key = true` since it always connects to `127.0.0.1`.
struct IgnoreHostKey;

impl client::Handler for IgnoreHostKey {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &russh::keys::PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// The terminal outcome of an SSH authentication attempt, analogous to the
/// SSH transport's `result(problem)` signal: `problem` is `None` on
/// success, or a short machine-readable string the core maps onto an
/// `AuthError` (`"authentication-failed"`, `"no-server-support"`,
/// `"terminated"`, ...).
#[derive(Debug, Clone)]
pub struct SshResult {
    pub problem: Option<String>,
}

/// A successfully authenticated SSH connection, kept alive past the
/// `SshAuthTransport` that produced it so the caller can wire it up as the
/// session's transport. Mirrors `cockpit_ssh_transport`'s ownership of its
/// connection once `cockpit_ssh_connect` succeeds: the connection outlives
/// the login dialogue that established it.
pub struct SshSessionHandle {
    handle: Handle<IgnoreHostKey>,
}

impl SshSessionHandle {
    fn new(handle: Handle<IgnoreHostKey>) -> Self {
        Self { handle }
    }

    /// Tears down the underlying SSH connection. Called by whatever owns
    /// the live session once it's done with it.
    pub async fn disconnect(mut self) -> Result<(), SshClientError> {
        self.handle.disconnect(Disconnect::ByApplication, "", "en").await?;
        Ok(())
    }
}

/// Drives one password-authenticated SSH connection attempt in the
/// background and reports its outcome. Only password authentication is
/// supported — that's all `RemoteMethod` ever uses. On success, the
/// connected [`Handle`] is stashed in `session` rather than dropped at the
/// end of the background task, so `take_session` can hand it to the caller
/// once `result()` has reported success.
pub struct SshAuthTransport {
    result_rx: mpsc::UnboundedReceiver<SshResult>,
    session: Arc<Mutex<Option<Handle<IgnoreHostKey>>>>,
}

impl SshAuthTransport {
    pub fn connect(host: String, port: u16, username: String, password: Secret<String>, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Mutex::new(None));
        let session_slot = session.clone();
        tokio::spawn(async move {
            let outcome = tokio::time::timeout(timeout, Self::authenticate(&host, port, &username, &password)).await;
            let result = match outcome {
                Ok(Ok(handle)) => {
                    *session_slot.lock().await = Some(handle);
                    SshResult { problem: None }
                }
                Ok(Err(e)) => {
                    debug!(%host, port, error = %e, "SSH authentication did not succeed");
                    SshResult {
                        problem: Some(classify(&e)),
                    }
                }
                Err(_) => SshResult {
                    problem: Some("terminated".to_string()),
                },
            };
            let _ = tx.send(result);
        });
        Self { result_rx: rx, session }
    }

    /// Connects and attempts password auth, returning the live `Handle` on
    /// success so the caller can keep the connection open. On failure,
    /// distinguishes "the server never offered password auth at all" from
    /// "password auth was offered but these credentials were rejected" by
    /// checking whether `Password` is still among the methods the server
    /// will accept — mirroring `on_remote_login_done`'s inspection of
    /// `cockpit_ssh_transport_get_auth_method_results` in the original.
    async fn authenticate(host: &str, port: u16, username: &str, password: &Secret<String>) -> Result<Handle<IgnoreHostKey>, SshClientError> {
        let config = Arc::new(client::Config::default());
        let mut handle: Handle<IgnoreHostKey> = client::connect(config, (host, port), IgnoreHostKey).await?;
        match handle.authenticate_password(username, password.expose_secret()).await? {
            client::AuthResult::Success => Ok(handle),
            client::AuthResult::Failure { remaining_methods, .. } => {
                if remaining_methods.contains(MethodSet::PASSWORD) {
                    Err(SshClientError::Authentication("authentication-failed".to_string()))
                } else {
                    Err(SshClientError::Authentication("no-server-support".to_string()))
                }
            }
        }
    }

    /// Awaits the connection's terminal result. Returns `None` once the
    /// background task has reported (a second call after that returns
    /// `None` immediately).
    pub async fn result(&mut self) -> Option<SshResult> {
        self.result_rx.recv().await
    }

    /// Takes ownership of the connected session once `result()` has
    /// reported success. Returns `None` before that, or if called more
    /// than once, or if authentication didn't succeed.
    pub async fn take_session(&self) -> Option<SshSessionHandle> {
        self.session.lock().await.take().map(SshSessionHandle::new)
    }
}

fn classify(err: &SshClientError) -> String {
    match err {
        SshClientError::Authentication(problem) => problem.clone(),
        _ => "terminated".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_authentication_errors_by_problem() {
        assert_eq!(classify(&SshClientError::Authentication("no-server-support".to_string())), "no-server-support");
        assert_eq!(classify(&SshClientError::Authentication("authentication-failed".to_string())), "authentication-failed");
    }

    #[test]
    fn classifies_other_errors_as_terminated() {
        assert_eq!(classify(&SshClientError::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom"))), "terminated");
    }
}
