pub mod none;
pub mod remote;
pub mod spawn;

use gateway_common::config::GatewayConfig;
use tokio::sync::{mpsc, oneshot};

use crate::error::AuthError;
use crate::pending::PendingDialogue;

/// Everything a method needs out of the inbound request to begin a
/// dialogue.
pub struct BeginContext<'a> {
    pub auth_type: &'a str,
    pub authorization_header: Option<&'a str>,
    pub path: &'a str,
    pub remote_peer: Option<String>,
    pub config: &'a GatewayConfig,
    /// Fed the dialogue's id once its pipe-driving task ends, so the
    /// manager can purge it from its parked-dialogue tables if it got
    /// abandoned mid-prompt.
    pub cleanup_tx: mpsc::UnboundedSender<String>,
}

/// What `login_begin` hands back to the caller while the dialogue plays
/// out: the dialogue itself (so it can be registered or dropped) and the
/// receiving half of its single outstanding completion.
pub struct BeginResult {
    pub dialogue: PendingDialogue,
    pub completion: oneshot::Receiver<Option<AuthError>>,
}
