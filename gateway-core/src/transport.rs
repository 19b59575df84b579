use gateway_ssh::SshSessionHandle;
use tokio::process::{ChildStdin, ChildStdout};

/// The still-live backend connection a successful dialogue hands off to
/// its caller. Ownership is total: the caller is responsible for wiring
/// this into a [`crate::session::WebService`] (or dropping it, which tears
/// down the child/connection it wraps).
pub enum SessionTransport {
    /// A spawned helper's stdin/stdout, detached from the process-table
    /// bookkeeping `SpawnMethod` used during the auth dialogue itself.
    LocalPipe(LocalPipeTransport),
    /// A connected, password-authenticated SSH session.
    Ssh(SshSessionHandle),
}

/// The spawned helper's stdio, handed off once the dialogue that spawned
/// it succeeds. fd 3 (the auth pipe) played no further part once this
/// exists — session data now flows over stdin/stdout, as the original's
/// helper protocol expects once login completes.
pub struct LocalPipeTransport {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub pid: u32,
}
