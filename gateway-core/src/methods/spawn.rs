use std::os::fd::IntoRawFd;
use std::process::Stdio;

use gateway_common::config::clamp_timeout;
use gateway_common::Secret;
use serde_json::Value;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::creds::Creds;
use crate::error::AuthError;
use crate::header::{parse_authorization, AuthPayload};
use crate::methods::{BeginContext, BeginResult};
use crate::nonce::NonceSource;
use crate::pending::{new_dialogue, MethodTag, PendingDialogue};
use crate::pipe::AuthPipe;
use crate::protocol::{parse_helper_response, HelperOutcome};
use crate::session::parse_application;
use crate::transport::{LocalPipeTransport, SessionTransport};

/// Whether the `Authorization` payload should be base64-decoded before it's
/// handed to the helper. The only behavioral difference between
/// `spawn-login-with-header` and `spawn-login-with-decoded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnVariant {
    WithHeader,
    WithDecoded,
}

impl SpawnVariant {
    fn decode_base64(self) -> bool {
        matches!(self, SpawnVariant::WithDecoded)
    }
}

/// Method-private state for a spawn dialogue. `child` is taken (and its PID
/// effectively zeroed, per the original's contract) once a local transport
/// takes ownership of its stdio on success, so teardown neither closes the
/// pipes nor kills a process a transport now owns.
pub struct SpawnState {
    pub child: Option<Child>,
    raw_authorization: Vec<u8>,
    pub auth_type: String,
    pub application: String,
    pub remote_peer: Option<String>,
    pub command: String,
}

impl Drop for SpawnState {
    fn drop(&mut self) {
        self.raw_authorization.zeroize();
        if let Some(child) = self.child.as_mut() {
            send_sigterm(child);
        }
    }
}

pub type SpawnStateHandle = std::sync::Arc<Mutex<SpawnState>>;

/// Begins a spawn dialogue: extracts the payload, spawns the configured
/// helper with the pipe's child end on fd 3, writes the payload, and
/// returns the dialogue plus its completion receiver. The caller awaits the
/// completion and then calls [`finish`].
pub async fn begin(
    ctx: BeginContext<'_>,
    variant: SpawnVariant,
    gssapi_not_avail: &std::sync::atomic::AtomicBool,
    nonces: &NonceSource,
) -> Result<(BeginResult, SpawnStateHandle), AuthError> {
    let payload = match ctx.authorization_header.and_then(|h| parse_authorization(h, variant.decode_base64())) {
        Some(p) => p,
        None if ctx.auth_type == "negotiate" && !gssapi_not_avail.load(std::sync::atomic::Ordering::SeqCst) => {
            AuthPayload::from_raw(Vec::new())
        }
        None => return Err(AuthError::AuthenticationRequired),
    };
    let raw_authorization = ctx
        .authorization_header
        .map(|h| h.as_bytes().to_vec())
        .unwrap_or_default();

    let application = parse_application(ctx.path);
    let type_config = ctx.config.auth_type(ctx.auth_type);
    let command = type_config
        .and_then(|t| t.command.clone())
        .unwrap_or_else(|| ctx.config.session_program.clone());
    let process_timeout = clamp_timeout(
        ctx.auth_type,
        "timeout",
        type_config.and_then(|t| t.timeout),
        ctx.config.auth_process_timeout,
    );
    let response_timeout = clamp_timeout(
        ctx.auth_type,
        "response-timeout",
        type_config.and_then(|t| t.response_timeout),
        ctx.config.auth_response_timeout,
    );

    let id = nonces.next();
    let dialogue = new_dialogue(id.clone(), MethodTag::Spawn);

    let (parent_sock, child_sock) = UnixStream::pair().map_err(|e| AuthError::Failed(format!("couldn't create auth pipe: {e}")))?;

    let child = spawn_helper(&command, ctx.auth_type, ctx.remote_peer.as_deref(), child_sock)
        .map_err(|e| AuthError::Failed(format!("Internal error starting {command}: {e}")))?;

    let pipe = AuthPipe::new(parent_sock, process_timeout);
    let (resume_tx, resume_rx) = mpsc::unbounded_channel();
    let _ = resume_tx.send(payload.into_bytes());

    let completion = {
        let mut inner = dialogue.lock().await;
        inner.set_resume_channel(resume_tx);
        inner.add_completion()
    };

    tokio::spawn(crate::pipe::drive(pipe, dialogue.clone(), resume_rx, response_timeout, ctx.cleanup_tx.clone()));

    let state = SpawnState {
        child: Some(child),
        raw_authorization,
        auth_type: ctx.auth_type.to_string(),
        application,
        remote_peer: ctx.remote_peer,
        command,
    };

    Ok((
        BeginResult { dialogue, completion },
        std::sync::Arc::new(Mutex::new(state)),
    ))
}

/// Spawns the helper with `child_sock` dup'd onto fd 3, as the child sees
/// it, and every other fd above 2 closed first. `dup2`/`close` run in the
/// forked child before `exec`, mirroring `spawn_child_setup` in the
/// original: only fd 3 (the pipe) survives into the helper besides
/// inherited stdio. stdin/stdout are piped rather than nulled so a
/// successful login can hand them off as the session's local transport
/// once fd 3's job is done.
fn spawn_helper(command: &str, auth_type: &str, remote_peer: Option<&str>, child_sock: UnixStream) -> std::io::Result<Child> {
    let std_sock = child_sock.into_std()?;
    std_sock.set_nonblocking(false)?;
    let raw_fd = std_sock.into_raw_fd();

    let mut cmd = Command::new(command);
    cmd.arg(auth_type).arg(remote_peer.unwrap_or(""));
    cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::inherit());

    // SAFETY: runs in the forked child before exec, single-threaded at that
    // point; only touches this process's own fd table.
    unsafe {
        cmd.pre_exec(move || {
            close_fds_except(3, raw_fd)?;
            if raw_fd != 3 {
                if libc::dup2(raw_fd, 3) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                libc::close(raw_fd);
            }
            Ok(())
        });
    }

    cmd.spawn()
}

/// Closes every fd in `[from, sysconf(_SC_OPEN_MAX))` except `keep`,
/// mirroring `cockpit_unix_fd_close_all(3, auth_fd)` in the original: fds
/// 0-2 (stdio) and `keep` (the auth pipe) are the only ones that reach the
/// helper's `exec`.
fn close_fds_except(from: libc::c_int, keep: libc::c_int) -> std::io::Result<()> {
    let open_max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let open_max = if open_max > 0 { open_max as libc::c_int } else { 1024 };
    for fd in from..open_max {
        if fd != keep {
            unsafe {
                libc::close(fd);
            }
        }
    }
    Ok(())
}

/// Finishes a spawn dialogue once its completion resolved: parses the
/// helper's reply and builds creds, a prompt, or an error. On success, also
/// detaches the still-live helper's stdin/stdout as a [`SessionTransport`]
/// and zeroes out `state.child` so the dialogue's teardown no longer kills
/// it — the caller now owns that process's lifetime.
pub async fn finish(
    response: Option<Vec<u8>>,
    state: &SpawnStateHandle,
    gssapi_not_avail: &std::sync::atomic::AtomicBool,
    nonces: &NonceSource,
) -> Result<(Creds, Option<SessionTransport>), AuthError> {
    let bytes = response.ok_or_else(|| AuthError::InvalidData("no reply from helper".to_string()))?;

    let outcome = parse_helper_response(&bytes).map_err(|e| {
        warn!(error = %e, "helper reply was not valid JSON");
        AuthError::InvalidData(e.to_string())
    })?;

    match outcome {
        HelperOutcome::Prompt(prompt) => Err(AuthError::with_prompt("X-Login-Reply needed", prompt)),
        HelperOutcome::Error { kind, message } => {
            let mut guard = state.lock().await;
            if kind == "authentication-unavailable" && guard.auth_type == "negotiate" {
                gssapi_not_avail.store(true, std::sync::atomic::Ordering::SeqCst);
                debug!("negotiate authentication is unavailable, will skip helper for future attempts");
            }
            if let Some(child) = guard.child.as_mut() {
                send_sigterm(child);
            }
            Err(map_helper_error(&kind, &message))
        }
        HelperOutcome::Success(resp) => {
            let mut guard = state.lock().await;
            let user = resp.user.clone().ok_or_else(|| AuthError::InvalidData("missing user".to_string()))?;

            let mut creds = Creds::new(user, guard.application.clone(), nonces.next())
                .with_remote_peer(guard.remote_peer.clone())
                .with_gssapi_creds(resp.gssapi_creds.clone());

            let mut login_data = resp.login_data.clone();
            if let Some(Value::Object(ref mut map)) = login_data {
                map.remove("gssapi-creds");
                map.remove("gssapi-output");
            }
            creds = creds.with_login_data(login_data);

            if guard.auth_type == "basic" {
                if let Some(password) = extract_password(&guard.raw_authorization) {
                    creds = creds.with_password(password);
                }
            }

            let transport = detach_transport(&mut guard);
            Ok((creds, transport))
        }
    }
}

/// Takes the child out of `SpawnState`, along with its stdin/stdout and
/// pid, and wraps them as a [`SessionTransport::LocalPipe`]. Leaves
/// `state.child` as `None`, so neither `Drop` nor a later teardown call
/// sends the helper a signal meant for a process nobody owns anymore. If
/// the child's stdio was already taken, or it's gone, returns `None` —
/// there's nothing to detach.
fn detach_transport(state: &mut SpawnState) -> Option<SessionTransport> {
    let mut child = state.child.take()?;
    let pid = child.id()?;
    let stdin = child.stdin.take()?;
    let stdout = child.stdout.take()?;
    // The `Child` handle itself is no longer needed: its stdio is already
    // moved out above, and its pid is recorded. We deliberately don't wait()
    // on it here — the caller now owns the process via the piped stdio, and
    // tokio's background reaper collects it once it exits on its own.
    Some(SessionTransport::LocalPipe(LocalPipeTransport { stdin, stdout, pid }))
}

/// Recovers the password from the raw `Authorization: Basic <b64>` header
/// this dialogue was started with, rather than trusting anything the
/// helper echoed back.
fn extract_password(raw_header: &[u8]) -> Option<Secret<String>> {
    let header = std::str::from_utf8(raw_header).ok()?;
    let payload = parse_authorization(header, true)?;
    let decoded = payload.into_bytes();
    let text = String::from_utf8(decoded).ok()?;
    let (_user, password) = text.split_once(':')?;
    Some(Secret::new(password.to_string()))
}

fn map_helper_error(kind: &str, message: &str) -> AuthError {
    match kind {
        "authentication-failed" => AuthError::authentication_failed(message),
        "permission-denied" => AuthError::PermissionDenied,
        other => AuthError::Failed(format!("{other}: {message}")),
    }
}

/// Sends `SIGTERM` to a still-running child. Used both from `finish`'s
/// error arm and `SpawnState`'s `Drop`, so a helper is reliably signalled
/// whether the dialogue ends in an error or is simply abandoned.
fn send_sigterm(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is this child's own pid, obtained from the `Child`
        // handle we still own.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_variant_decodes_only_when_decoded() {
        assert!(!SpawnVariant::WithHeader.decode_base64());
        assert!(SpawnVariant::WithDecoded.decode_base64());
    }

    #[test]
    fn extracts_password_from_basic_header() {
        let header = "Basic dXNlcjpodW50ZXIy"; // user:hunter2
        let secret = extract_password(header.as_bytes()).unwrap();
        assert_eq!(secret.expose_secret(), "hunter2");
    }

    #[test]
    fn maps_known_error_kinds() {
        assert!(matches!(map_helper_error("authentication-failed", "bad"), AuthError::AuthenticationFailed { .. }));
        assert!(matches!(map_helper_error("permission-denied", ""), AuthError::PermissionDenied));
        assert!(matches!(map_helper_error("weird", "x"), AuthError::Failed(_)));
    }
}
