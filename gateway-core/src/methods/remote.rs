use gateway_common::config::clamp_timeout;
use gateway_common::Secret;
use gateway_ssh::{SshAuthTransport, SshSessionHandle};
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::creds::Creds;
use crate::error::AuthError;
use crate::header::parse_authorization;
use crate::methods::{BeginContext, BeginResult};
use crate::nonce::NonceSource;
use crate::pending::{new_dialogue, MethodTag, PendingDialogue};
use crate::pipe::AuthPipe;
use crate::protocol::{parse_helper_response, HelperOutcome};
use crate::session::parse_application;
use crate::transport::SessionTransport;

/// Method-private state for a remote (SSH) dialogue. `has_transport_result`
/// mirrors the original's flag of the same name: once the SSH transport
/// reports a terminal outcome, that's authoritative and any later helper
/// pipe message (there shouldn't be one) is moot. `ssh_session` is filled
/// in alongside `has_transport_result` when that outcome is success, so
/// `finish` can hand the still-connected session off as a transport.
pub struct RemoteState {
    pub creds: Creds,
    pub has_transport_result: bool,
    pub ssh_session: Option<SshSessionHandle>,
}

pub type RemoteStateHandle = std::sync::Arc<Mutex<RemoteState>>;

/// Begins a remote-login (SSH) dialogue. Only `basic` is supported; any
/// other type is rejected immediately, since there's no helper dialogue to
/// fall back to.
pub async fn begin(
    ctx: BeginContext<'_>,
    nonces: &NonceSource,
) -> Result<(BeginResult, RemoteStateHandle), AuthError> {
    if ctx.auth_type != "basic" {
        return Err(AuthError::AuthenticationRequired);
    }

    let payload = ctx
        .authorization_header
        .and_then(|h| parse_authorization(h, true))
        .ok_or(AuthError::AuthenticationRequired)?;
    let decoded = payload.into_bytes();
    let text = String::from_utf8(decoded).map_err(|_| AuthError::AuthenticationRequired)?;
    let (user, password) = text.split_once(':').ok_or(AuthError::AuthenticationRequired)?;

    let application = parse_application(ctx.path);
    let creds = Creds::new(user, application, nonces.next())
        .with_remote_peer(ctx.remote_peer.clone())
        .with_password(Secret::new(password.to_string()));

    let ssh_config = &ctx.config.remote_login_ssh;
    let type_config = ctx.config.auth_type(ctx.auth_type);
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
    let dialogue = new_dialogue(id, MethodTag::Remote);

    let (pipe_parent, _pipe_child) = tokio::io::duplex(4096);
    let pipe: AuthPipe<tokio::io::DuplexStream> = AuthPipe::new(pipe_parent, process_timeout);
    let (resume_tx, resume_rx) = mpsc::unbounded_channel();

    let completion = {
        let mut inner = dialogue.lock().await;
        inner.set_resume_channel(resume_tx);
        inner.add_completion()
    };

    tokio::spawn(crate::pipe::drive(pipe, dialogue.clone(), resume_rx, response_timeout, ctx.cleanup_tx.clone()));

    let mut transport = SshAuthTransport::connect(
        ssh_config.host.clone(),
        ssh_config.port,
        user.to_string(),
        Secret::new(password.to_string()),
        process_timeout,
    );

    let state: RemoteStateHandle = std::sync::Arc::new(Mutex::new(RemoteState {
        creds,
        has_transport_result: false,
        ssh_session: None,
    }));

    let transport_dialogue = dialogue.clone();
    let transport_state = state.clone();
    tokio::spawn(async move {
        if let Some(result) = transport.result().await {
            let succeeded = result.problem.is_none();
            let mut guard = transport_state.lock().await;
            guard.has_transport_result = true;
            if succeeded {
                guard.ssh_session = transport.take_session().await;
            }
            drop(guard);

            let error = result.problem.as_deref().map(map_transport_problem);
            transport_dialogue.lock().await.complete(error);
        }
    });

    Ok((BeginResult { dialogue, completion }, state))
}

fn map_transport_problem(problem: &str) -> AuthError {
    match problem {
        "no-server-support" => AuthError::authentication_failed("authentication-not-supported"),
        "authentication-failed" => AuthError::authentication_failed("authentication-failed"),
        "terminated" => AuthError::authentication_failed("terminated"),
        other => AuthError::Failed(format!("Couldn't connect or authenticate: {other}")),
    }
}

/// Finishes a remote dialogue. If the SSH transport already delivered its
/// terminal result, the creds built at `begin` time are the answer, along
/// with the still-connected SSH session as the caller's transport. Else
/// the helper pipe produced a prompt (multi-factor flow), which is handled
/// exactly like `SpawnMethod`'s.
pub async fn finish(response: Option<Vec<u8>>, state: &RemoteStateHandle) -> Result<(Creds, Option<SessionTransport>), AuthError> {
    let mut guard = state.lock().await;
    if guard.has_transport_result {
        let mut creds = Creds::new(guard.creds.user.clone(), guard.creds.application.clone(), guard.creds.csrf_token.clone())
            .with_remote_peer(guard.creds.remote_peer.clone());
        if let Some(password) = guard.creds.password.clone() {
            creds = creds.with_password(password);
        }
        let transport = guard.ssh_session.take().map(SessionTransport::Ssh);
        return Ok((creds, transport));
    }
    drop(guard);

    let Some(bytes) = response else {
        return Err(AuthError::InvalidData("no reply from ssh helper".to_string()));
    };

    match parse_helper_response(&bytes) {
        Ok(HelperOutcome::Prompt(prompt)) => Err(AuthError::with_prompt("X-Login-Reply needed", prompt)),
        Ok(_) => Err(AuthError::InvalidData("unexpected helper reply for SSH prompt".to_string())),
        Err(e) => {
            warn!(error = %e, "malformed SSH prompt payload");
            Err(AuthError::InvalidData(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_no_server_support() {
        assert!(matches!(
            map_transport_problem("no-server-support"),
            AuthError::AuthenticationFailed { message, .. } if message == "authentication-not-supported"
        ));
    }

    #[test]
    fn maps_unknown_problem_to_failed() {
        assert!(matches!(map_transport_problem("disconnect"), AuthError::Failed(_)));
    }
}
