use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use gateway_common::config::{GatewayConfig, MaxStartups};
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::admission::Admission;
use crate::chooser::{self, ChosenMethod};
use crate::creds::CredsHandle;
use crate::error::AuthError;
use crate::header::parse_authorization_type;
use crate::methods::spawn::{SpawnStateHandle, SpawnVariant};
use crate::methods::remote::RemoteStateHandle;
use crate::methods::{none, remote, spawn, BeginContext};
use crate::nonce::NonceSource;
use crate::pending::{PendingDialogue, PendingTable};
use crate::protocol;
use crate::resume;
use crate::session::{self, AuthenticatedSession, SessionTable, WebService};
use crate::transport::SessionTransport;

/// Method-specific private state carried alongside a [`PendingDialogue`]
/// between `login_begin`/resume and `login_finish`, keeping the discriminant
/// that tells `login_finish` which result parser to invoke — the role
/// `PendingDialogue.method_tag` plays in the data model.
#[derive(Clone)]
pub enum MethodState {
    Spawn(SpawnStateHandle),
    Remote(RemoteStateHandle),
}

/// Everything `login_begin` (or a resumed prompt) hands back to the caller:
/// the dialogue, the receiving half of its current completion, and the
/// method state `login_finish` needs to parse the eventual result.
pub struct LoginAttempt {
    dialogue: PendingDialogue,
    completion: tokio::sync::oneshot::Receiver<Option<AuthError>>,
    state: MethodState,
}

/// What a successful `login_finish` produces: the credentials, the cookie to
/// hand back to the client, and the two response headers the core computes.
/// Attaching the credentials to a live session (constructing the
/// [`WebService`] and calling [`Manager::register_session`]) is the caller's
/// job — building that object is explicitly out of this core's scope.
pub struct LoginSuccess {
    pub creds: CredsHandle,
    pub cookie: String,
    pub set_cookie_header: String,
    pub negotiate_header: Option<String>,
    /// The still-live backend connection the dialogue produced, if its
    /// method surfaces one. Wiring this into a `WebService` and calling
    /// [`Manager::register_session`] is the caller's job.
    pub transport: Option<SessionTransport>,
}

/// The dialogue-parking tables, split out of `Manager` so a background
/// cleanup task can hold its own `Arc` to them independent of `Manager`'s
/// own lifetime.
struct PendingTables {
    pending: Mutex<PendingTable>,
    /// Method state for dialogues currently parked in `pending`, keyed the
    /// same way. Populated when a prompt is issued, removed when resumed
    /// or purged.
    method_states: Mutex<HashMap<String, MethodState>>,
}

impl PendingTables {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(PendingTable::new()),
            method_states: Mutex::new(HashMap::new()),
        })
    }

    /// Removes a dialogue id from both tables. A no-op if the id was never
    /// parked (the common case: most dialogues finish without a prompt) or
    /// was already removed by a resume.
    async fn purge(&self, id: &str) {
        self.pending.lock().await.remove(id);
        self.method_states.lock().await.remove(id);
    }
}

/// The authentication manager facade: `login_begin` / `login_finish` /
/// `check_cookie`, plus the session table and its idle/idling bookkeeping.
pub struct Manager {
    config: GatewayConfig,
    nonces: NonceSource,
    admission: Admission,
    /// Process-wide sticky flag: once a `negotiate` attempt reports
    /// `authentication-unavailable`, later attempts skip the helper.
    gssapi_not_avail: AtomicBool,
    sessions: Mutex<SessionTable>,
    tables: Arc<PendingTables>,
    /// Fed a dialogue's id whenever its pipe-driving task ends, win or
    /// lose; the background task draining this purges that id out of
    /// `tables`, so a dialogue parked after a prompt that's then abandoned
    /// (timeout or close with no resume) doesn't linger forever.
    cleanup_tx: mpsc::UnboundedSender<String>,
    process_idle_timer: Mutex<Option<JoinHandle<()>>>,
    /// Notified when both `sessions` and `pending` are empty and the
    /// process-idle timer fires. Purely informational — nothing is killed.
    idling: Notify,
}

impl Manager {
    pub fn new(config: GatewayConfig) -> Self {
        let limits = MaxStartups::parse(config.max_startups.as_deref());
        let tables = PendingTables::new();
        let (cleanup_tx, mut cleanup_rx) = mpsc::unbounded_channel::<String>();
        let cleanup_tables = tables.clone();
        tokio::spawn(async move {
            while let Some(id) = cleanup_rx.recv().await {
                cleanup_tables.purge(&id).await;
            }
        });
        Self {
            config,
            nonces: NonceSource::new(),
            admission: Admission::new(limits),
            gssapi_not_avail: AtomicBool::new(false),
            sessions: Mutex::new(SessionTable::new()),
            tables,
            cleanup_tx,
            process_idle_timer: Mutex::new(None),
            idling: Notify::new(),
        }
    }

    /// Notified (via `notified().await`) when the gateway has nothing in
    /// flight and nothing authenticated.
    pub fn idling(&self) -> &Notify {
        &self.idling
    }

    /// Begins an authentication attempt. `auth_header` is the raw
    /// `Authorization` request header value, if any; a missing header is
    /// treated as type `negotiate`. Increments the admission counter and, if
    /// admission or dispatch fails before a dialogue exists, decrements it
    /// again before returning — there is no matching `login_finish` call in
    /// that case.
    pub async fn login_begin(
        &self,
        path: &str,
        auth_header: Option<&str>,
        remote_peer: Option<String>,
    ) -> Result<LoginAttempt, AuthError> {
        self.admission.begin();
        if !self.admission.can_start() {
            self.admission.finish();
            return Err(AuthError::connection_closed_by_host());
        }

        match self.dispatch(path, auth_header, remote_peer).await {
            Ok(attempt) => Ok(attempt),
            Err(e) => {
                self.admission.finish();
                Err(e)
            }
        }
    }

    async fn dispatch(
        &self,
        path: &str,
        auth_header: Option<&str>,
        remote_peer: Option<String>,
    ) -> Result<LoginAttempt, AuthError> {
        let auth_type = auth_header
            .and_then(parse_authorization_type)
            .unwrap_or_else(|| "negotiate".to_string());

        if auth_type == "x-login-reply" {
            let header = auth_header.ok_or_else(|| AuthError::authentication_failed("Invalid resume token"))?;
            let (dialogue, completion) = {
                let mut pending = self.tables.pending.lock().await;
                resume::dispatch(header, &mut pending).await?
            };
            let id = dialogue.lock().await.id.clone();
            let state = self
                .tables
                .method_states
                .lock()
                .await
                .remove(&id)
                .ok_or_else(|| AuthError::Failed("lost method state for resumed dialogue".to_string()))?;
            return Ok(LoginAttempt { dialogue, completion, state });
        }

        let chosen = chooser::choose(&auth_type, self.config.login_loopback, &self.config);
        let ctx = BeginContext {
            auth_type: &auth_type,
            authorization_header: auth_header,
            path,
            remote_peer,
            config: &self.config,
            cleanup_tx: self.cleanup_tx.clone(),
        };

        match chosen {
            ChosenMethod::SpawnWithHeader => {
                let (result, state) = spawn::begin(ctx, SpawnVariant::WithHeader, &self.gssapi_not_avail, &self.nonces).await?;
                Ok(LoginAttempt {
                    dialogue: result.dialogue,
                    completion: result.completion,
                    state: MethodState::Spawn(state),
                })
            }
            ChosenMethod::SpawnWithDecoded => {
                let (result, state) = spawn::begin(ctx, SpawnVariant::WithDecoded, &self.gssapi_not_avail, &self.nonces).await?;
                Ok(LoginAttempt {
                    dialogue: result.dialogue,
                    completion: result.completion,
                    state: MethodState::Spawn(state),
                })
            }
            ChosenMethod::RemoteLoginSsh => {
                let (result, state) = remote::begin(ctx, &self.nonces).await?;
                Ok(LoginAttempt {
                    dialogue: result.dialogue,
                    completion: result.completion,
                    state: MethodState::Remote(state),
                })
            }
            ChosenMethod::XLoginReply => unreachable!("handled above"),
            ChosenMethod::None => Err(none::begin().expect_err("NoneMethod always rejects")),
        }
    }

    /// Awaits the dialogue's completion and parses the result. On a prompt,
    /// the dialogue and its method state are parked so a follow-up
    /// `Authorization: X-Login-Reply` can resume them; always decrements the
    /// admission counter, regardless of outcome.
    pub async fn login_finish(&self, attempt: LoginAttempt) -> Result<LoginSuccess, AuthError> {
        self.admission.finish();

        let id = attempt.dialogue.lock().await.id.clone();

        match attempt.completion.await {
            Ok(None) => {}
            Ok(Some(err)) => return Err(err),
            Err(_) => return Err(AuthError::Failed("dialogue completion was dropped".to_string())),
        }

        let response = attempt.dialogue.lock().await.take_response();
        let negotiate_header = response
            .as_deref()
            .and_then(|b| protocol::parse_helper_response_raw(b).ok())
            .and_then(|r| protocol::negotiate_challenge_header(r.gssapi_output.as_deref()));

        let result = match &attempt.state {
            MethodState::Spawn(state) => spawn::finish(response, state, &self.gssapi_not_avail, &self.nonces).await,
            MethodState::Remote(state) => remote::finish(response, state).await,
        };

        match result {
            Ok((creds, transport)) => {
                let application = creds.application.clone();
                let cookie = session::make_cookie(&self.nonces.next());
                let set_cookie_header = session::set_cookie_header(&application, &cookie, !self.config.cookie_insecure);
                Ok(LoginSuccess {
                    creds: creds.into_handle(),
                    cookie,
                    set_cookie_header,
                    negotiate_header,
                    transport,
                })
            }
            Err(AuthError::AuthenticationFailed { message, prompt: Some(mut prompt) }) => {
                prompt.id = id.clone();
                self.tables.pending.lock().await.insert(id.clone(), attempt.dialogue.clone());
                self.tables.method_states.lock().await.insert(id, attempt.state.clone());
                Err(AuthError::AuthenticationFailed { message, prompt: Some(prompt) })
            }
            Err(other) => Err(other),
        }
    }

    /// Looks up the live session for an incoming request's cookie.
    pub async fn check_cookie(&self, path: &str, cookie_header: Option<&str>) -> Option<Arc<dyn WebService>> {
        let sessions = self.sessions.lock().await;
        session::check_cookie(&sessions, path, cookie_header)
    }

    /// Registers a freshly authenticated session: inserts it keyed by
    /// `cookie`, starts its initial idle timer, and spawns a task that
    /// watches the service's `idling`/`destroyed` signals for the session's
    /// lifetime. Requires `Arc<Manager>` since the watcher task outlives this
    /// call.
    pub async fn register_session(self: &Arc<Self>, cookie: String, creds: CredsHandle, service: Arc<dyn WebService>) {
        let events = service.events();
        let session = AuthenticatedSession {
            cookie: cookie.clone(),
            creds,
            service,
            idle_timer: None,
        };
        self.sessions.lock().await.insert(cookie.clone(), session);
        self.on_idling(&cookie).await;

        let manager = self.clone();
        tokio::spawn(Self::watch_session(manager, cookie, events));
    }

    async fn watch_session(self_arc: Arc<Manager>, cookie: String, mut events: broadcast::Receiver<session::ServiceEvent>) {
        loop {
            match events.recv().await {
                Ok(session::ServiceEvent::Idling) => self_arc.on_idling(&cookie).await,
                Ok(session::ServiceEvent::Destroyed) => {
                    self_arc.remove_session(&cookie).await;
                    return;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    self_arc.remove_session(&cookie).await;
                    return;
                }
            }
        }
    }

    /// Cancels and restarts the session's per-session idle timer, and resets
    /// the process-wide idle timer. Called once when the session is
    /// registered and again every time the service reports idling.
    async fn on_idling(self: &Arc<Self>, cookie: &str) {
        let manager = self.clone();
        let cookie_owned = cookie.to_string();
        let session_idle = self.config.session_idle;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(session_idle).await;
            manager.on_session_timeout(&cookie_owned).await;
        });

        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(cookie) {
            Some(session) => {
                if let Some(old) = session.idle_timer.replace(handle) {
                    old.abort();
                }
            }
            None => handle.abort(),
        }
        drop(sessions);

        self.reset_process_idle_timer().await;
    }

    async fn on_session_timeout(self: &Arc<Self>, cookie: &str) {
        let still_idling = {
            let sessions = self.sessions.lock().await;
            sessions.get(cookie).map(|s| s.service.is_idling()).unwrap_or(false)
        };
        if still_idling {
            debug!(cookie, "session idle timeout, removing");
            self.remove_session(cookie).await;
        }
    }

    async fn remove_session(&self, cookie: &str) {
        self.sessions.lock().await.remove(cookie);
    }

    async fn reset_process_idle_timer(self: &Arc<Self>) {
        let manager = self.clone();
        let process_idle = self.config.process_idle;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(process_idle).await;
            manager.maybe_signal_idling().await;
        });
        let mut guard = self.process_idle_timer.lock().await;
        if let Some(old) = guard.replace(handle) {
            old.abort();
        }
    }

    async fn maybe_signal_idling(&self) {
        let sessions_empty = self.sessions.lock().await.is_empty();
        let pending_empty = self.tables.pending.lock().await.is_empty();
        if sessions_empty && pending_empty {
            self.idling.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_common::config::AuthTypeConfig;

    fn config_with_none_type() -> GatewayConfig {
        let mut cfg = GatewayConfig::default();
        cfg.auth_types.insert(
            "weird".to_string(),
            AuthTypeConfig {
                action: Some("none".to_string()),
                ..Default::default()
            },
        );
        cfg
    }

    #[tokio::test]
    async fn unconfigured_type_is_rejected_without_admission_leak() {
        let manager = Manager::new(config_with_none_type());
        let err = manager
            .login_begin("/cockpit", Some("Weird xyz"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AuthenticationRequired));
        assert_eq!(manager.admission.current(), 0);
    }

    #[tokio::test]
    async fn admission_drop_is_connection_closed_by_host() {
        let mut cfg = GatewayConfig::default();
        cfg.max_startups = Some("1:100:1".to_string());
        let manager = Manager::new(cfg);
        manager.admission.begin();
        manager.admission.begin();
        let err = manager.login_begin("/cockpit", Some("Weird xyz"), None).await.unwrap_err();
        assert!(matches!(err, AuthError::Failed(msg) if msg == "Connection closed by host"));
    }

    #[tokio::test]
    async fn resume_with_unknown_id_is_invalid_token() {
        let manager = Manager::new(GatewayConfig::default());
        let err = manager
            .login_begin("/cockpit", Some("X-Login-Reply deadbeef dGVzdA=="), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AuthenticationFailed { message, .. } if message == "Invalid resume token"));
    }
}
