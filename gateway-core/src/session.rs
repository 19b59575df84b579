use std::collections::HashMap;
use std::sync::Arc;

use data_encoding::BASE64;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::creds::CredsHandle;

/// Signals a [`WebService`] emits to the session that owns it. The core
/// only ever observes these — it never drives the service's lifecycle
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEvent {
    Idling,
    Destroyed,
}

/// The external "web service" object that owns a live client session. The
/// authentication core never constructs or controls one directly; it
/// holds a reference, watches its `idling`/`destroyed` signal, and asks
/// whether it's still idling when a per-session timer fires.
pub trait WebService: Send + Sync {
    fn is_idling(&self) -> bool;
    fn events(&self) -> broadcast::Receiver<ServiceEvent>;
}

/// A post-authentication binding of `Creds` to a live backend transport,
/// identified by `cookie`. `idle_timer` is the handle of the task counting
/// down this session's per-session idle expiry, cancelled and replaced
/// every time the service reports idling.
pub struct AuthenticatedSession {
    pub cookie: String,
    pub creds: CredsHandle,
    pub service: Arc<dyn WebService>,
    pub idle_timer: Option<JoinHandle<()>>,
}

impl Drop for AuthenticatedSession {
    fn drop(&mut self) {
        if let Some(handle) = self.idle_timer.take() {
            handle.abort();
        }
    }
}

/// Cookie → session; insertion/removal owned exclusively by `Manager`.
pub type SessionTable = HashMap<String, AuthenticatedSession>;

pub const COOKIE_VERSION_PREFIX: &str = "v=2;k=";

/// Builds the raw (undecoded) cookie value `v=2;k=<nonce>`.
pub fn make_cookie(nonce: &str) -> String {
    format!("{COOKIE_VERSION_PREFIX}{nonce}")
}

/// Validates that a raw cookie value has the expected version prefix.
pub fn is_valid_cookie(raw: &str) -> bool {
    raw.starts_with(COOKIE_VERSION_PREFIX) && raw.len() > COOKIE_VERSION_PREFIX.len()
}

/// Builds the `Set-Cookie` response header value for a freshly authenticated
/// session.
pub fn set_cookie_header(application: &str, cookie: &str, secure: bool) -> String {
    let encoded = BASE64.encode(cookie.as_bytes());
    if secure {
        format!("{application}={encoded}; Path=/; Secure; HttpOnly")
    } else {
        format!("{application}={encoded}; Path=/; HttpOnly")
    }
}

/// Parses the application name from a request path: `/cockpit+<suffix>/...`
/// yields `cockpit+<suffix>`; anything else yields the literal `cockpit`.
pub fn parse_application(path: &str) -> String {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let first_segment = trimmed.split('/').next().unwrap_or("");
    if let Some(suffix) = first_segment.strip_prefix("cockpit+") {
        if !suffix.is_empty() {
            return first_segment.to_string();
        }
    }
    "cockpit".to_string()
}

/// Parses an HTTP `Cookie:` header value (`a=b; c=d`) into name/value pairs.
fn parse_cookie_pairs(header: &str) -> HashMap<&str, &str> {
    header
        .split(';')
        .filter_map(|part| {
            let part = part.trim();
            let (name, value) = part.split_once('=')?;
            Some((name.trim(), value.trim()))
        })
        .collect()
}

/// Looks up the authenticated session for a request: finds the
/// application-named cookie, base64-decodes it, checks the version prefix,
/// and returns a fresh reference to the session's web service.
pub fn check_cookie(table: &SessionTable, path: &str, cookie_header: Option<&str>) -> Option<Arc<dyn WebService>> {
    let application = parse_application(path);
    let cookie_header = cookie_header?;
    let pairs = parse_cookie_pairs(cookie_header);
    let raw_value = pairs.get(application.as_str())?;
    let decoded = BASE64.decode(raw_value.as_bytes()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    if !is_valid_cookie(&decoded) {
        return None;
    }
    table.get(&decoded).map(|session| session.service.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_from_suffixed_path() {
        assert_eq!(parse_application("/cockpit+foo/bar"), "cockpit+foo");
    }

    #[test]
    fn application_defaults_to_cockpit() {
        assert_eq!(parse_application("/something/else"), "cockpit");
        assert_eq!(parse_application("/cockpit+/bar"), "cockpit");
        assert_eq!(parse_application("/"), "cockpit");
    }

    #[test]
    fn cookie_round_trips_through_base64() {
        let cookie = make_cookie("abc123");
        let header = set_cookie_header("cockpit", &cookie, true);
        assert!(header.starts_with("cockpit="));
        assert!(header.contains("Secure"));
        let encoded = header.split('=').nth(1).unwrap().split(';').next().unwrap();
        let decoded = BASE64.decode(encoded.as_bytes()).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), cookie);
    }

    #[test]
    fn insecure_cookie_omits_secure_flag() {
        let header = set_cookie_header("cockpit", &make_cookie("abc"), false);
        assert!(!header.contains("Secure"));
    }

    #[test]
    fn valid_cookie_requires_version_prefix() {
        assert!(is_valid_cookie("v=2;k=abc"));
        assert!(!is_valid_cookie("v=1;k=abc"));
        assert!(!is_valid_cookie("v=2;k="));
    }
}
