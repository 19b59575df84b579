use std::sync::Arc;

use gateway_common::Secret;
use serde_json::Value;

/// Authenticated identity produced by a successful dialogue. Immutable
/// after construction and shared (via [`CredsHandle`]) between the
/// session and whatever transport serves it. The password, if any, is
/// wiped from memory when the last handle is dropped — `Secret<String>`
/// zeroizes on `Drop`, so no explicit poisoning step is needed here.
#[derive(Debug)]
pub struct Creds {
    pub user: String,
    pub application: String,
    pub password: Option<Secret<String>>,
    /// Hex-encoded GSSAPI delegated credentials, if the helper returned any.
    pub gssapi_creds: Option<String>,
    pub remote_peer: Option<String>,
    pub csrf_token: String,
    /// The helper's raw success payload, sans the fields already lifted
    /// onto this struct (`user`, `gssapi-creds`, `gssapi-output`).
    pub login_data: Option<Value>,
}

pub type CredsHandle = Arc<Creds>;

impl Creds {
    pub fn new(
        user: impl Into<String>,
        application: impl Into<String>,
        csrf_token: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            application: application.into(),
            password: None,
            gssapi_creds: None,
            remote_peer: None,
            csrf_token: csrf_token.into(),
            login_data: None,
        }
    }

    pub fn with_password(mut self, password: Secret<String>) -> Self {
        self.password = Some(password);
        self
    }

    pub fn with_remote_peer(mut self, remote_peer: Option<String>) -> Self {
        self.remote_peer = remote_peer;
        self
    }

    pub fn with_gssapi_creds(mut self, gssapi_creds: Option<String>) -> Self {
        self.gssapi_creds = gssapi_creds;
        self
    }

    pub fn with_login_data(mut self, login_data: Option<Value>) -> Self {
        self.login_data = login_data;
        self
    }

    pub fn into_handle(self) -> CredsHandle {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_optional_fields() {
        let creds = Creds::new("alice", "cockpit", "deadbeef")
            .with_password(Secret::new("hunter2".to_string()))
            .with_remote_peer(Some("10.0.0.1".to_string()));
        assert_eq!(creds.user, "alice");
        assert_eq!(creds.remote_peer.as_deref(), Some("10.0.0.1"));
        assert_eq!(creds.password.unwrap().expose_secret(), "hunter2");
    }
}
