use data_encoding::BASE64;
use zeroize::Zeroize;

/// A decoded `Authorization` header payload. Wraps the raw bytes so the
/// buffer is wiped on drop; the header may carry a password.
pub struct AuthPayload(Vec<u8>);

impl AuthPayload {
    /// Builds a payload directly from already-decoded bytes. Used for the
    /// empty-negotiate-probe case (§4.5), which has no header to parse.
    pub(crate) fn from_raw(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(mut self) -> Vec<u8> {
        std::mem::take(&mut self.0)
    }
}

impl Drop for AuthPayload {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Extracts the lowercased scheme token from an `Authorization` header
/// (`"Basic ..."` -> `"basic"`) without touching the rest of the value.
/// Returns `None` if there's no scheme/space separator.
pub fn parse_authorization_type(header: &str) -> Option<String> {
    let line = header.trim_start_matches(' ');
    let space = line.find(' ')?;
    Some(line[..space].to_ascii_lowercase())
}

/// Splits an `Authorization` header into scheme and payload, optionally
/// base64-decoding the payload. Mirrors `cockpit_auth_parse_authorization`:
/// a malformed base64 payload is treated as "no header" rather than an
/// error, since the original silently drops it and falls through to the
/// next auth method.
pub fn parse_authorization(header: &str, base64_decode: bool) -> Option<AuthPayload> {
    let line = header.trim_start_matches(' ');
    let space = line.find(' ')?;
    let rest = line[space + 1..].trim_start_matches(' ');

    if base64_decode {
        let decoded = BASE64.decode(rest.as_bytes()).ok()?;
        Some(AuthPayload(decoded))
    } else {
        Some(AuthPayload(rest.as_bytes().to_vec()))
    }
}
