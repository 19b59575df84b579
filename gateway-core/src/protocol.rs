use data_encoding::{BASE64, HEXLOWER};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw shape of a helper reply, as described in the external interfaces
/// section: success carries `user`, a prompt carries `prompt`, a failure
/// carries `error`/`message`. All fields are optional on the wire because
/// which ones are present is what distinguishes the three cases.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct HelperResponse {
    pub user: Option<String>,
    #[serde(rename = "login-data", default, skip_serializing_if = "Option::is_none")]
    pub login_data: Option<Value>,
    #[serde(rename = "gssapi-creds", default, skip_serializing_if = "Option::is_none")]
    pub gssapi_creds: Option<String>,
    #[serde(rename = "gssapi-output", default, skip_serializing_if = "Option::is_none")]
    pub gssapi_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A helper-issued demand for more data from the user, carried back to the
/// HTTP layer via `WWW-Authenticate: X-Login-Reply`. `id` is filled in by the
/// manager once it knows which dialogue this prompt belongs to; `classify`
/// below leaves it blank.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PromptData {
    pub prompt: String,
    #[serde(default)]
    pub id: String,
}

/// Builds the `WWW-Authenticate: X-Login-Reply <id> <base64(prompt)>` header
/// value for a pending prompt.
pub fn format_prompt_header(id: &str, prompt: &str) -> String {
    format!("X-Login-Reply {id} {}", BASE64.encode(prompt.as_bytes()))
}

/// Builds the `WWW-Authenticate: Negotiate ...` header from a helper's
/// hex-encoded `gssapi-output`, or bare `Negotiate` if the decoded output is
/// empty. `None` if the helper didn't return one.
pub fn negotiate_challenge_header(gssapi_output_hex: Option<&str>) -> Option<String> {
    let hex = gssapi_output_hex?;
    let decoded = HEXLOWER.decode(hex.as_bytes()).ok()?;
    if decoded.is_empty() {
        Some("Negotiate".to_string())
    } else {
        Some(format!("Negotiate {}", BASE64.encode(&decoded)))
    }
}

/// What a parsed helper reply means to the method that requested it.
#[derive(Debug)]
pub enum HelperOutcome {
    Success(HelperResponse),
    Prompt(PromptData),
    Error { kind: String, message: String },
}

/// Parses the helper's raw JSON bytes and classifies it into success,
/// prompt, or error. Non-UTF-8 or non-JSON bytes are the caller's
/// responsibility to map to `AuthError::InvalidData`.
pub fn parse_helper_response(bytes: &[u8]) -> Result<HelperOutcome, serde_json::Error> {
    let raw = parse_helper_response_raw(bytes)?;
    Ok(classify(raw))
}

/// Parses the helper's raw JSON bytes without classifying them, for callers
/// that need fields `classify` doesn't surface (e.g. `gssapi-output`).
pub fn parse_helper_response_raw(bytes: &[u8]) -> Result<HelperResponse, serde_json::Error> {
    serde_json::from_slice(bytes)
}

pub(crate) fn classify(raw: HelperResponse) -> HelperOutcome {
    if let Some(error) = raw.error.clone() {
        return HelperOutcome::Error {
            kind: error,
            message: raw.message.clone().unwrap_or_default(),
        };
    }
    if raw.user.is_some() {
        return HelperOutcome::Success(raw);
    }
    if let Some(prompt) = raw.prompt.clone() {
        return HelperOutcome::Prompt(PromptData { prompt, id: String::new() });
    }
    HelperOutcome::Error {
        kind: "internal-error".to_string(),
        message: "helper reply had neither user, prompt, nor error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_success() {
        let outcome = parse_helper_response(br#"{"user":"joe"}"#).unwrap();
        assert!(matches!(outcome, HelperOutcome::Success(r) if r.user.as_deref() == Some("joe")));
    }

    #[test]
    fn parses_prompt() {
        let outcome = parse_helper_response(br#"{"prompt":"Token?"}"#).unwrap();
        assert!(matches!(outcome, HelperOutcome::Prompt(p) if p.prompt == "Token?"));
    }

    #[test]
    fn parses_error() {
        let outcome = parse_helper_response(br#"{"error":"authentication-failed","message":"bad"}"#).unwrap();
        match outcome {
            HelperOutcome::Error { kind, message } => {
                assert_eq!(kind, "authentication-failed");
                assert_eq!(message, "bad");
            }
            _ => panic!("expected error outcome"),
        }
    }

    #[test]
    fn invalid_json_is_deserialize_error() {
        assert!(parse_helper_response(b"not json").is_err());
    }

    #[test]
    fn shapeless_object_maps_to_internal_error() {
        let outcome = parse_helper_response(b"{}").unwrap();
        assert!(matches!(outcome, HelperOutcome::Error { kind, .. } if kind == "internal-error"));
    }

    #[test]
    fn prompt_header_encodes_base64_payload() {
        assert_eq!(format_prompt_header("abc123", "Token?"), "X-Login-Reply abc123 VG9rZW4/");
    }

    #[test]
    fn negotiate_header_is_bare_when_output_empty() {
        assert_eq!(negotiate_challenge_header(Some("")), Some("Negotiate".to_string()));
    }

    #[test]
    fn negotiate_header_encodes_decoded_output() {
        // hex "6869" -> b"hi" -> base64 "aGk="
        assert_eq!(negotiate_challenge_header(Some("6869")), Some("Negotiate aGk=".to_string()));
    }

    #[test]
    fn negotiate_header_absent_without_field() {
        assert_eq!(negotiate_challenge_header(None), None);
    }
}
