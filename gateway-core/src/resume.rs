use data_encoding::BASE64;
use tokio::sync::oneshot;

use crate::error::AuthError;
use crate::pending::{PendingDialogue, PendingTable};

/// Interprets an `Authorization: X-Login-Reply <id> <b64payload>` header
/// and feeds the decoded payload back into the matching pending dialogue,
/// continuing the multi-step exchange under its original `method_tag`.
///
/// The dialogue is removed from `table` as part of dispatching — a second
/// resume for the same `id` will find it gone and fail, same as the original.
pub async fn dispatch(
    header_value: &str,
    table: &mut PendingTable,
) -> Result<(PendingDialogue, oneshot::Receiver<Option<AuthError>>), AuthError> {
    let invalid = || AuthError::authentication_failed("Invalid resume token");

    let mut parts = header_value.split_whitespace();
    let (Some(_scheme), Some(id), Some(payload_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };

    let dialogue = table.remove(id).ok_or_else(invalid)?;

    if payload_b64.is_empty() {
        return Err(invalid());
    }
    let payload = BASE64.decode(payload_b64.as_bytes()).map_err(|_| invalid())?;
    if payload.is_empty() {
        return Err(invalid());
    }

    let rx = {
        let mut inner = dialogue.lock().await;
        let rx = inner.add_completion();
        if inner.resume(payload).is_err() {
            return Err(AuthError::Failed("dialogue is no longer accepting replies".to_string()));
        }
        rx
    };

    Ok((dialogue, rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::{new_dialogue, MethodTag};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn unknown_id_is_invalid_token() {
        let mut table = PendingTable::new();
        let err = dispatch("X-Login-Reply deadbeef dGVzdA==", &mut table).await.unwrap_err();
        assert!(matches!(err, AuthError::AuthenticationFailed { message, .. } if message == "Invalid resume token"));
    }

    #[tokio::test]
    async fn malformed_header_is_invalid_token() {
        let mut table = PendingTable::new();
        let err = dispatch("X-Login-Reply onlyoneid", &mut table).await.unwrap_err();
        assert!(matches!(err, AuthError::AuthenticationFailed { .. }));
    }

    #[tokio::test]
    async fn empty_payload_is_invalid_token() {
        let dialogue = new_dialogue("abc123", MethodTag::Spawn);
        let mut table = PendingTable::new();
        table.insert("abc123".to_string(), dialogue);
        let err = dispatch("X-Login-Reply abc123 ", &mut table).await.unwrap_err();
        assert!(matches!(err, AuthError::AuthenticationFailed { .. }));
    }

    #[tokio::test]
    async fn removes_from_table_and_feeds_pipe() {
        let dialogue = new_dialogue("abc123", MethodTag::Spawn);
        let (tx, mut rx_payload) = mpsc::unbounded_channel();
        dialogue.lock().await.set_resume_channel(tx);

        let mut table = PendingTable::new();
        table.insert("abc123".to_string(), dialogue);

        let (_dialogue, _completion_rx) = dispatch("X-Login-Reply abc123 MTIzNDU2", &mut table).await.unwrap();

        assert!(!table.contains_key("abc123"));
        assert_eq!(rx_payload.recv().await.unwrap(), b"123456");
    }
}
