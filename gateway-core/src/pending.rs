use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::warn;

use crate::error::AuthError;
use crate::pipe::PipeEvent;

/// Which method produced a dialogue, so `login_finish` knows which result
/// parser to invoke when the dialogue completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodTag {
    Spawn,
    Remote,
    None,
}

/// `PendingDialogue`'s lifecycle, per-step. A fresh dialogue starts
/// `Spawning`, moves to `AwaitingHelper` once the payload has been written,
/// to `AwaitingClient` if the helper asked for a prompt, and to `Completed`
/// once a terminal result (success or failure) has been delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogueState {
    Spawning,
    AwaitingHelper,
    AwaitingClient,
    Completed,
}

/// A single outstanding completion is a result the caller is waiting on: at
/// most one may be attached at any time, mirroring `AuthData`'s single
/// pending result in the original.
pub struct PendingDialogueInner {
    pub id: String,
    pub method_tag: MethodTag,
    pub state: DialogueState,
    completion: Option<oneshot::Sender<Option<AuthError>>>,
    response_bytes: Option<Vec<u8>>,
    /// Set by the method task driving this dialogue's `AuthPipe`; lets
    /// `ResumeDispatch` feed a follow-up client reply into that task
    /// without owning the pipe itself.
    resume_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl PendingDialogueInner {
    pub fn new(id: impl Into<String>, method_tag: MethodTag) -> Self {
        Self {
            id: id.into(),
            method_tag,
            state: DialogueState::Spawning,
            completion: None,
            response_bytes: None,
            resume_tx: None,
        }
    }

    pub fn set_resume_channel(&mut self, tx: mpsc::UnboundedSender<Vec<u8>>) {
        self.resume_tx = Some(tx);
    }

    /// Feeds a decoded follow-up payload to the task driving this
    /// dialogue's pipe. Fails if no task has registered a resume channel
    /// (the dialogue was never suspended awaiting a client reply).
    pub fn resume(&mut self, payload: Vec<u8>) -> Result<(), Vec<u8>> {
        match &self.resume_tx {
            Some(tx) => tx.send(payload).map_err(|e| e.0),
            None => Err(payload),
        }
    }

    /// Attaches a fresh completion, returning the receiver half. Replacing
    /// an already-attached completion would violate the "at most one
    /// outstanding" invariant; it's logged rather than panicking, since a
    /// caller bug here shouldn't take down the process.
    pub fn add_completion(&mut self) -> oneshot::Receiver<Option<AuthError>> {
        let (tx, rx) = oneshot::channel();
        if self.completion.replace(tx).is_some() {
            warn!(id = %self.id, "replacing an already-attached completion");
        }
        rx
    }

    /// Resolves the attached completion, if any, with `error` (or success
    /// if `None`). An unattached completion is logged rather than silently
    /// dropped, distinguishing a dropped error from a dropped plain result.
    pub fn complete(&mut self, error: Option<AuthError>) {
        self.state = DialogueState::Completed;
        match self.completion.take() {
            Some(tx) => {
                let _ = tx.send(error);
            }
            None if error.is_some() => {
                warn!(id = %self.id, "dropped authentication error");
            }
            None => {
                warn!(id = %self.id, "dropped authentication result");
            }
        }
    }

    pub fn take_response(&mut self) -> Option<Vec<u8>> {
        self.response_bytes.take()
    }

    /// Applies a pipe event to the dialogue: a message stores the payload
    /// and completes successfully; a close completes with an error only if
    /// the dialogue is still awaiting a result, otherwise it's a normal
    /// post-success teardown and is ignored.
    pub fn handle_pipe_event(&mut self, event: PipeEvent) {
        match event {
            PipeEvent::Message(bytes) => {
                self.response_bytes = Some(bytes);
                self.complete(None);
            }
            PipeEvent::Close(err) => {
                if self.completion.is_some() || self.state != DialogueState::Completed {
                    let auth_err = err.map(|e| AuthError::Failed(e.to_string()));
                    self.complete(auth_err);
                }
            }
        }
    }
}

pub type PendingDialogue = Arc<Mutex<PendingDialogueInner>>;

/// id → dialogue, populated while a dialogue awaits an `X-Login-Reply`
/// follow-up and drained by [`crate::resume`] or by the dialogue closing.
pub type PendingTable = HashMap<String, PendingDialogue>;

pub fn new_dialogue(id: impl Into<String>, method_tag: MethodTag) -> PendingDialogue {
    Arc::new(Mutex::new(PendingDialogueInner::new(id, method_tag)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::PipeError;

    #[tokio::test]
    async fn message_completes_successfully_and_stores_payload() {
        let mut inner = PendingDialogueInner::new("abc", MethodTag::Spawn);
        let rx = inner.add_completion();
        inner.handle_pipe_event(PipeEvent::Message(b"{\"user\":\"joe\"}".to_vec()));
        assert!(rx.await.unwrap().is_none());
        assert_eq!(inner.take_response().unwrap(), b"{\"user\":\"joe\"}");
    }

    #[tokio::test]
    async fn close_while_awaiting_completes_with_error() {
        let mut inner = PendingDialogueInner::new("abc", MethodTag::Spawn);
        let rx = inner.add_completion();
        inner.handle_pipe_event(PipeEvent::Close(Some(PipeError::ProcessTimeout)));
        assert!(rx.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn close_after_completion_is_ignored() {
        let mut inner = PendingDialogueInner::new("abc", MethodTag::Spawn);
        let rx = inner.add_completion();
        inner.handle_pipe_event(PipeEvent::Message(b"{\"user\":\"joe\"}".to_vec()));
        rx.await.unwrap();
        // A second close after the dialogue already completed must not
        // panic or resolve anything (there's nothing left to resolve).
        inner.handle_pipe_event(PipeEvent::Close(None));
    }

    #[test]
    fn complete_without_attached_completion_just_logs() {
        let mut inner = PendingDialogueInner::new("abc", MethodTag::None);
        inner.complete(None);
        inner.complete(Some(AuthError::PermissionDenied));
    }
}
