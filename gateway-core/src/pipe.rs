use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::AuthError;
use crate::pending::PendingDialogue;

/// Errors an [`AuthPipe`] can surface instead of a message.
#[derive(thiserror::Error, Debug)]
pub enum PipeError {
    #[error("helper process exceeded its allotted lifetime")]
    ProcessTimeout,
    #[error("timed out waiting for a client reply")]
    ResponseTimeout,
    #[error("I/O error talking to helper: {0}")]
    Io(#[from] std::io::Error),
}

/// One complete unit of helper communication: either a framed JSON payload
/// or the end of the conversation (clean EOF or an error, including either
/// timeout).
#[derive(Debug)]
pub enum PipeEvent {
    Message(Vec<u8>),
    Close(Option<PipeError>),
}

/// A length-delimited JSON channel to a helper process, generic over the
/// concrete transport so tests can drive it over an in-memory
/// `tokio::io::duplex()` pair instead of a real child process or socket.
/// Frames are a 4-byte big-endian length prefix followed by that many
/// payload bytes.
pub struct AuthPipe<S> {
    stream: S,
    process_deadline: Instant,
}

impl<S: AsyncRead + AsyncWrite + Unpin> AuthPipe<S> {
    pub fn new(stream: S, process_timeout: Duration) -> Self {
        Self {
            stream,
            process_deadline: Instant::now() + process_timeout,
        }
    }

    /// Sends one framed message to the helper.
    pub async fn answer(&mut self, bytes: &[u8]) -> Result<(), PipeError> {
        let remaining = self.remaining()?;
        let write = async {
            let len = u32::try_from(bytes.len()).map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "message too large to frame")
            })?;
            self.stream.write_all(&len.to_be_bytes()).await?;
            self.stream.write_all(bytes).await?;
            self.stream.flush().await?;
            Ok::<_, std::io::Error>(())
        };
        match tokio::time::timeout(remaining, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(PipeError::Io(e)),
            Err(_) => Err(PipeError::ProcessTimeout),
        }
    }

    /// Waits for the next frame. `response_timeout`, when given, bounds how
    /// long to wait for this particular reply (used while the dialogue is
    /// suspended awaiting a client follow-up); it is always capped by the
    /// pipe's overall process-timeout deadline.
    pub async fn recv(&mut self, response_timeout: Option<Duration>) -> PipeEvent {
        let remaining = match self.remaining() {
            Ok(d) => d,
            Err(e) => return PipeEvent::Close(Some(e)),
        };
        let (wait, waiting_on_response) = match response_timeout {
            Some(rt) if rt < remaining => (rt, true),
            _ => (remaining, false),
        };

        match tokio::time::timeout(wait, self.read_frame()).await {
            Ok(Ok(Some(bytes))) => PipeEvent::Message(bytes),
            Ok(Ok(None)) => PipeEvent::Close(None),
            Ok(Err(e)) => PipeEvent::Close(Some(PipeError::Io(e))),
            Err(_) if waiting_on_response => PipeEvent::Close(Some(PipeError::ResponseTimeout)),
            Err(_) => PipeEvent::Close(Some(PipeError::ProcessTimeout)),
        }
    }

    async fn read_frame(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }

    fn remaining(&self) -> Result<Duration, PipeError> {
        let now = Instant::now();
        if now >= self.process_deadline {
            Err(PipeError::ProcessTimeout)
        } else {
            Ok(self.process_deadline - now)
        }
    }
}

/// Drives one dialogue's pipe end to end: sends whatever payload arrives
/// on `resume_rx` (the initial payload is pre-seeded there by the caller
/// before spawning this task), waits for the helper's reply, feeds it to
/// `dialogue`, and loops — waiting for the *next* payload (a client's
/// resumed reply) under `response_timeout`, since that's the only wait
/// that represents a human being asked for more input. The very first
/// wait is not time-bounded by `response_timeout`; the payload is already
/// queued by the time this task starts.
///
/// Shared by `SpawnMethod` and `RemoteMethod`, which drive identical
/// Message/Close handling over their respective `AuthPipe`s.
///
/// Whenever this loop ends — for any reason — it sends the dialogue's id
/// over `cleanup_tx`. If the dialogue was ever parked into the manager's
/// pending-dialogue tables after a prompt, and no resume ever arrived to
/// remove it again, this is what purges it; if it was never parked, or
/// already removed by a resume, the send is a harmless no-op on the
/// receiving end.
pub async fn drive<S: AsyncRead + AsyncWrite + Unpin + Send>(
    mut pipe: AuthPipe<S>,
    dialogue: PendingDialogue,
    mut resume_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    response_timeout: Duration,
    cleanup_tx: mpsc::UnboundedSender<String>,
) {
    let mut first = true;
    loop {
        let next_payload = if first {
            first = false;
            match resume_rx.recv().await {
                Some(p) => p,
                None => break,
            }
        } else {
            match tokio::time::timeout(response_timeout, resume_rx.recv()).await {
                Ok(Some(p)) => p,
                Ok(None) => break,
                Err(_) => {
                    dialogue
                        .lock()
                        .await
                        .complete(Some(AuthError::Failed(PipeError::ResponseTimeout.to_string())));
                    break;
                }
            }
        };

        if let Err(e) = pipe.answer(&next_payload).await {
            dialogue.lock().await.complete(Some(AuthError::Failed(e.to_string())));
            break;
        }

        match pipe.recv(None).await {
            PipeEvent::Message(bytes) => {
                dialogue.lock().await.handle_pipe_event(PipeEvent::Message(bytes));
            }
            close @ PipeEvent::Close(_) => {
                dialogue.lock().await.handle_pipe_event(close);
                break;
            }
        }
    }

    let id = dialogue.lock().await.id.clone();
    let _ = cleanup_tx.send(id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_message() {
        let (client, mut helper) = tokio::io::duplex(4096);
        let mut pipe = AuthPipe::new(client, Duration::from_secs(30));

        pipe.answer(b"{\"user\":\"joe\"}").await.unwrap();

        let mut len_buf = [0u8; 4];
        helper.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        helper.read_exact(&mut body).await.unwrap();
        assert_eq!(body, b"{\"user\":\"joe\"}");

        let reply = b"{\"ok\":true}";
        helper.write_all(&(reply.len() as u32).to_be_bytes()).await.unwrap();
        helper.write_all(reply).await.unwrap();
        helper.flush().await.unwrap();

        match pipe.recv(None).await {
            PipeEvent::Message(bytes) => assert_eq!(bytes, reply),
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_closes_cleanly() {
        let (client, helper) = tokio::io::duplex(64);
        drop(helper);
        let mut pipe = AuthPipe::new(client, Duration::from_secs(30));
        match pipe.recv(None).await {
            PipeEvent::Close(None) => {}
            other => panic!("expected clean close, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn response_timeout_fires_before_process_timeout() {
        let (client, _helper) = tokio::io::duplex(64);
        let mut pipe = AuthPipe::new(client, Duration::from_secs(60));
        match pipe.recv(Some(Duration::from_secs(5))).await {
            PipeEvent::Close(Some(PipeError::ResponseTimeout)) => {}
            other => panic!("expected response timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drive_reports_dialogue_id_on_response_timeout() {
        use crate::pending::{new_dialogue, MethodTag};

        let (client, mut helper) = tokio::io::duplex(4096);
        let pipe = AuthPipe::new(client, Duration::from_secs(300));
        let dialogue = new_dialogue("dlg-1", MethodTag::Spawn);
        let (resume_tx, resume_rx) = mpsc::unbounded_channel();
        let (cleanup_tx, mut cleanup_rx) = mpsc::unbounded_channel();
        resume_tx.send(b"{\"prompt\":true}".to_vec()).unwrap();

        tokio::spawn(drive(pipe, dialogue, resume_rx, Duration::from_secs(5), cleanup_tx));

        // Answer the first round so the loop advances to waiting on a
        // second resume payload that, in this test, never comes — exactly
        // the state a dialogue is in once it's been parked after a prompt.
        let mut len_buf = [0u8; 4];
        helper.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        helper.read_exact(&mut body).await.unwrap();
        let reply = b"{\"prompt\":true}";
        helper.write_all(&(reply.len() as u32).to_be_bytes()).await.unwrap();
        helper.write_all(reply).await.unwrap();
        helper.flush().await.unwrap();

        let id = tokio::time::timeout(Duration::from_secs(30), cleanup_rx.recv())
            .await
            .expect("cleanup channel should fire once the response timeout elapses")
            .expect("cleanup sender should still be alive");
        assert_eq!(id, "dlg-1");
    }

    #[tokio::test(start_paused = true)]
    async fn process_timeout_fires_when_no_response_timeout_given() {
        let (client, _helper) = tokio::io::duplex(64);
        let mut pipe = AuthPipe::new(client, Duration::from_secs(2));
        match pipe.recv(None).await {
            PipeEvent::Close(Some(PipeError::ProcessTimeout)) => {}
            other => panic!("expected process timeout, got {other:?}"),
        }
    }
}
