//! Command channel into the protocol engine.
//!
//! Scheduled commands never touch the transport. They are sent as
//! [`CommandRequest`]s over an mpsc channel; the engine interleaves them with
//! polling and answers each on a oneshot. A slow command therefore only holds
//! up the caller waiting for it, never the poll cadence.

use crate::error::{AppResult, CaptureError};
use crate::profile::CommandDef;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// One command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub name: String,
    pub payload: Vec<u8>,
    /// Required response prefix
    pub expect: String,
    /// Deadline for a matching response
    pub timeout: Duration,
}

impl CommandRequest {
    pub fn from_def(def: &CommandDef, timeout: Duration) -> Self {
        Self {
            name: def.name.clone(),
            payload: def.payload.clone(),
            expect: def.expect.clone(),
            timeout,
        }
    }

    /// Whether a received frame answers this command.
    pub fn matches(&self, frame: &[u8]) -> bool {
        frame.starts_with(self.expect.as_bytes())
    }
}

/// Anything that can run a command and return the response line.
#[async_trait]
pub trait CommandExecutor: Send {
    async fn execute(&mut self, request: &CommandRequest) -> AppResult<String>;
}

/// Request plus the slot for its answer.
#[derive(Debug)]
pub struct CommandEnvelope {
    pub request: CommandRequest,
    pub reply: oneshot::Sender<AppResult<String>>,
}

/// Cloneable handle for submitting commands to a running engine.
#[derive(Debug, Clone)]
pub struct CommandChannel {
    tx: mpsc::Sender<CommandEnvelope>,
}

impl CommandChannel {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<CommandEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl CommandExecutor for CommandChannel {
    async fn execute(&mut self, request: &CommandRequest) -> AppResult<String> {
        let (reply, answer) = oneshot::channel();
        self.tx
            .send(CommandEnvelope {
                request: request.clone(),
                reply,
            })
            .await
            .map_err(|_| CaptureError::ShutDown)?;
        answer.await.map_err(|_| CaptureError::ShutDown)?
    }
}

/// Response text of a matched frame, without line endings.
pub(crate) fn response_text(frame: &[u8]) -> String {
    String::from_utf8_lossy(frame)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CommandRequest {
        CommandRequest {
            name: "ident".into(),
            payload: b"ID?\r\n".to_vec(),
            expect: "ID".into(),
            timeout: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_matches_prefix() {
        let req = request();
        assert!(req.matches(b"ID OK\r\n"));
        assert!(!req.matches(b"+7.01\r\n"));
        assert_eq!(response_text(b"ID OK\r\n"), "ID OK");
    }

    #[tokio::test]
    async fn test_channel_round_trip() {
        let (mut channel, mut rx) = CommandChannel::new(4);
        let engine = tokio::spawn(async move {
            let envelope = rx.recv().await.unwrap();
            assert_eq!(envelope.request.name, "ident");
            envelope.reply.send(Ok("ID OK".into())).unwrap();
        });
        assert_eq!(channel.execute(&request()).await.unwrap(), "ID OK");
        engine.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_engine_is_shutdown() {
        let (mut channel, rx) = CommandChannel::new(1);
        drop(rx);
        assert!(matches!(
            channel.execute(&request()).await,
            Err(CaptureError::ShutDown)
        ));
    }
}
