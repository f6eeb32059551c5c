//! Messages exchanged with the client over the session socket
//!
//! Control messages are JSON text frames tagged by `type`; audio travels as
//! binary frames in both directions.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::voice::AudioSink;
use crate::{Error, Result};

/// Conversation state reported to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    Idle,
    Recording,
    Recognizing,
    Thinking,
    Speaking,
}

/// Commands sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    StartRecording,
    StopRecording,
    TextInput {
        #[serde(default)]
        text: String,
    },
}

/// Events sent to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Status { state: TurnState },
    /// Interim transcript; replaces the previous one
    ChatUserTemp { text: String },
    /// Final transcript of the user's utterance
    ChatUser { text: String },
    /// Start of the agent's reply, with time to first token
    ChatAgentStart { latency: String },
    ChatAgentStream { text: String },
    Thought { name: String, content: String },
}

/// Anything queued for the client socket
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(ServerEvent),
    Audio(Bytes),
}

/// Capacity of the per-session outbound queue
pub const OUTBOUND_CAPACITY: usize = 256;

/// Sending half of a session's outbound queue
#[derive(Debug, Clone)]
pub struct SessionSink {
    tx: mpsc::Sender<Outbound>,
}

impl SessionSink {
    #[must_use]
    pub const fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self { tx }
    }

    /// Queue a control event; a closed session drops it silently
    pub async fn emit(&self, event: ServerEvent) {
        if self.tx.send(Outbound::Event(event)).await.is_err() {
            tracing::trace!("session closed, event dropped");
        }
    }

    /// Whether the client side is gone
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl AudioSink for SessionSink {
    async fn send_audio(&self, chunk: Bytes) -> Result<()> {
        self.tx
            .send(Outbound::Audio(chunk))
            .await
            .map_err(|_| Error::SessionClosed)
    }
}
