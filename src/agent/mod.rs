//! Reply generation
//!
//! The gateway treats the reasoning collaborator as a source of tagged
//! events: tokens of the speakable reply, stage markers around it, and
//! optional intermediate thoughts shown to the user but never spoken.

mod chat;
mod think;

use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

pub use chat::{ChatCompletionsSource, ChatMessage};
pub use think::ThinkFilter;

use crate::Result;

/// Part of a reply a token belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStage {
    /// Internal work before the answer; not spoken
    Planning,
    /// The answer itself; spoken and shown
    Speech,
}

/// One event of a streamed reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEvent {
    StageStarted(ReplyStage),
    Token { stage: ReplyStage, text: String },
    StageFinished(ReplyStage),
    /// Intermediate result shown to the user
    Thought { name: String, content: String },
}

impl ReplyEvent {
    /// Shorthand for a token of the spoken answer
    #[must_use]
    pub fn speech(text: impl Into<String>) -> Self {
        Self::Token {
            stage: ReplyStage::Speech,
            text: text.into(),
        }
    }
}

/// Produces a reply for one user utterance
///
/// The stream ends when the reply is complete. An `Err` item ends the reply
/// with a failure. Implementations stop work promptly once `cancel` fires or
/// the stream is dropped.
pub trait ReplySource: Send + Sync {
    fn reply(&self, utterance: &str, cancel: CancellationToken)
    -> BoxStream<'static, Result<ReplyEvent>>;
}
