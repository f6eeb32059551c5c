//! Streaming replies from an OpenAI-compatible chat completions endpoint

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::StreamExt;
use futures::stream::BoxStream;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{ReplyEvent, ReplySource, ReplyStage, ThinkFilter};
use crate::{Config, Error, Result};

/// Label for reasoning text surfaced as a thought
const THOUGHT_NAME: &str = "思考";

/// One message of the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
}

/// Reply source backed by a chat completions API
///
/// Keeps a bounded history of completed exchanges; a reply that is cancelled
/// or fails leaves the history untouched.
#[derive(Clone)]
pub struct ChatCompletionsSource {
    client: reqwest::Client,
    config: Arc<Config>,
    history: Arc<Mutex<VecDeque<ChatMessage>>>,
}

impl ChatCompletionsSource {
    /// Create a source sharing the process configuration
    ///
    /// # Errors
    ///
    /// Returns error if no API key is configured
    pub fn new(config: Arc<Config>) -> Result<Self> {
        if config.llm.api_key.is_none() {
            return Err(Error::Config("SILICONFLOW_API_KEY is required".to_string()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            config,
            history: Arc::new(Mutex::new(VecDeque::new())),
        })
    }

    /// Messages sent for `utterance`: system prompt, history, then the user turn
    fn build_messages(&self, utterance: &str) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::new("system", &self.config.llm.system_prompt)];
        if let Ok(history) = self.history.lock() {
            messages.extend(history.iter().cloned());
        }
        messages.push(ChatMessage::new("user", utterance));
        messages
    }

    fn remember(&self, utterance: &str, answer: &str) {
        let limit = self.config.llm.history_turns * 2;
        if limit == 0 {
            return;
        }
        if let Ok(mut history) = self.history.lock() {
            history.push_back(ChatMessage::new("user", utterance));
            history.push_back(ChatMessage::new("assistant", answer));
            while history.len() > limit {
                history.pop_front();
            }
        }
    }

    /// Past exchanges currently replayed to the model
    #[must_use]
    pub fn history(&self) -> Vec<ChatMessage> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn stream_reply(
        &self,
        utterance: String,
        tx: mpsc::Sender<Result<ReplyEvent>>,
    ) -> Result<()> {
        let llm = &self.config.llm;
        let api_key = llm
            .api_key
            .as_ref()
            .ok_or_else(|| Error::Config("SILICONFLOW_API_KEY is required".to_string()))?;

        let messages = self.build_messages(&utterance);
        let url = format!("{}/chat/completions", llm.base_url.trim_end_matches('/'));
        let started = Instant::now();

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key.expose_secret())
            .json(&ChatRequest {
                model: &llm.model,
                messages: &messages,
                temperature: llm.temperature,
                stream: true,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Agent(format!("chat completions returned {status}: {body}")));
        }

        if tx
            .send(Ok(ReplyEvent::StageStarted(ReplyStage::Speech)))
            .await
            .is_err()
        {
            return Ok(());
        }

        let mut filter = ThinkFilter::new();
        let mut reasoning = String::new();
        let mut answer = String::new();
        let mut line_buf: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();

        'read: while let Some(chunk) = stream.next().await {
            line_buf.extend_from_slice(&chunk?);

            // Only complete lines are parsed; a multi-byte char may straddle chunks
            while let Some(end) = line_buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = line_buf.drain(..=end).collect();
                let line = String::from_utf8_lossy(&line);
                let Some(data) = line.trim().strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    break 'read;
                }

                let Ok(chunk) = serde_json::from_str::<ChatChunk>(data) else {
                    tracing::debug!(data, "skipping unreadable completion chunk");
                    continue;
                };

                for choice in chunk.choices {
                    if let Some(thinking) = choice.delta.reasoning_content {
                        reasoning.push_str(&thinking);
                    }
                    let Some(content) = choice.delta.content else {
                        continue;
                    };
                    let visible = filter.push(&content);
                    if visible.is_empty() {
                        continue;
                    }
                    if answer.is_empty() {
                        tracing::debug!(
                            elapsed_ms = started.elapsed().as_millis(),
                            "first completion token"
                        );
                    }
                    answer.push_str(&visible);
                    if tx.send(Ok(ReplyEvent::speech(visible))).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }

        let tail = filter.finish();
        if !tail.is_empty() {
            answer.push_str(&tail);
            if tx.send(Ok(ReplyEvent::speech(tail))).await.is_err() {
                return Ok(());
            }
        }
        reasoning.push_str(&filter.take_thought());

        if tx
            .send(Ok(ReplyEvent::StageFinished(ReplyStage::Speech)))
            .await
            .is_err()
        {
            return Ok(());
        }

        let reasoning = reasoning.trim();
        if !reasoning.is_empty() {
            let _ = tx
                .send(Ok(ReplyEvent::Thought {
                    name: THOUGHT_NAME.to_string(),
                    content: reasoning.to_string(),
                }))
                .await;
        }

        tracing::info!(
            chars = answer.chars().count(),
            elapsed_ms = started.elapsed().as_millis(),
            "reply complete"
        );
        self.remember(&utterance, &answer);
        Ok(())
    }
}

impl ReplySource for ChatCompletionsSource {
    fn reply(
        &self,
        utterance: &str,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<ReplyEvent>> {
        let (tx, rx) = mpsc::channel(64);
        let source = self.clone();
        let utterance = utterance.to_string();

        tokio::spawn(async move {
            let errors = tx.clone();
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!("reply generation cancelled");
                }
                () = tx.closed() => {}
                result = source.stream_reply(utterance, tx.clone()) => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "reply generation failed");
                        let _ = errors.send(Err(e)).await;
                    }
                }
            }
        });

        ReceiverStream::new(rx).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::file::ParleyConfigFile;

    fn source(history_turns: usize) -> ChatCompletionsSource {
        let mut fc = ParleyConfigFile::default();
        fc.llm.history_turns = Some(history_turns);
        fc.llm.system_prompt = Some("系统".to_string());
        let config = Config::from_sources(fc, |key| {
            (key == "SILICONFLOW_API_KEY").then(|| "sk-test".to_string())
        })
        .unwrap();
        ChatCompletionsSource::new(Arc::new(config)).unwrap()
    }

    #[test]
    fn requires_api_key() {
        let config = Config::from_sources(ParleyConfigFile::default(), |_| None).unwrap();
        assert!(ChatCompletionsSource::new(Arc::new(config)).is_err());
    }

    #[test]
    fn messages_include_history_in_order() {
        let source = source(10);
        source.remember("第一句", "回答一");

        let messages = source.build_messages("第二句");
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(messages[0].content, "系统");
        assert_eq!(messages[3].content, "第二句");
    }

    #[test]
    fn history_is_bounded() {
        let source = source(2);
        for i in 0..5 {
            source.remember(&format!("问{i}"), &format!("答{i}"));
        }

        let history = source.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].content, "问3");
        assert_eq!(history[3].content, "答4");
    }

    #[test]
    fn zero_history_keeps_nothing() {
        let source = source(0);
        source.remember("问", "答");
        assert!(source.history().is_empty());
    }
}
