//! Streaming text-to-speech over the binary synthesis protocol
//!
//! One WebSocket connection per segment: a single gzip'd JSON request goes
//! out, audio frames come back until a frame with a negative sequence number
//! closes the stream.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::protocol::{
    Compression, Frame, FrameHeader, MessageType, SequenceField, Serialization, gzip,
};
use crate::{Config, Error, Result};

/// How a synthesis request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisStatus {
    /// The server sent its final audio frame
    Completed,
    /// The server answered with an error frame
    ServerError(String),
    /// Connection failed or closed before the final frame
    Interrupted(String),
    /// The caller cancelled or stopped listening
    Abandoned,
}

impl SynthesisStatus {
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Turns one piece of text into a stream of PCM chunks
///
/// Chunks are pushed into `out` in arrival order; dropping `out` (which
/// happens when this returns) tells the consumer no more audio will follow.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        out: mpsc::UnboundedSender<Bytes>,
        cancel: CancellationToken,
    ) -> SynthesisStatus;
}

/// Client for the streaming synthesis backend
pub struct TtsClient {
    config: Arc<Config>,
}

#[derive(Serialize)]
struct SynthesisRequest<'a> {
    app: AppSection<'a>,
    user: UserSection<'a>,
    audio: AudioSection<'a>,
    request: RequestSection<'a>,
}

#[derive(Serialize)]
struct AppSection<'a> {
    appid: &'a str,
    /// The backend expects a placeholder here; the real token rides in the
    /// Authorization header
    token: &'a str,
    cluster: &'a str,
}

#[derive(Serialize)]
struct UserSection<'a> {
    uid: &'a str,
}

#[derive(Serialize)]
struct AudioSection<'a> {
    voice_type: &'a str,
    encoding: &'a str,
    speed_ratio: f32,
    volume_ratio: f32,
    pitch_ratio: f32,
    rate: u32,
}

#[derive(Serialize)]
struct RequestSection<'a> {
    reqid: String,
    text: &'a str,
    operation: &'a str,
}

impl TtsClient {
    /// Create a client sharing the process configuration
    ///
    /// # Errors
    ///
    /// Returns error if speech credentials are missing
    pub fn new(config: Arc<Config>) -> Result<Self> {
        config.require_speech_credentials()?;
        Ok(Self { config })
    }

    /// Build the request frame for `text`
    ///
    /// # Errors
    ///
    /// Returns error if the payload cannot be serialized or compressed
    pub fn request_frame(&self, text: &str) -> Result<Frame> {
        let speech = &self.config.speech;
        let tts = &self.config.tts;

        let request = SynthesisRequest {
            app: AppSection {
                appid: &speech.app_id,
                token: "access_token",
                cluster: &speech.tts_cluster,
            },
            user: UserSection { uid: &tts.uid },
            audio: AudioSection {
                voice_type: &speech.tts_voice,
                encoding: "pcm",
                speed_ratio: tts.speed_ratio,
                volume_ratio: tts.volume_ratio,
                pitch_ratio: tts.pitch_ratio,
                rate: tts.sample_rate,
            },
            request: RequestSection {
                reqid: uuid::Uuid::new_v4().to_string(),
                text,
                operation: "submit",
            },
        };

        let json = serde_json::to_vec(&request)?;
        Ok(Frame::new(
            MessageType::FullClientRequest,
            Serialization::Json,
            Compression::Gzip,
            gzip::compress(&json)?,
        ))
    }

    async fn exchange(
        &self,
        text: &str,
        out: &mpsc::UnboundedSender<Bytes>,
    ) -> Result<SynthesisStatus> {
        let mut request = self.config.speech.tts_url.as_str().into_client_request()?;
        let bearer = format!("Bearer;{}", self.config.speech.access_token.expose_secret());
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer)
                .map_err(|e| Error::Tts(format!("invalid access token: {e}")))?,
        );

        let (mut ws, _) = connect_async(request).await?;
        ws.send(Message::binary(self.request_frame(text)?.encode()))
            .await?;

        let status = loop {
            let Some(message) = ws.next().await else {
                break SynthesisStatus::Interrupted(
                    "connection ended before final audio frame".to_string(),
                );
            };

            let data = match message? {
                Message::Binary(data) => data,
                Message::Close(frame) => {
                    tracing::debug!(?frame, "TTS server closed connection");
                    break SynthesisStatus::Interrupted(
                        "server closed before final audio frame".to_string(),
                    );
                }
                _ => continue,
            };

            match handle_frame(&data, out) {
                FrameOutcome::Continue => {}
                FrameOutcome::Done(status) => break status,
            }
        };

        let _ = ws.close(None).await;
        Ok(status)
    }
}

#[async_trait]
impl Synthesizer for TtsClient {
    async fn synthesize(
        &self,
        text: &str,
        out: mpsc::UnboundedSender<Bytes>,
        cancel: CancellationToken,
    ) -> SynthesisStatus {
        let started = Instant::now();

        let status = tokio::select! {
            biased;
            () = cancel.cancelled() => SynthesisStatus::Abandoned,
            result = self.exchange(text, &out) => result.unwrap_or_else(|e| {
                tracing::error!(error = %e, "TTS request failed");
                SynthesisStatus::Interrupted(e.to_string())
            }),
        };

        tracing::debug!(
            chars = text.chars().count(),
            elapsed_ms = started.elapsed().as_millis(),
            ?status,
            "TTS segment finished"
        );
        status
    }
}

enum FrameOutcome {
    Continue,
    Done(SynthesisStatus),
}

/// Handle one response frame, forwarding any audio it carries
fn handle_frame(data: &[u8], out: &mpsc::UnboundedSender<Bytes>) -> FrameOutcome {
    let header = match FrameHeader::parse(data) {
        Ok(header) => header,
        Err(e) => {
            tracing::debug!(error = %e, "skipping malformed TTS frame");
            return FrameOutcome::Continue;
        }
    };

    match header.message_type {
        MessageType::AudioOnlyResponse => {
            let frame = match Frame::decode(data, SequenceField::Always) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping truncated TTS audio frame");
                    return FrameOutcome::Continue;
                }
            };

            // A corrupt payload loses this chunk only; its sequence still counts
            let audio = frame.decoded_payload().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "dropping undecodable TTS audio");
                Bytes::new()
            });

            if !audio.is_empty() && out.send(audio).is_err() {
                return FrameOutcome::Done(SynthesisStatus::Abandoned);
            }

            if frame.is_terminal() {
                FrameOutcome::Done(SynthesisStatus::Completed)
            } else {
                FrameOutcome::Continue
            }
        }
        MessageType::Error => {
            let message = error_message(data);
            tracing::error!(message = %message, "TTS server error");
            FrameOutcome::Done(SynthesisStatus::ServerError(message))
        }
        other => {
            tracing::trace!(?other, "ignoring TTS frame");
            FrameOutcome::Continue
        }
    }
}

/// Best-effort text of a server error frame
///
/// Error frames carry a 4-byte code where audio frames carry the sequence.
fn error_message(data: &[u8]) -> String {
    match Frame::decode(data, SequenceField::Always) {
        Ok(frame) => {
            let code = frame.sequence.unwrap_or_default();
            let body = frame
                .decoded_payload()
                .map(|p| String::from_utf8_lossy(&p).into_owned())
                .unwrap_or_default();
            format!("code {code}: {body}")
        }
        Err(e) => format!("unreadable error frame ({e})"),
    }
}
