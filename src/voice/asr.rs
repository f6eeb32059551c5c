//! Streaming speech recognition over the binary recognition protocol
//!
//! A session is one WebSocket connection. After a JSON handshake, the audio
//! upload and the result download run concurrently: every PCM chunk goes out
//! as a gzip'd audio frame with an increasing sequence number, and every
//! result frame carries the full transcript so far.

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{BoxStream, SplitSink};
use futures::{SinkExt, Stream, StreamExt};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use crate::protocol::{
    Compression, Frame, FrameHeader, MessageType, SequenceCounter, SequenceField, Serialization,
    gzip,
};
use crate::{Config, Error, Result};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Turns a stream of PCM chunks into a stream of transcript updates
///
/// Each update is the full transcript so far and replaces the previous one.
/// The output ends once the backend has delivered its final result for the
/// input, or when `cancel` fires.
pub trait Recognizer: Send + Sync {
    fn recognize(
        &self,
        audio: BoxStream<'static, Bytes>,
        cancel: CancellationToken,
    ) -> BoxStream<'static, String>;
}

/// Client for the streaming recognition backend
pub struct AsrClient {
    config: Arc<Config>,
}

#[derive(Debug, Default, Deserialize)]
struct RecognitionResponse {
    #[serde(default)]
    result: Option<RecognitionResult>,
}

#[derive(Debug, Default, Deserialize)]
struct RecognitionResult {
    #[serde(default)]
    text: String,
}

/// What a server frame means to the session
#[derive(Debug, PartialEq, Eq)]
enum ServerFrame {
    /// Transcript so far (possibly empty) and whether it is the final one
    Transcript { text: String, last: bool },
    /// Server-declared error; the session ends
    Error(String),
    /// Nothing usable
    Skip,
}

impl AsrClient {
    /// Create a client sharing the process configuration
    ///
    /// # Errors
    ///
    /// Returns error if speech credentials are missing
    pub fn new(config: Arc<Config>) -> Result<Self> {
        config.require_speech_credentials()?;
        Ok(Self { config })
    }
}

impl Recognizer for AsrClient {
    fn recognize(
        &self,
        audio: BoxStream<'static, Bytes>,
        cancel: CancellationToken,
    ) -> BoxStream<'static, String> {
        let (updates, rx) = mpsc::unbounded_channel();
        let config = Arc::clone(&self.config);

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!("ASR session cancelled");
                    return;
                }
                () = updates.closed() => return,
                result = run_session(&config, audio, &updates) => result,
            };

            if let Err(e) = result {
                tracing::error!(error = %e, "ASR session failed");
                let _ = updates.send(String::new());
            }
        });

        UnboundedReceiverStream::new(rx).boxed()
    }
}

async fn run_session(
    config: &Config,
    audio: BoxStream<'static, Bytes>,
    updates: &mpsc::UnboundedSender<String>,
) -> Result<()> {
    let connect_id = uuid::Uuid::new_v4().to_string();
    let speech = &config.speech;

    let mut request = speech.asr_url.as_str().into_client_request()?;
    let headers = request.headers_mut();
    headers.insert("x-api-app-key", header_value(&speech.app_id)?);
    headers.insert(
        "x-api-access-key",
        header_value(speech.access_token.expose_secret())?,
    );
    headers.insert("x-api-resource-id", header_value(&speech.asr_resource_id)?);
    headers.insert("x-api-connect-id", header_value(&connect_id)?);

    let (ws, _) = connect_async(request).await?;
    let (mut sink, mut stream) = ws.split();

    let mut sequence = SequenceCounter::new();
    let handshake = handshake_frame(config, sequence.advance())?;
    sink.send(Message::binary(handshake.encode())).await?;
    tracing::info!(connect_id = %connect_id, "ASR session started");

    // Upload and download run side by side; when the download ends for any
    // reason the upload is told to stop
    let receiver_done = CancellationToken::new();
    let upload = upload_audio(sink, audio, sequence, receiver_done.clone());
    let download = async {
        let count = receive_transcripts(&mut stream, updates).await;
        receiver_done.cancel();
        count
    };

    let ((), updates_sent) = tokio::join!(upload, download);
    tracing::info!(connect_id = %connect_id, updates = updates_sent, "ASR session finished");
    Ok(())
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::Asr(format!("invalid header value: {e}")))
}

async fn upload_audio(
    mut sink: WsSink,
    mut audio: BoxStream<'static, Bytes>,
    mut sequence: SequenceCounter,
    stop: CancellationToken,
) {
    let mut frames = 0_usize;

    loop {
        let chunk = tokio::select! {
            biased;
            () = stop.cancelled() => return,
            chunk = audio.next() => chunk,
        };
        let Some(chunk) = chunk else { break };
        if chunk.is_empty() {
            continue;
        }

        let frame = match audio_frame(&chunk, sequence.advance()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "failed to compress audio chunk");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::binary(frame.encode())).await {
            tracing::warn!(error = %e, "ASR upload failed");
            return;
        }
        frames += 1;
    }

    let last = match terminal_frame(sequence.terminal()) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, "failed to build terminal frame");
            return;
        }
    };
    if let Err(e) = sink.send(Message::binary(last.encode())).await {
        tracing::warn!(error = %e, "failed to send terminal frame");
        return;
    }
    tracing::debug!(frames, "ASR audio upload complete");
}

async fn receive_transcripts<S>(stream: &mut S, updates: &mpsc::UnboundedSender<String>) -> usize
where
    S: Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut sent = 0;

    while let Some(message) = stream.next().await {
        let data = match message {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(frame)) => {
                tracing::debug!(?frame, "ASR server closed connection");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "ASR receive failed");
                break;
            }
        };

        match parse_server_frame(&data) {
            ServerFrame::Transcript { text, last } => {
                if !text.is_empty() {
                    tracing::debug!(text = %text, "transcript update");
                    if updates.send(text).is_err() {
                        break;
                    }
                    sent += 1;
                }
                if last {
                    break;
                }
            }
            ServerFrame::Error(message) => {
                tracing::error!(message = %message, "ASR server error");
                break;
            }
            ServerFrame::Skip => {}
        }
    }

    sent
}

/// Interpret one server frame
fn parse_server_frame(data: &[u8]) -> ServerFrame {
    let header = match FrameHeader::parse(data) {
        Ok(header) => header,
        Err(e) => {
            tracing::debug!(error = %e, "skipping malformed ASR frame");
            return ServerFrame::Skip;
        }
    };

    match header.message_type {
        MessageType::FullServerResponse => {
            let frame = match Frame::decode(data, SequenceField::FromFlags) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping truncated ASR frame");
                    return ServerFrame::Skip;
                }
            };
            let last = frame.is_terminal() || header.is_last();

            let text = frame
                .decoded_payload()
                .map_err(Error::from)
                .and_then(|payload| {
                    serde_json::from_slice::<RecognitionResponse>(&payload).map_err(Error::from)
                })
                .map_or_else(
                    |e| {
                        tracing::debug!(error = %e, "unreadable ASR result");
                        String::new()
                    },
                    |response| {
                        response
                            .result
                            .map(|r| r.text.trim().to_string())
                            .unwrap_or_default()
                    },
                );

            ServerFrame::Transcript { text, last }
        }
        MessageType::Error => {
            // Error frames carry a 4-byte code in place of the sequence
            let message = match Frame::decode(data, SequenceField::Always) {
                Ok(frame) => {
                    let body = frame
                        .decoded_payload()
                        .map(|p| String::from_utf8_lossy(&p).into_owned())
                        .unwrap_or_default();
                    format!("code {}: {body}", frame.sequence.unwrap_or_default())
                }
                Err(e) => format!("unreadable error frame ({e})"),
            };
            ServerFrame::Error(message)
        }
        other => {
            tracing::trace!(?other, "ignoring ASR frame");
            ServerFrame::Skip
        }
    }
}

/// Handshake request carrying the session parameters
///
/// # Errors
///
/// Returns error if the payload cannot be serialized or compressed
pub fn handshake_frame(config: &Config, sequence: i32) -> Result<Frame> {
    let body = serde_json::json!({
        "user": { "uid": config.asr.uid },
        "audio": {
            "format": "pcm",
            "codec": "raw",
            "rate": config.asr.sample_rate,
            "bits": 16,
            "channel": 1,
            "language": config.asr.language,
        },
        "request": {
            "reqid": uuid::Uuid::new_v4().to_string(),
            "model_name": "bigmodel",
            "enable_itn": true,
            "enable_punc": true,
            "show_utterances": true,
            "result_type": "full",
            "sequence": sequence,
        },
    });

    Ok(Frame::new(
        MessageType::FullClientRequest,
        Serialization::Json,
        Compression::Gzip,
        gzip::compress(&serde_json::to_vec(&body)?)?,
    )
    .with_sequence(sequence))
}

/// One chunk of PCM audio
///
/// # Errors
///
/// Returns error if compression fails
pub fn audio_frame(pcm: &[u8], sequence: i32) -> Result<Frame> {
    Ok(Frame::new(
        MessageType::AudioOnlyRequest,
        Serialization::Raw,
        Compression::Gzip,
        gzip::compress(pcm)?,
    )
    .with_sequence(sequence))
}

/// End-of-input marker: empty audio, negative sequence, last-packet flag
///
/// # Errors
///
/// Returns error if compression fails
pub fn terminal_frame(sequence: i32) -> Result<Frame> {
    Ok(audio_frame(&[], sequence)?.last())
}
