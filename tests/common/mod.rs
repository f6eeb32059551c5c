//! Shared test utilities: mock speech servers and scripted backends
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;

use parley_gateway::agent::{ReplyEvent, ReplySource, ReplyStage};
use parley_gateway::config::file::ParleyConfigFile;
use parley_gateway::protocol::{
    Compression, Frame, MessageType, SequenceField, Serialization, gzip,
};
use parley_gateway::session::{Outbound, ServerEvent, TurnState};
use parley_gateway::voice::{Recognizer, SynthesisStatus, Synthesizer};
use parley_gateway::{Config, Error, Result};

/// Configuration pointing both speech protocols at local mock servers
#[must_use]
pub fn test_config(asr_url: &str, tts_url: &str) -> Arc<Config> {
    let env: HashMap<&str, String> = HashMap::from([
        ("VOLC_APPID", "test-app".to_string()),
        ("VOLC_ACCESS_TOKEN", "test-token".to_string()),
        ("VOLC_ASR_URL", asr_url.to_string()),
        ("VOLC_TTS_URL", tts_url.to_string()),
        ("SILICONFLOW_API_KEY", "sk-test".to_string()),
    ]);
    let config = Config::from_sources(ParleyConfigFile::default(), |key| env.get(key).cloned())
        .expect("test config");
    Arc::new(config)
}

/// A URL nothing is listening on
pub async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}")
}

fn record_header(
    store: Arc<Mutex<Vec<(String, String)>>>,
) -> impl FnOnce(&Request, Response) -> std::result::Result<Response, ErrorResponse> {
    move |request: &Request, response: Response| {
        let mut store = store.lock().unwrap();
        for (name, value) in request.headers() {
            store.push((
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            ));
        }
        Ok(response)
    }
}

fn header(store: &Mutex<Vec<(String, String)>>, name: &str) -> Option<String> {
    store
        .lock()
        .unwrap()
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.clone())
}

// ---------------------------------------------------------------------------
// Mock synthesis server
// ---------------------------------------------------------------------------

/// Local stand-in for the synthesis backend
///
/// Answers each request with two audio chunks `"{text}#0"` and `"{text}#1"`
/// followed by an empty terminal frame. Texts listed in `delays` wait that
/// many milliseconds before each chunk. A text containing `FAIL` gets an
/// error frame instead.
pub struct MockTts {
    pub url: String,
    pub texts: Arc<Mutex<Vec<String>>>,
    headers: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockTts {
    pub async fn spawn(delays: &[(&str, u64)]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let texts = Arc::new(Mutex::new(Vec::new()));
        let headers = Arc::new(Mutex::new(Vec::new()));
        let delays: HashMap<String, u64> =
            delays.iter().map(|(t, d)| ((*t).to_string(), *d)).collect();

        let texts_srv = Arc::clone(&texts);
        let headers_srv = Arc::clone(&headers);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let texts = Arc::clone(&texts_srv);
                let headers = Arc::clone(&headers_srv);
                let delays = delays.clone();
                tokio::spawn(async move {
                    let Ok(ws) =
                        tokio_tungstenite::accept_hdr_async(stream, record_header(headers)).await
                    else {
                        return;
                    };
                    let (mut tx, mut rx) = ws.split();

                    let Some(Ok(Message::Binary(data))) = rx.next().await else {
                        return;
                    };
                    let request = Frame::decode(&data, SequenceField::FromFlags).unwrap();
                    let body: serde_json::Value =
                        serde_json::from_slice(&request.decoded_payload().unwrap()).unwrap();
                    let text = body["request"]["text"].as_str().unwrap().to_string();
                    texts.lock().unwrap().push(text.clone());

                    if text.contains("FAIL") {
                        let error = Frame::new(
                            MessageType::Error,
                            Serialization::Json,
                            Compression::None,
                            b"synthesis refused".to_vec(),
                        )
                        .with_sequence(50_000_000);
                        let _ = tx.send(Message::binary(error.encode())).await;
                        return;
                    }

                    let delay = Duration::from_millis(delays.get(&text).copied().unwrap_or(0));
                    for i in 0..2 {
                        tokio::time::sleep(delay).await;
                        let chunk = audio_response(format!("{text}#{i}").as_bytes(), i + 1);
                        if tx.send(Message::binary(chunk)).await.is_err() {
                            return;
                        }
                    }
                    let _ = tx.send(Message::binary(audio_response(b"", -3))).await;
                    let _ = tx.close().await;
                });
            }
        });

        Self {
            url,
            texts,
            headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<String> {
        header(&self.headers, name)
    }
}

fn audio_response(pcm: &[u8], sequence: i32) -> Vec<u8> {
    Frame::new(
        MessageType::AudioOnlyResponse,
        Serialization::Raw,
        Compression::Gzip,
        gzip::compress(pcm).unwrap(),
    )
    .with_sequence(sequence)
    .encode()
}

// ---------------------------------------------------------------------------
// Mock recognition server
// ---------------------------------------------------------------------------

/// Local stand-in for the recognition backend
///
/// After each audio frame it answers with the next transcript of the
/// script (repeating the last one once the script runs out). The terminal
/// frame is answered with the last transcript and a negative sequence.
pub struct MockAsr {
    pub url: String,
    /// Sequence numbers of every frame received, handshake included
    pub sequences: Arc<Mutex<Vec<i32>>>,
    /// Header flags of every frame received
    pub flags: Arc<Mutex<Vec<u8>>>,
    headers: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockAsr {
    pub async fn spawn(script: &[&str]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let sequences = Arc::new(Mutex::new(Vec::new()));
        let flags = Arc::new(Mutex::new(Vec::new()));
        let headers = Arc::new(Mutex::new(Vec::new()));
        let script: Vec<String> = script.iter().map(|s| (*s).to_string()).collect();

        let sequences_srv = Arc::clone(&sequences);
        let flags_srv = Arc::clone(&flags);
        let headers_srv = Arc::clone(&headers);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let sequences = Arc::clone(&sequences_srv);
                let flags = Arc::clone(&flags_srv);
                let headers = Arc::clone(&headers_srv);
                let script = script.clone();
                tokio::spawn(async move {
                    let Ok(ws) =
                        tokio_tungstenite::accept_hdr_async(stream, record_header(headers)).await
                    else {
                        return;
                    };
                    let (mut tx, mut rx) = ws.split();
                    let mut answered = 0_usize;

                    while let Some(Ok(message)) = rx.next().await {
                        let Message::Binary(data) = message else {
                            continue;
                        };
                        let frame = Frame::decode(&data, SequenceField::FromFlags).unwrap();
                        let sequence = frame.sequence.unwrap_or_default();
                        sequences.lock().unwrap().push(sequence);
                        flags.lock().unwrap().push(frame.header.flags);

                        if frame.message_type() == MessageType::FullClientRequest {
                            continue;
                        }

                        if frame.is_terminal() {
                            let last = script.last().cloned().unwrap_or_default();
                            let _ = tx
                                .send(Message::binary(result_response(&last, sequence)))
                                .await;
                            let _ = tx.close().await;
                            return;
                        }

                        if let Some(text) = script.get(answered.min(script.len().saturating_sub(1)))
                        {
                            let _ = tx
                                .send(Message::binary(result_response(text, sequence)))
                                .await;
                        }
                        answered += 1;
                    }
                });
            }
        });

        Self {
            url,
            sequences,
            flags,
            headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<String> {
        header(&self.headers, name)
    }
}

fn result_response(text: &str, sequence: i32) -> Vec<u8> {
    let body = serde_json::json!({ "result": { "text": text } });
    let frame = Frame::new(
        MessageType::FullServerResponse,
        Serialization::Json,
        Compression::Gzip,
        gzip::compress(&serde_json::to_vec(&body).unwrap()).unwrap(),
    )
    .with_sequence(sequence);
    if sequence < 0 {
        frame.last().encode()
    } else {
        frame.encode()
    }
}

// ---------------------------------------------------------------------------
// Scripted backends
// ---------------------------------------------------------------------------

/// Emits the i-th transcript after the i-th audio chunk, then the last one
/// again once input ends
pub struct ScriptedRecognizer {
    pub script: Vec<String>,
}

impl ScriptedRecognizer {
    pub fn new(script: &[&str]) -> Self {
        Self {
            script: script.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

impl Recognizer for ScriptedRecognizer {
    fn recognize(
        &self,
        mut audio: BoxStream<'static, Bytes>,
        cancel: CancellationToken,
    ) -> BoxStream<'static, String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let script = self.script.clone();
        tokio::spawn(async move {
            let mut index = 0;
            loop {
                let chunk = tokio::select! {
                    () = cancel.cancelled() => return,
                    chunk = audio.next() => chunk,
                };
                if chunk.is_none() {
                    break;
                }
                if let Some(text) = script.get(index) {
                    let _ = tx.send(text.clone());
                }
                index += 1;
            }
            if let Some(last) = script.last() {
                let _ = tx.send(last.clone());
            }
        });
        UnboundedReceiverStream::new(rx).boxed()
    }
}

/// Sends `"{text}|a"` and `"{text}|b"`, waiting `delay` before each
pub struct EchoSynth {
    pub delay: Duration,
}

impl EchoSynth {
    pub fn instant() -> Self {
        Self {
            delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl Synthesizer for EchoSynth {
    async fn synthesize(
        &self,
        text: &str,
        out: mpsc::UnboundedSender<Bytes>,
        cancel: CancellationToken,
    ) -> SynthesisStatus {
        for part in ["a", "b"] {
            tokio::select! {
                () = cancel.cancelled() => return SynthesisStatus::Abandoned,
                () = tokio::time::sleep(self.delay) => {}
            }
            if out.send(Bytes::from(format!("{text}|{part}"))).is_err() {
                return SynthesisStatus::Abandoned;
            }
        }
        SynthesisStatus::Completed
    }
}

/// Streams a fixed list of tokens, recording every utterance it is asked about
pub struct ScriptedReplies {
    pub tokens: Vec<String>,
    pub delay: Duration,
    pub thought: Option<(String, String)>,
    pub utterances: Arc<Mutex<Vec<String>>>,
}

impl ScriptedReplies {
    pub fn new(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(|s| (*s).to_string()).collect(),
            delay: Duration::ZERO,
            thought: None,
            utterances: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn with_thought(mut self, name: &str, content: &str) -> Self {
        self.thought = Some((name.to_string(), content.to_string()));
        self
    }
}

impl ReplySource for ScriptedReplies {
    fn reply(
        &self,
        utterance: &str,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<ReplyEvent>> {
        self.utterances.lock().unwrap().push(utterance.to_string());

        let delay = self.delay;
        let mut events = vec![ReplyEvent::StageStarted(ReplyStage::Speech)];
        events.extend(self.tokens.iter().map(|t| ReplyEvent::speech(t.clone())));
        events.push(ReplyEvent::StageFinished(ReplyStage::Speech));
        if let Some((name, content)) = self.thought.clone() {
            events.push(ReplyEvent::Thought { name, content });
        }

        stream::iter(events)
            .then(move |event| async move {
                tokio::time::sleep(delay).await;
                Ok(event)
            })
            .take_until(cancel.cancelled_owned())
            .boxed()
    }
}

/// Fails before producing anything
pub struct FailingReplies;

impl ReplySource for FailingReplies {
    fn reply(
        &self,
        _utterance: &str,
        _cancel: CancellationToken,
    ) -> BoxStream<'static, Result<ReplyEvent>> {
        stream::once(async { Err(Error::Agent("backend unavailable".to_string())) }).boxed()
    }
}

// ---------------------------------------------------------------------------
// Outbound inspection
// ---------------------------------------------------------------------------

/// Read outbound messages until the session reports Idle
pub async fn collect_until_idle(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
    let mut seen = Vec::new();
    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for idle");
        let Some(outbound) = next else {
            return seen;
        };
        let idle = matches!(
            outbound,
            Outbound::Event(ServerEvent::Status {
                state: TurnState::Idle
            })
        );
        seen.push(outbound);
        if idle {
            return seen;
        }
    }
}

/// Everything queued right now
pub fn drain_now(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
    let mut seen = Vec::new();
    while let Ok(outbound) = rx.try_recv() {
        seen.push(outbound);
    }
    seen
}

pub fn events(outbound: &[Outbound]) -> Vec<ServerEvent> {
    outbound
        .iter()
        .filter_map(|o| match o {
            Outbound::Event(e) => Some(e.clone()),
            Outbound::Audio(_) => None,
        })
        .collect()
}

pub fn audio(outbound: &[Outbound]) -> Vec<String> {
    outbound
        .iter()
        .filter_map(|o| match o {
            Outbound::Audio(chunk) => Some(String::from_utf8_lossy(chunk).into_owned()),
            Outbound::Event(_) => None,
        })
        .collect()
}

pub fn status(state: TurnState) -> ServerEvent {
    ServerEvent::Status { state }
}
