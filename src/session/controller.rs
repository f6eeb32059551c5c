//! Per-connection turn state machine
//!
//! ```text
//!           start_recording              stop_recording
//!   Idle ────────────────────► Recording ──────────────► Recognizing
//!    ▲                                                       │
//!    │  empty transcript                                     │ utterance
//!    ├───────────────────────────────────────────────────────┤
//!    │                                                       ▼
//!    │         reply done / cancelled / failed           Thinking
//!    └────────────────────────────── Speaking ◄──────────────┘
//!                                              first token
//! ```
//!
//! At most one reply is active per session. Starting a recording or sending
//! text while a reply is active cancels that reply and waits for its cleanup
//! before anything new starts, so audio from an old reply never follows
//! events of a new one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use super::events::{ClientCommand, ServerEvent, SessionSink, TurnState};
use crate::agent::{ReplyEvent, ReplySource, ReplyStage};
use crate::config::SegmenterConfig;
use crate::voice::{AudioSink, Recognizer, ReplySpeaker, Synthesizer};

/// Text shown when a reply fails before producing anything
pub const ERROR_REPLY: &str = "系统处理出错。";

/// Longest wait for the final transcript after recording stops
const RECOGNITION_TIMEOUT: Duration = Duration::from_secs(15);

/// Backends shared by every session
#[derive(Clone)]
pub struct TurnServices {
    pub recognizer: Arc<dyn Recognizer>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub replies: Arc<dyn ReplySource>,
    pub segmenter: SegmenterConfig,
    /// Inbound audio larger than this is split before recognition
    pub max_chunk_bytes: usize,
}

struct Recording {
    ingest: mpsc::UnboundedSender<Bytes>,
    transcript: JoinHandle<String>,
    cancel: CancellationToken,
}

struct ActiveReply {
    turn: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Drives one client session
pub struct TurnController {
    services: TurnServices,
    out: SessionSink,
    state: Arc<watch::Sender<TurnState>>,
    recording: Option<Recording>,
    reply: Option<ActiveReply>,
    turns: u64,
}

impl TurnController {
    #[must_use]
    pub fn new(services: TurnServices, out: SessionSink) -> Self {
        let (state, _) = watch::channel(TurnState::Idle);
        Self {
            services,
            out,
            state: Arc::new(state),
            recording: None,
            reply: None,
            turns: 0,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> TurnState {
        *self.state.borrow()
    }

    /// Watch state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TurnState> {
        self.state.subscribe()
    }

    /// Dispatch a client command
    pub async fn handle(&mut self, command: ClientCommand) {
        tracing::debug!(?command, "client command");
        match command {
            ClientCommand::StartRecording => self.start_recording().await,
            ClientCommand::StopRecording => self.stop_recording().await,
            ClientCommand::TextInput { text } => self.text_input(&text).await,
        }
    }

    /// Begin capturing an utterance, interrupting any active reply
    pub async fn start_recording(&mut self) {
        self.cancel_active_turn().await;
        self.discard_recording().await;

        let (ingest, audio) = mpsc::unbounded_channel::<Bytes>();
        let cancel = CancellationToken::new();
        let mut updates = self
            .services
            .recognizer
            .recognize(UnboundedReceiverStream::new(audio).boxed(), cancel.clone());

        let out = self.out.clone();
        let transcript = tokio::spawn(async move {
            let mut latest = String::new();
            while let Some(text) = updates.next().await {
                if text.is_empty() {
                    continue;
                }
                out.emit(ServerEvent::ChatUserTemp { text: text.clone() })
                    .await;
                latest = text;
            }
            latest
        });

        self.recording = Some(Recording {
            ingest,
            transcript,
            cancel,
        });
        publish(&self.state, &self.out, TurnState::Recording).await;
        tracing::info!("recording started");
    }

    /// Forward captured audio to recognition; ignored when not recording
    pub fn push_audio(&self, mut data: Bytes) {
        let Some(recording) = &self.recording else {
            tracing::trace!(bytes = data.len(), "audio outside recording, ignored");
            return;
        };

        let max = self.services.max_chunk_bytes.max(1);
        while !data.is_empty() {
            let piece = data.split_to(data.len().min(max));
            if recording.ingest.send(piece).is_err() {
                tracing::debug!("recognition already ended, audio dropped");
                return;
            }
        }
    }

    /// End the utterance, wait for its transcript and start a reply
    pub async fn stop_recording(&mut self) {
        let Some(Recording {
            ingest,
            mut transcript,
            cancel,
        }) = self.recording.take()
        else {
            tracing::debug!("stop_recording without an active recording");
            return;
        };

        // Closing the ingest channel is the end-of-input marker
        drop(ingest);
        publish(&self.state, &self.out, TurnState::Recognizing).await;

        let started = Instant::now();
        let utterance = match tokio::time::timeout(RECOGNITION_TIMEOUT, &mut transcript).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "transcript task ended abnormally");
                String::new()
            }
            Err(_) => {
                tracing::warn!("timed out waiting for final transcript");
                cancel.cancel();
                transcript.abort();
                String::new()
            }
        };
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis(),
            text = %utterance,
            "recognition finished"
        );

        if utterance.is_empty() {
            publish(&self.state, &self.out, TurnState::Idle).await;
            return;
        }

        self.out
            .emit(ServerEvent::ChatUser {
                text: utterance.clone(),
            })
            .await;
        self.start_turn(utterance).await;
    }

    /// Reply to typed text, interrupting whatever is in progress
    pub async fn text_input(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            tracing::debug!("empty text input ignored");
            return;
        }

        self.cancel_active_turn().await;
        self.discard_recording().await;
        self.start_turn(text.to_string()).await;
    }

    /// Cancel the active reply and wait until its cleanup has finished
    pub async fn cancel_active_turn(&mut self) {
        let Some(reply) = self.reply.take() else {
            return;
        };

        if !reply.task.is_finished() {
            tracing::info!(turn = reply.turn, "interrupting active reply");
        }
        reply.cancel.cancel();
        if let Err(e) = reply.task.await {
            if e.is_panic() {
                tracing::error!(turn = reply.turn, error = %e, "reply task panicked");
            }
        }
    }

    /// Wait for the active reply to finish on its own
    pub async fn wait_for_reply(&mut self) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.task.await;
        }
    }

    /// Stop everything; used when the client disconnects
    pub async fn shutdown(&mut self) {
        self.discard_recording().await;
        self.cancel_active_turn().await;
        tracing::debug!(turns = self.turns, "session controller shut down");
    }

    async fn discard_recording(&mut self) {
        let Some(Recording {
            ingest,
            transcript,
            cancel,
        }) = self.recording.take()
        else {
            return;
        };

        cancel.cancel();
        drop(ingest);
        transcript.abort();
        let _ = transcript.await;
        tracing::debug!("recording discarded");
    }

    async fn start_turn(&mut self, utterance: String) {
        self.cancel_active_turn().await;
        self.turns += 1;

        let cancel = CancellationToken::new();
        let ctx = ReplyContext {
            turn: self.turns,
            services: self.services.clone(),
            out: self.out.clone(),
            state: Arc::clone(&self.state),
        };
        let task = tokio::spawn(run_reply(ctx, utterance, cancel.clone()));

        self.reply = Some(ActiveReply {
            turn: self.turns,
            cancel,
            task,
        });
    }
}

impl Drop for TurnController {
    fn drop(&mut self) {
        if let Some(recording) = self.recording.take() {
            recording.cancel.cancel();
            recording.transcript.abort();
        }
        if let Some(reply) = self.reply.take() {
            reply.cancel.cancel();
            reply.task.abort();
        }
    }
}

async fn publish(state: &watch::Sender<TurnState>, out: &SessionSink, next: TurnState) {
    state.send_replace(next);
    out.emit(ServerEvent::Status { state: next }).await;
}

struct ReplyContext {
    turn: u64,
    services: TurnServices,
    out: SessionSink,
    state: Arc<watch::Sender<TurnState>>,
}

enum ReplyOutcome {
    Finished,
    Cancelled,
    Failed(crate::Error),
}

async fn run_reply(ctx: ReplyContext, utterance: String, cancel: CancellationToken) {
    let ReplyContext {
        turn,
        services,
        out,
        state,
    } = ctx;

    tracing::info!(turn, text = %utterance, "reply started");
    publish(&state, &out, TurnState::Thinking).await;

    let started = Instant::now();
    let sink: Arc<dyn AudioSink> = Arc::new(out.clone());
    let mut speaker = ReplySpeaker::start(
        services.segmenter,
        Arc::clone(&services.synthesizer),
        sink,
    );
    let mut events = services.replies.reply(&utterance, cancel.child_token());
    let mut first_token: Option<Duration> = None;

    let outcome = loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break ReplyOutcome::Cancelled,
            event = events.next() => event,
        };

        match event {
            None => break ReplyOutcome::Finished,
            Some(Err(e)) => break ReplyOutcome::Failed(e),
            Some(Ok(ReplyEvent::Token {
                stage: ReplyStage::Speech,
                text,
            })) => {
                if first_token.is_none() {
                    let ttft = started.elapsed();
                    first_token = Some(ttft);
                    tracing::info!(turn, ttft_ms = ttft.as_millis(), "first reply token");
                    out.emit(ServerEvent::ChatAgentStart {
                        latency: format!("{}ms", ttft.as_millis()),
                    })
                    .await;
                    publish(&state, &out, TurnState::Speaking).await;
                }
                out.emit(ServerEvent::ChatAgentStream { text: text.clone() })
                    .await;
                speaker.feed(&text);
            }
            Some(Ok(ReplyEvent::StageFinished(ReplyStage::Speech))) => speaker.close(),
            Some(Ok(ReplyEvent::Thought { name, content })) => {
                out.emit(ServerEvent::Thought { name, content }).await;
            }
            Some(Ok(event)) => tracing::trace!(?event, "reply event not spoken"),
        }
    };
    drop(events);

    match outcome {
        ReplyOutcome::Finished => {
            let drained = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                report = speaker.drain() => Some(report),
            };
            match drained {
                Some(report) => tracing::info!(
                    turn,
                    segments = report.segments,
                    chunks = report.chunks,
                    first_audio_ms = report.first_audio.map(|d| d.as_millis()),
                    total_ms = started.elapsed().as_millis(),
                    "reply finished"
                ),
                None => {
                    speaker.cancel().await;
                    tracing::info!(turn, "reply interrupted during playback");
                }
            }
        }
        ReplyOutcome::Cancelled => {
            speaker.cancel().await;
            tracing::info!(turn, "reply interrupted");
        }
        ReplyOutcome::Failed(e) => {
            tracing::error!(turn, error = %e, "reply failed");
            speaker.cancel().await;
            if first_token.is_none() {
                out.emit(ServerEvent::ChatAgentStart {
                    latency: "Error".to_string(),
                })
                .await;
                out.emit(ServerEvent::ChatAgentStream {
                    text: ERROR_REPLY.to_string(),
                })
                .await;
            }
        }
    }

    publish(&state, &out, TurnState::Idle).await;
}
