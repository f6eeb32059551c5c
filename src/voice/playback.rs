//! Ordered delivery of synthesized audio
//!
//! Segments are synthesized concurrently but played strictly in submission
//! order. Each submitted segment gets its own chunk buffer, registered in a
//! FIFO before its synthesis starts; a single sender task drains the FIFO one
//! buffer at a time, so a later segment that finishes first simply waits.
//!
//! ```text
//! submit(S0) ─► [buf0] ─┐
//! submit(S1) ─► [buf1] ─┼─► FIFO ─► sender ─► AudioSink
//! submit(S2) ─► [buf2] ─┘
//! ```
//!
//! A buffer is complete when its channel closes, which happens when the
//! synthesis task that owns the other end returns. Closing the FIFO itself
//! marks the end of the reply.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::segmenter::TextSegment;
use super::tts::Synthesizer;
use crate::Result;

/// Where played audio goes
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Deliver one chunk of PCM audio
    ///
    /// # Errors
    ///
    /// Returns error once the destination has gone away; no more chunks
    /// will be offered after that
    async fn send_audio(&self, chunk: Bytes) -> Result<()>;
}

/// What the sender delivered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackReport {
    pub segments: usize,
    pub chunks: usize,
    pub bytes: usize,
    /// Time from pipeline start to the first delivered chunk
    pub first_audio: Option<Duration>,
    /// The sink refused a chunk and delivery stopped early
    pub sink_closed: bool,
}

type SegmentAudio = mpsc::UnboundedReceiver<Bytes>;

/// Concurrent synthesis with in-order delivery
pub struct PlaybackPipeline {
    synthesizer: Arc<dyn Synthesizer>,
    queue: Option<mpsc::UnboundedSender<SegmentAudio>>,
    prefetch: JoinSet<()>,
    sender: Option<JoinHandle<PlaybackReport>>,
    cancel: CancellationToken,
    submitted: usize,
}

impl PlaybackPipeline {
    /// Start the sender task; must be called inside a Tokio runtime
    #[must_use]
    pub fn new(synthesizer: Arc<dyn Synthesizer>, sink: Arc<dyn AudioSink>) -> Self {
        let (queue, pending) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let sender = tokio::spawn(run_sender(pending, sink, cancel.clone()));

        Self {
            synthesizer,
            queue: Some(queue),
            prefetch: JoinSet::new(),
            sender: Some(sender),
            cancel,
            submitted: 0,
        }
    }

    /// Queue a segment for playback and start synthesizing it immediately
    pub fn submit(&mut self, segment: TextSegment) {
        let Some(queue) = &self.queue else {
            tracing::warn!(index = segment.index, "segment submitted after finish, dropped");
            return;
        };

        // The buffer takes its place in line before synthesis begins
        let (chunks, buffer) = mpsc::unbounded_channel();
        if queue.send(buffer).is_err() {
            tracing::debug!(index = segment.index, "playback stopped, segment dropped");
            return;
        }
        self.submitted += 1;

        let synthesizer = Arc::clone(&self.synthesizer);
        let cancel = self.cancel.child_token();
        self.prefetch.spawn(async move {
            tracing::debug!(index = segment.index, text = %segment.text, "synthesizing segment");
            let status = synthesizer.synthesize(&segment.text, chunks, cancel).await;
            if !status.is_complete() {
                tracing::warn!(index = segment.index, ?status, "segment synthesis incomplete");
            }
        });

        // Reap finished prefetches so the set does not grow with the reply
        while self.prefetch.try_join_next().is_some() {}
    }

    /// Mark the end of the reply; the sender stops after the last buffer
    pub fn finish(&mut self) {
        self.queue = None;
    }

    /// Number of segments accepted so far
    #[must_use]
    pub const fn submitted(&self) -> usize {
        self.submitted
    }

    /// Wait until every submitted segment has been delivered
    ///
    /// Only meaningful after `finish`; without it the sender keeps waiting
    /// for more segments. Safe to drop mid-await and follow with `cancel`.
    pub async fn drain(&mut self) -> PlaybackReport {
        let report = match self.sender.as_mut() {
            Some(sender) => sender.await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "playback sender ended abnormally");
                PlaybackReport::default()
            }),
            None => PlaybackReport::default(),
        };
        self.sender = None;

        while self.prefetch.join_next().await.is_some() {}
        report
    }

    /// Stop synthesis and delivery immediately
    ///
    /// When this returns no further chunk will reach the sink. Calling it
    /// again is a no-op.
    pub async fn cancel(&mut self) {
        self.cancel.cancel();
        self.queue = None;

        if let Some(sender) = self.sender.take() {
            sender.abort();
            let _ = sender.await;
        }

        self.prefetch.abort_all();
        while self.prefetch.join_next().await.is_some() {}
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(sender) = self.sender.take() {
            sender.abort();
        }
        // JoinSet aborts its remaining tasks on drop
    }
}

async fn run_sender(
    mut pending: mpsc::UnboundedReceiver<SegmentAudio>,
    sink: Arc<dyn AudioSink>,
    cancel: CancellationToken,
) -> PlaybackReport {
    let started = Instant::now();
    let mut report = PlaybackReport::default();

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return report,
            next = pending.recv() => next,
        };
        let Some(mut buffer) = next else { break };

        loop {
            let chunk = tokio::select! {
                biased;
                () = cancel.cancelled() => return report,
                chunk = buffer.recv() => chunk,
            };
            let Some(chunk) = chunk else { break };

            let len = chunk.len();
            if let Err(e) = sink.send_audio(chunk).await {
                tracing::debug!(error = %e, "audio sink closed, stopping playback");
                report.sink_closed = true;
                return report;
            }

            if report.first_audio.is_none() {
                report.first_audio = Some(started.elapsed());
            }
            report.chunks += 1;
            report.bytes += len;
        }

        report.segments += 1;
    }

    tracing::debug!(
        segments = report.segments,
        chunks = report.chunks,
        bytes = report.bytes,
        "playback drained"
    );
    report
}
