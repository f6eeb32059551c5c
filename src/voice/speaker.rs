//! Speaks a streamed reply: segmentation feeding the playback pipeline

use std::sync::Arc;

use super::playback::{AudioSink, PlaybackPipeline, PlaybackReport};
use super::segmenter::SegmentSplitter;
use super::tts::Synthesizer;
use crate::config::SegmenterConfig;

/// One reply's worth of speech output
pub struct ReplySpeaker {
    splitter: SegmentSplitter,
    playback: PlaybackPipeline,
    closed: bool,
}

impl ReplySpeaker {
    /// Start a speaker; must be called inside a Tokio runtime
    #[must_use]
    pub fn start(
        thresholds: SegmenterConfig,
        synthesizer: Arc<dyn Synthesizer>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        Self {
            splitter: SegmentSplitter::new(thresholds),
            playback: PlaybackPipeline::new(synthesizer, sink),
            closed: false,
        }
    }

    /// Feed one reply token
    pub fn feed(&mut self, token: &str) {
        if self.closed {
            return;
        }
        if let Some(segment) = self.splitter.push(token) {
            self.playback.submit(segment);
        }
    }

    /// End of the speakable text: flush the remainder and close the queue
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(segment) = self.splitter.finish() {
            self.playback.submit(segment);
        }
        self.playback.finish();
    }

    /// Wait for everything queued to be played
    pub async fn drain(&mut self) -> PlaybackReport {
        self.close();
        let report = self.playback.drain().await;
        tracing::debug!(
            segments = self.playback.submitted(),
            delivered = report.segments,
            "reply spoken"
        );
        report
    }

    /// Drop pending text and stop all audio
    pub async fn cancel(&mut self) {
        self.closed = true;
        self.playback.cancel().await;
    }

    /// Segments handed to synthesis so far
    #[must_use]
    pub const fn segments(&self) -> usize {
        self.playback.submitted()
    }
}
