//! Reply segmentation for streaming synthesis
//!
//! Turns a live token stream into speakable segments. The first segment waits
//! for a sentence end so the synthesizer can shape its tail; cutting it
//! mid-clause is audible as a clipped syllable. Later segments may cut on a
//! clause separator once the buffer is long enough.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::SegmenterConfig;

/// Sentence-ending punctuation, full- and half-width
///
/// A half-width period directly after a digit is a decimal point, not a boundary.
static STRONG_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[。！？!?\n]|(?:^|[^0-9])\.").expect("valid regex")
});

/// Clause separators, full- and half-width
static WEAK_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[，,；;]").expect("valid regex"));

/// A piece of reply text chosen for synthesis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSegment {
    /// Creation order; playback follows this order
    pub index: usize,
    pub text: String,
}

/// Accumulates tokens and decides where to cut
#[derive(Debug)]
pub struct SegmentSplitter {
    buffer: String,
    first_pending: bool,
    thresholds: SegmenterConfig,
    next_index: usize,
}

impl SegmentSplitter {
    #[must_use]
    pub const fn new(thresholds: SegmenterConfig) -> Self {
        Self {
            buffer: String::new(),
            first_pending: true,
            thresholds,
            next_index: 0,
        }
    }

    /// Append a token and emit at most one segment
    pub fn push(&mut self, token: &str) -> Option<TextSegment> {
        self.buffer.push_str(token);
        let at = self.split_point()?;
        self.cut(at)
    }

    /// Flush whatever is left once the token stream has ended
    pub fn finish(&mut self) -> Option<TextSegment> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            return None;
        }
        Some(self.make_segment(rest))
    }

    /// Text accumulated but not yet emitted
    #[must_use]
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    /// Number of segments emitted so far
    #[must_use]
    pub const fn emitted(&self) -> usize {
        self.next_index
    }

    /// Byte offset to cut at, if the buffer should be split now
    fn split_point(&self) -> Option<usize> {
        if let Some(m) = STRONG_BOUNDARY.find(&self.buffer) {
            return Some(m.end());
        }

        let threshold = if self.first_pending {
            self.thresholds.first_segment_chars
        } else {
            self.thresholds.next_segment_chars
        };
        if self.buffer.chars().count() <= threshold {
            return None;
        }

        // Past the threshold: prefer a clause separator, else cut everything
        Some(
            WEAK_BOUNDARY
                .find(&self.buffer)
                .map_or(self.buffer.len(), |m| m.end()),
        )
    }

    fn cut(&mut self, at: usize) -> Option<TextSegment> {
        let rest = self.buffer.split_off(at);
        let head = std::mem::replace(&mut self.buffer, rest);

        // Whitespace-only heads are dropped without consuming the first slot
        if head.trim().is_empty() {
            return None;
        }
        self.first_pending = false;
        Some(self.make_segment(head))
    }

    fn make_segment(&mut self, text: String) -> TextSegment {
        let segment = TextSegment {
            index: self.next_index,
            text,
        };
        self.next_index += 1;
        segment
    }
}

impl Default for SegmentSplitter {
    fn default() -> Self {
        Self::new(SegmenterConfig::default())
    }
}
