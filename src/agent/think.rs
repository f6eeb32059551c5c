//! Separating `<think>` blocks from a streamed reply
//!
//! Reasoning models wrap their scratch work in `<think>...</think>`. The tags
//! can arrive split across any number of tokens, so the filter holds back the
//! shortest tail that could still turn into a tag.

const OPEN: &str = "<think>";
const CLOSE: &str = "</think>";

/// Streaming splitter between visible text and thought text
#[derive(Debug, Default)]
pub struct ThinkFilter {
    pending: String,
    inside: bool,
    thought: String,
}

impl ThinkFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning the visible text it releases
    pub fn push(&mut self, chunk: &str) -> String {
        self.pending.push_str(chunk);
        let mut visible = String::new();

        loop {
            let tag = if self.inside { CLOSE } else { OPEN };

            if let Some(pos) = self.pending.find(tag) {
                let before: String = self.pending.drain(..pos).collect();
                self.pending.drain(..tag.len());
                self.route(&before, &mut visible);
                self.inside = !self.inside;
                continue;
            }

            let keep = partial_tag_len(&self.pending, tag);
            let release: String = self.pending.drain(..self.pending.len() - keep).collect();
            self.route(&release, &mut visible);
            return visible;
        }
    }

    /// Flush held-back text at the end of the stream
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        let mut visible = String::new();
        self.route(&rest, &mut visible);
        visible
    }

    /// Thought text collected so far, leaving the collector empty
    pub fn take_thought(&mut self) -> String {
        std::mem::take(&mut self.thought)
    }

    fn route(&mut self, text: &str, visible: &mut String) {
        if self.inside {
            self.thought.push_str(text);
        } else {
            visible.push_str(text);
        }
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `tag`
fn partial_tag_len(text: &str, tag: &str) -> usize {
    (1..tag.len())
        .rev()
        .find(|&n| {
            n <= text.len()
                && text.is_char_boundary(text.len() - n)
                && tag.starts_with(&text[text.len() - n..])
        })
        .unwrap_or(0)
}
