//! Incremental punctuation-based segmentation of streamed model text.
//!
//! The model's reply arrives as small fragments. Each fragment is appended
//! to a buffer which is re-split on every push:
//!
//! ```text
//! |--finalized--|--finalized--|------remainder------|
//! "你好，"        "世界。"        "今天天气"
//! ```
//!
//! - Break marks are sentence and clause punctuation, ASCII and CJK.
//! - A run of consecutive marks stays attached to the text before it.
//! - Spans shorter than `min_length` characters are merged forward.
//! - The last span is always held back as the remainder, since more text
//!   (or more punctuation) may still attach to it. Only [`Segmenter::finish`]
//!   finalizes it.

use serde::{Deserialize, Serialize};

/// Sentence- and clause-ending marks that may close a segment.
pub const BREAK_MARKS: &[char] = &[',', '.', '?', '!', ';', '，', '。', '？', '！', '；'];

/// Whether `c` is one of the [`BREAK_MARKS`].
pub fn is_break_mark(c: char) -> bool {
    BREAK_MARKS.contains(&c)
}

fn ends_with_break(text: &str) -> bool {
    text.chars().next_back().is_some_and(is_break_mark)
}

// ── Pure split ───────────────────────────────────────────────────

/// Result of one segmentation pass over a buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segmentation {
    /// Spans that will not change any more, in order.
    pub finalized: Vec<String>,
    /// Trailing text to re-submit with the next fragment appended.
    pub remainder: String,
}

/// Byte ranges of fragments, each closed by a run of break marks except
/// possibly the last one.
fn fragment_bounds(buffer: &str) -> Vec<(usize, usize)> {
    let mut bounds = Vec::new();
    let mut start = 0;
    let mut chars = buffer.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if !is_break_mark(c) {
            continue;
        }
        let mut end = i + c.len_utf8();
        while let Some(&(j, next)) = chars.peek() {
            if !is_break_mark(next) {
                break;
            }
            end = j + next.len_utf8();
            chars.next();
        }
        bounds.push((start, end));
        start = end;
    }

    if start < buffer.len() {
        bounds.push((start, buffer.len()));
    }
    bounds
}

/// Split `buffer` into finalized segments and a remainder.
///
/// Greedy left to right: the running span is emitted once it ends on a
/// break mark and holds at least `min_length` characters; otherwise the next
/// fragment is appended to it. Deterministic and side-effect free.
pub fn segment(buffer: &str, min_length: usize) -> Segmentation {
    let mut finalized = Vec::new();
    let mut current: Option<(usize, usize)> = None;

    for (start, end) in fragment_bounds(buffer) {
        let Some((cur_start, cur_end)) = current else {
            current = Some((start, end));
            continue;
        };
        let span = &buffer[cur_start..cur_end];
        if span.chars().count() >= min_length && ends_with_break(span) {
            if !span.trim().is_empty() {
                finalized.push(span.to_string());
            }
            current = Some((start, end));
        } else {
            current = Some((cur_start, end));
        }
    }

    let remainder = current
        .map(|(start, _)| buffer[start..].to_string())
        .unwrap_or_default();

    Segmentation {
        finalized,
        remainder,
    }
}

// ── Stateful segmenter ───────────────────────────────────────────

/// Configuration for the incremental segmenter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmenterConfig {
    /// Minimum characters in a finalized segment (except the forced tail).
    pub min_length: usize,
    /// Finalize the remainder early once it exceeds this many characters.
    /// `None` keeps merging until punctuation or end of stream.
    pub max_pending_chars: Option<usize>,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_length: 15,
            max_pending_chars: None,
        }
    }
}

/// Buffers streamed fragments and yields finalized segment texts.
#[derive(Debug)]
pub struct Segmenter {
    config: SegmenterConfig,
    buffer: String,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            buffer: String::new(),
        }
    }

    /// Append a fragment and return any segments it finalized.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buffer.push_str(fragment);
        let Segmentation {
            mut finalized,
            remainder,
        } = segment(&self.buffer, self.config.min_length);
        self.buffer = remainder;

        if let Some(max) = self.config.max_pending_chars {
            if self.buffer.chars().count() > max {
                if let Some(forced) = self.split_overflow() {
                    tracing::debug!(
                        chars = forced.chars().count(),
                        "Remainder overflowed, finalizing early"
                    );
                    finalized.push(forced);
                }
            }
        }

        finalized
    }

    /// Force the remainder out as the last segment (end of stream).
    ///
    /// Returns `None` when the remainder is blank.
    pub fn finish(&mut self) -> Option<String> {
        let tail = std::mem::take(&mut self.buffer);
        let tail = tail.trim();
        if tail.is_empty() {
            None
        } else {
            Some(tail.to_string())
        }
    }

    /// Text not yet finalized.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Cut the buffer at its last whitespace, or take all of it when there
    /// is none.
    fn split_overflow(&mut self) -> Option<String> {
        let cut = self
            .buffer
            .char_indices()
            .rev()
            .find(|&(i, c)| c.is_whitespace() && !self.buffer[..i].trim().is_empty())
            .map(|(i, _)| i);

        let head = match cut {
            Some(i) => {
                let rest = self.buffer.split_off(i);
                std::mem::replace(&mut self.buffer, rest)
            }
            None => std::mem::take(&mut self.buffer),
        };

        if head.trim().is_empty() {
            None
        } else {
            Some(head)
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
