//! Core data types shared by the segmenter, dispatcher and reassembly queue.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ── Segment identity ─────────────────────────────────────────────

/// Opaque unique token identifying one segment.
///
/// The literal value carries no ordering meaning; ordering is owned by the
/// reassembly queue's active order list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentId(uuid::Uuid);

impl SegmentId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SegmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable.
        let full = self.0.simple().to_string();
        f.write_str(&full[..8])
    }
}

// ── Segment ──────────────────────────────────────────────────────

/// Lifecycle of a segment's synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    /// Registered and dispatched, no audio yet.
    Pending,
    /// At least one chunk has arrived.
    Streaming,
    /// Completion marker arrived after one or more chunks.
    Complete,
    /// Completion marker arrived without any chunk.
    Failed,
}

impl SegmentStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Streaming => "streaming",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A finalized span of generated text, the unit of ordering and synthesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    /// Monotonic position assigned at creation, never reused.
    pub order_index: u64,
    pub text: String,
}

impl Segment {
    pub fn new(order_index: u64, text: impl Into<String>) -> Self {
        Self {
            id: SegmentId::new(),
            order_index,
            text: text.into(),
        }
    }
}

// ── Audio ────────────────────────────────────────────────────────

/// One block of synthesized samples, as produced by a synthesizer.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    pub sample_rate: u32,
    /// Mono samples in `[-1.0, 1.0]`.
    pub samples: Arc<[f32]>,
}

impl AudioBlock {
    pub fn new(sample_rate: u32, samples: impl Into<Arc<[f32]>>) -> Self {
        Self {
            sample_rate,
            samples: samples.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / u64::from(self.sample_rate)
    }
}

/// An audio block tagged with the segment that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub segment_id: SegmentId,
    pub block: AudioBlock,
}

// ── Intake messages ──────────────────────────────────────────────

/// Payload pushed by a synthesis task onto the shared intake channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisEvent {
    Chunk(AudioBlock),
    /// The synthesizer's sequence ended, successfully or not.
    Done,
}

/// Item on the intake channel, tagged with its segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisMessage {
    pub segment_id: SegmentId,
    pub event: SynthesisEvent,
}

impl SynthesisMessage {
    pub fn chunk(segment_id: SegmentId, block: AudioBlock) -> Self {
        Self {
            segment_id,
            event: SynthesisEvent::Chunk(block),
        }
    }

    pub fn done(segment_id: SegmentId) -> Self {
        Self {
            segment_id,
            event: SynthesisEvent::Done,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_ids_are_unique() {
        let a = Segment::new(0, "a");
        let b = Segment::new(1, "b");
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.to_string().len(), 8);
    }

    #[test]
    fn block_duration() {
        let block = AudioBlock::new(16_000, vec![0.0_f32; 8_000]);
        assert_eq!(block.duration_ms(), 500);
        assert_eq!(AudioBlock::new(0, vec![0.0_f32; 4]).duration_ms(), 0);
    }
}
