//! Output schema of a streamed response.
//!
//! The transport receives three kinds of output, interleaved:
//!
//! ```text
//! Audio ─ Audio ─ Event(llm_stream) ─ Audio ─ ... ─ Event(llm_response)
//!       ─ Event(emotion_response) ─ ... ─ FullResponse
//! ```
//!
//! Audio blocks are strictly ordered among themselves; events are ordered
//! within each kind. `FullResponse` is always the last item.

use serde::{Deserialize, Serialize};

use super::segment::AudioBlock;
use crate::providers::Emotion;

/// Segment id reported with the whole-response emotion event.
pub const FULL_RESPONSE_ID: &str = "full_response";

// ── Side-channel events ───────────────────────────────────────────

/// JSON text events sent alongside the audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Display text for one segment, in segment order.
    LlmStream {
        data: String,
        /// Untranslated text, present only when `data` is a translation.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original: Option<String>,
    },

    /// Display text for the whole response.
    LlmResponse {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original: Option<String>,
    },

    /// Emotion of the whole response.
    EmotionResponse {
        data: Emotion,
        segment_id: String,
    },
}

impl ServerEvent {
    pub fn segment_text(data: impl Into<String>, original: Option<String>) -> Self {
        Self::LlmStream {
            data: data.into(),
            original,
        }
    }

    pub fn response_text(data: impl Into<String>, original: Option<String>) -> Self {
        Self::LlmResponse {
            data: data.into(),
            original,
        }
    }

    pub fn emotion(data: Emotion) -> Self {
        Self::EmotionResponse {
            data,
            segment_id: FULL_RESPONSE_ID.to_string(),
        }
    }

    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LlmStream { .. } => "llm_stream",
            Self::LlmResponse { .. } => "llm_response",
            Self::EmotionResponse { .. } => "emotion_response",
        }
    }
}

// ── Transport items ───────────────────────────────────────────────

/// One item handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutput {
    Audio(AudioBlock),
    Event(ServerEvent),
    /// Raw untranslated model output, emitted once after everything else.
    FullResponse(String),
}

impl StreamOutput {
    pub fn as_audio(&self) -> Option<&AudioBlock> {
        match self {
            Self::Audio(block) => Some(block),
            _ => None,
        }
    }

    pub fn as_event(&self) -> Option<&ServerEvent> {
        match self {
            Self::Event(event) => Some(event),
            _ => None,
        }
    }
}
