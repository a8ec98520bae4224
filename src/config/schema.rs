use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::stream::SegmenterConfig;

/// Top-level configuration, read from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Where this configuration was loaded from (not serialized).
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub translation: TranslationConfig,
    #[serde(default)]
    pub emotion: EmotionConfig,
    #[serde(default)]
    pub languages: LanguageConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

// ── Language model ────────────────────────────────────────────────

/// OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Generation cap per response.
    pub max_tokens: u32,
    /// Context messages kept per request, system messages included.
    pub max_context_messages: usize,
    pub system_prompt: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key: None,
            model: "gpt-4o-mini".into(),
            max_tokens: 200,
            max_context_messages: 20,
            system_prompt: None,
        }
    }
}

// ── Speech synthesis ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Voice identifier passed with every request.
    pub voice: String,
    pub sample_rate: u32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.siliconflow.cn/v1".into(),
            api_key: None,
            model: "FunAudioLLM/CosyVoice2-0.5B".into(),
            voice: "FunAudioLLM/CosyVoice2-0.5B:alex".into(),
            sample_rate: 32_000,
        }
    }
}

// ── Side channel ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    pub model: String,
    /// Per-segment translation budget.
    pub segment_timeout_ms: u64,
    /// Whole-response translation budget.
    pub full_timeout_ms: u64,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4.1-nano".into(),
            segment_timeout_ms: 5_000,
            full_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmotionConfig {
    pub enabled: bool,
    pub model: String,
    pub timeout_ms: u64,
}

impl Default for EmotionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "gpt-4.1-nano".into(),
            timeout_ms: 10_000,
        }
    }
}

/// Spoken language versus displayed language.
///
/// Segment text is translated for display only when `voice_output` is set
/// and differs from `text_output`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageConfig {
    pub voice_output: Option<String>,
    pub text_output: String,
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self {
            voice_output: None,
            text_output: "zh".into(),
        }
    }
}

// ── Streaming core ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Shortest finalized segment, in characters.
    pub min_segment_length: usize,
    /// Split the unfinished remainder early past this many characters.
    pub max_pending_chars: Option<usize>,
    pub synthesis_workers: usize,
    pub translation_workers: usize,
    /// Interval between reassembly drains.
    pub poll_interval_ms: u64,
    /// Consecutive idle drains tolerated while synthesis is outstanding.
    pub max_no_progress_polls: u32,
    /// Minimum spacing between released audio blocks.
    pub min_audio_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            min_segment_length: 15,
            max_pending_chars: None,
            synthesis_workers: 4,
            translation_workers: 2,
            poll_interval_ms: 50,
            max_no_progress_polls: 50,
            min_audio_interval_ms: 10,
        }
    }
}

impl StreamConfig {
    pub fn segmenter(&self) -> SegmenterConfig {
        SegmenterConfig {
            min_length: self.min_segment_length,
            max_pending_chars: self.max_pending_chars,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn min_audio_interval(&self) -> Duration {
        Duration::from_millis(self.min_audio_interval_ms)
    }
}
