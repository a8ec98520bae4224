//! Collaborator traits consumed by the streaming core.
//!
//! Concrete backends (OpenAI-compatible chat, HTTP speech synthesis, the
//! scripted in-process fakes) implement these; the orchestrator only ever
//! sees trait objects.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::stream::AudioBlock;

// ── Chat messages ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of conversation context sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Keep every system message plus the most recent others, `max_len` total.
///
/// When the system messages alone reach `max_len`, only they are kept.
pub fn trim_messages(messages: &[ChatMessage], max_len: usize) -> Vec<ChatMessage> {
    if messages.len() <= max_len {
        return messages.to_vec();
    }

    let (system, rest): (Vec<&ChatMessage>, Vec<&ChatMessage>) =
        messages.iter().partition(|m| m.role == Role::System);

    let keep = max_len.saturating_sub(system.len());
    let skip = rest.len().saturating_sub(keep);

    system
        .into_iter()
        .chain(rest.into_iter().skip(skip))
        .cloned()
        .collect()
}

// ── Token source ─────────────────────────────────────────────────

/// An incremental piece of model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenFragment {
    /// Newly generated text.
    pub delta: String,
    /// Everything generated so far, including `delta`.
    pub text: String,
}

pub type TokenStream = BoxStream<'static, anyhow::Result<TokenFragment>>;

/// Produces the model's reply as a lazy fragment stream.
#[async_trait]
pub trait TokenSource: Send + Sync {
    fn name(&self) -> &str;

    /// Start a new generation for `messages`.
    async fn stream(&self, messages: &[ChatMessage]) -> anyhow::Result<TokenStream>;
}

// ── Speech synthesis ─────────────────────────────────────────────

pub type AudioStream = BoxStream<'static, anyhow::Result<AudioBlock>>;

/// Turns a text segment into a lazy stream of audio blocks.
///
/// An empty stream means the synthesizer produced nothing; the caller treats
/// that segment as failed.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    fn name(&self) -> &str;

    async fn synthesize(&self, text: &str, voice: &str) -> anyhow::Result<AudioStream>;
}

// ── Translation ──────────────────────────────────────────────────

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> anyhow::Result<String>;
}

// ── Emotion ──────────────────────────────────────────────────────

/// Avatar expression labels an emotion classifier may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Neutral,
    Anger,
    Joy,
    Sadness,
    Shy,
    Shy2,
    Smile1,
    Smile2,
    Unhappy,
}

impl Emotion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Neutral => "neutral",
            Self::Anger => "anger",
            Self::Joy => "joy",
            Self::Sadness => "sadness",
            Self::Shy => "shy",
            Self::Shy2 => "shy2",
            Self::Smile1 => "smile1",
            Self::Smile2 => "smile2",
            Self::Unhappy => "unhappy",
        }
    }

    pub fn all() -> &'static [Emotion] {
        &[
            Self::Neutral,
            Self::Anger,
            Self::Joy,
            Self::Sadness,
            Self::Shy,
            Self::Shy2,
            Self::Smile1,
            Self::Smile2,
            Self::Unhappy,
        ]
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Emotion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Self::all()
            .iter()
            .copied()
            .find(|e| e.as_str() == wanted)
            .ok_or_else(|| anyhow::anyhow!("Unknown emotion label: {s}"))
    }
}

#[async_trait]
pub trait EmotionClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> anyhow::Result<Emotion>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_keeps_system_and_recent_messages() {
        let mut messages = vec![ChatMessage::system("persona")];
        for i in 0..10 {
            messages.push(ChatMessage::user(format!("u{i}")));
            messages.push(ChatMessage::assistant(format!("a{i}")));
        }
        let trimmed = trim_messages(&messages, 4);
        let contents: Vec<&str> = trimmed.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["persona", "a8", "u9", "a9"]);
    }

    #[test]
    fn trim_short_history_is_untouched() {
        let messages = vec![ChatMessage::system("s"), ChatMessage::user("hi")];
        assert_eq!(trim_messages(&messages, 20), messages);
    }

    #[test]
    fn trim_to_system_only() {
        let messages = vec![
            ChatMessage::system("a"),
            ChatMessage::system("b"),
            ChatMessage::user("c"),
        ];
        let trimmed = trim_messages(&messages, 2);
        assert!(trimmed.iter().all(|m| m.role == Role::System));
        assert_eq!(trimmed.len(), 2);
    }

    #[test]
    fn emotion_labels_round_trip_through_serde() {
        let json = serde_json::to_string(&Emotion::Smile2).unwrap();
        assert_eq!(json, "\"smile2\"");
        assert_eq!("  Joy ".parse::<Emotion>().unwrap(), Emotion::Joy);
        assert!("furious".parse::<Emotion>().is_err());
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_value(ChatMessage::user("hi")).unwrap();
        assert_eq!(json["role"], "user");
    }
}
