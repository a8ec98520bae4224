//! Deterministic in-process collaborators.
//!
//! Used by the CLI `--dry-run` mode and throughout the tests. Every knob is
//! explicit: fragment lists, per-text synthesis behaviour, fixed delays.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::traits::{
    AudioStream, ChatMessage, Emotion, EmotionClassifier, SpeechSynthesizer, TokenFragment,
    TokenSource, TokenStream, Translator,
};
use crate::stream::AudioBlock;

// ── Token source ─────────────────────────────────────────────────

/// Replays a fixed list of fragments.
pub struct ScriptedTokenSource {
    fragments: Vec<String>,
    delay: Duration,
    fail_at: Option<usize>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedTokenSource {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            delay: Duration::ZERO,
            fail_at: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Echo `text` back in fragments of `size` characters.
    pub fn echo(text: &str, size: usize) -> Self {
        let chars: Vec<char> = text.chars().collect();
        Self::new(
            chars
                .chunks(size.max(1))
                .map(|c| c.iter().collect::<String>()),
        )
    }

    /// Sleep this long before each fragment.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Yield an error in place of fragment `index`.
    pub fn failing_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    /// Message lists passed to [`TokenSource::stream`], in call order.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().clone()
    }

    /// The fragment stream without going through the trait.
    pub fn fragments(&self) -> TokenStream {
        let delay = self.delay;
        let fail_at = self.fail_at;
        let items = self.fragments.clone().into_iter().enumerate();

        stream::unfold((items, String::new()), move |(mut items, mut text)| async move {
            let (index, delta) = items.next()?;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if fail_at == Some(index) {
                let err = anyhow::anyhow!("scripted token failure at fragment {index}");
                return Some((Err(err), (items, text)));
            }
            text.push_str(&delta);
            let fragment = TokenFragment {
                delta,
                text: text.clone(),
            };
            Some((Ok(fragment), (items, text)))
        })
        .boxed()
    }
}

#[async_trait]
impl TokenSource for ScriptedTokenSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, messages: &[ChatMessage]) -> anyhow::Result<TokenStream> {
        self.requests.lock().push(messages.to_vec());
        Ok(self.fragments())
    }
}

// ── Speech synthesis ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Complete,
    Fail,
    ErrorAfterChunks,
    Hang,
}

/// How one synthesis call behaves.
#[derive(Debug, Clone)]
pub struct SynthesisScript {
    outcome: Outcome,
    chunks: usize,
    delay: Duration,
    value: f32,
    sample_rate: u32,
    samples_per_chunk: usize,
}

impl SynthesisScript {
    /// Produce `chunks` blocks and finish.
    pub fn chunks(chunks: usize) -> Self {
        Self {
            outcome: Outcome::Complete,
            chunks,
            delay: Duration::ZERO,
            value: 0.0,
            sample_rate: 32_000,
            samples_per_chunk: 1,
        }
    }

    /// Fail before producing anything.
    pub fn fail() -> Self {
        Self {
            outcome: Outcome::Fail,
            ..Self::chunks(0)
        }
    }

    /// Produce `chunks` blocks, then error.
    pub fn chunks_then_error(chunks: usize) -> Self {
        Self {
            outcome: Outcome::ErrorAfterChunks,
            ..Self::chunks(chunks)
        }
    }

    /// Never return.
    pub fn hang() -> Self {
        Self {
            outcome: Outcome::Hang,
            ..Self::chunks(0)
        }
    }

    /// Wait this long before the first block.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fill every sample with `value`, so tests can tell segments apart.
    pub fn with_value(mut self, value: f32) -> Self {
        self.value = value;
        self
    }

    pub fn with_block(mut self, sample_rate: u32, samples_per_chunk: usize) -> Self {
        self.sample_rate = sample_rate;
        self.samples_per_chunk = samples_per_chunk.max(1);
        self
    }

    fn blocks(&self) -> Vec<AudioBlock> {
        (0..self.chunks)
            .map(|_| AudioBlock::new(self.sample_rate, vec![self.value; self.samples_per_chunk]))
            .collect()
    }
}

/// Synthesizer driven by [`SynthesisScript`]s, chosen per input text.
pub struct ScriptedSynthesizer {
    default: SynthesisScript,
    per_text: HashMap<String, SynthesisScript>,
    calls: Mutex<Vec<(String, String)>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedSynthesizer {
    pub fn new(default: SynthesisScript) -> Self {
        Self {
            default,
            per_text: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Use `script` whenever the input text equals `text`.
    pub fn with_script_for(mut self, text: impl Into<String>, script: SynthesisScript) -> Self {
        self.per_text.insert(text.into(), script);
        self
    }

    /// `(text, voice)` of every call, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    /// Highest number of syntheses observed in flight at once. A synthesis
    /// stays in flight until its audio stream is dropped.
    pub fn max_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight counter however the synthesis ends.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    /// Keep counting until `audio` is dropped.
    fn hold(self, audio: AudioStream) -> AudioStream {
        audio
            .map(move |block| {
                let _held = &self;
                block
            })
            .boxed()
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedSynthesizer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn synthesize(&self, text: &str, voice: &str) -> anyhow::Result<AudioStream> {
        self.calls.lock().push((text.to_string(), voice.to_string()));
        let script = self.per_text.get(text).unwrap_or(&self.default).clone();

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let in_flight = InFlight(Arc::clone(&self.active));

        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }

        match script.outcome {
            Outcome::Complete => {
                let blocks = stream::iter(script.blocks().into_iter().map(Ok)).boxed();
                Ok(in_flight.hold(blocks))
            }
            Outcome::Fail => anyhow::bail!("scripted synthesis failure"),
            Outcome::ErrorAfterChunks => {
                let blocks = script.blocks().into_iter().map(Ok);
                let tail = std::iter::once(Err(anyhow::anyhow!("scripted stream failure")));
                Ok(in_flight.hold(stream::iter(blocks.chain(tail)).boxed()))
            }
            Outcome::Hang => {
                let _held = in_flight;
                std::future::pending().await
            }
        }
    }
}

// ── Translation and emotion ──────────────────────────────────────

/// Translator that prefixes its input, or always fails.
pub struct StaticTranslator {
    prefix: Option<String>,
    delay: Duration,
}

impl StaticTranslator {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            delay: Duration::ZERO,
        }
    }

    pub fn failing() -> Self {
        Self {
            prefix: None,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Translator for StaticTranslator {
    async fn translate(
        &self,
        text: &str,
        _source_language: &str,
        _target_language: &str,
    ) -> anyhow::Result<String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.prefix {
            Some(prefix) => Ok(format!("{prefix}{text}")),
            None => anyhow::bail!("scripted translation failure"),
        }
    }
}

/// Classifier that always answers the same label.
pub struct StaticClassifier {
    emotion: Option<Emotion>,
}

impl StaticClassifier {
    pub fn new(emotion: Emotion) -> Self {
        Self {
            emotion: Some(emotion),
        }
    }

    pub fn failing() -> Self {
        Self { emotion: None }
    }
}

#[async_trait]
impl EmotionClassifier for StaticClassifier {
    async fn classify(&self, _text: &str) -> anyhow::Result<Emotion> {
        self.emotion
            .ok_or_else(|| anyhow::anyhow!("scripted classification failure"))
    }
}
