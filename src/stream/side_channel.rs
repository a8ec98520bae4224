//! Best-effort translation and emotion classification alongside audio.
//!
//! Nothing here may hold up audio delivery: each call runs on its own task
//! under a timeout and degrades to `None` on error, timeout or blank output.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{EmotionConfig, LanguageConfig, TranslationConfig};
use crate::providers::{Emotion, EmotionClassifier, Translator};

/// Timeouts and pool size for side-channel work.
#[derive(Debug, Clone)]
pub struct SideChannelLimits {
    pub segment_timeout: Duration,
    pub full_timeout: Duration,
    pub emotion_timeout: Duration,
    pub translation_workers: usize,
}

impl Default for SideChannelLimits {
    fn default() -> Self {
        Self {
            segment_timeout: Duration::from_millis(5_000),
            full_timeout: Duration::from_millis(10_000),
            emotion_timeout: Duration::from_millis(10_000),
            translation_workers: 2,
        }
    }
}

impl SideChannelLimits {
    pub fn from_config(
        translation: &TranslationConfig,
        emotion: &EmotionConfig,
        translation_workers: usize,
    ) -> Self {
        Self {
            segment_timeout: Duration::from_millis(translation.segment_timeout_ms),
            full_timeout: Duration::from_millis(translation.full_timeout_ms),
            emotion_timeout: Duration::from_millis(emotion.timeout_ms),
            translation_workers,
        }
    }
}

/// Coordinates optional translation and emotion collaborators.
#[derive(Clone)]
pub struct SideChannel {
    translator: Option<Arc<dyn Translator>>,
    classifier: Option<Arc<dyn EmotionClassifier>>,
    languages: LanguageConfig,
    limits: SideChannelLimits,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl SideChannel {
    pub fn new(languages: LanguageConfig, limits: SideChannelLimits) -> Self {
        let permits = Arc::new(Semaphore::new(limits.translation_workers.max(1)));
        Self {
            translator: None,
            classifier: None,
            languages,
            limits,
            permits,
            cancel: CancellationToken::new(),
        }
    }

    /// A side channel that never translates or classifies.
    pub fn disabled() -> Self {
        Self::new(LanguageConfig::default(), SideChannelLimits::default())
    }

    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn EmotionClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Tie spawned work to an outer cancellation scope.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Whether displayed text must be translated from the voice language.
    pub fn needs_translation(&self) -> bool {
        self.translator.is_some()
            && self
                .languages
                .voice_output
                .as_deref()
                .is_some_and(|voice| voice != self.languages.text_output)
    }

    pub fn has_classifier(&self) -> bool {
        self.classifier.is_some()
    }

    /// Translate one segment for display. Runs on the translation pool.
    pub fn translate_segment(&self, text: &str) -> JoinHandle<Option<String>> {
        self.spawn_translation(text, self.limits.segment_timeout, "segment")
    }

    /// Translate the whole response in one call, with the longer timeout.
    pub fn translate_full(&self, text: &str) -> JoinHandle<Option<String>> {
        self.spawn_translation(text, self.limits.full_timeout, "full")
    }

    /// Classify the emotion of the raw full response.
    pub fn classify(&self, text: &str) -> JoinHandle<Option<Emotion>> {
        let Some(classifier) = self.classifier.clone() else {
            return tokio::spawn(async { None });
        };
        let text = text.to_string();
        let limit = self.limits.emotion_timeout;
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            if text.trim().is_empty() {
                return None;
            }
            let work = async move { classifier.classify(&text).await };
            let outcome = bounded(limit, &cancel, work).await;
            match outcome {
                Bounded::Done(Ok(emotion)) => {
                    tracing::info!(emotion = %emotion, "Emotion classified");
                    Some(emotion)
                }
                Bounded::Done(Err(e)) => {
                    tracing::warn!(error = %e, "Emotion classification failed");
                    None
                }
                Bounded::TimedOut => {
                    tracing::warn!(
                        timeout_ms = limit.as_millis() as u64,
                        "Emotion classification timed out"
                    );
                    None
                }
                Bounded::Cancelled => None,
            }
        })
    }

    fn spawn_translation(
        &self,
        text: &str,
        limit: Duration,
        scope: &'static str,
    ) -> JoinHandle<Option<String>> {
        let (Some(translator), Some(source)) =
            (self.translator.clone(), self.languages.voice_output.clone())
        else {
            return tokio::spawn(async { None });
        };
        if !self.needs_translation() {
            return tokio::spawn(async { None });
        }

        let target = self.languages.text_output.clone();
        let text = text.to_string();
        let permits = Arc::clone(&self.permits);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            if text.trim().is_empty() {
                return None;
            }
            let work = async move {
                let _permit = permits.acquire_owned().await?;
                translator.translate(&text, &source, &target).await
            };
            match bounded(limit, &cancel, work).await {
                Bounded::Done(Ok(translated)) if !translated.trim().is_empty() => Some(translated),
                Bounded::Done(Ok(_)) => {
                    tracing::debug!(scope, "Translation came back blank");
                    None
                }
                Bounded::Done(Err(e)) => {
                    tracing::warn!(scope, error = %e, "Translation failed, using original text");
                    None
                }
                Bounded::TimedOut => {
                    tracing::warn!(
                        scope,
                        timeout_ms = limit.as_millis() as u64,
                        "Translation timed out, using original text"
                    );
                    None
                }
                Bounded::Cancelled => None,
            }
        })
    }
}

enum Bounded<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

async fn bounded<F: Future>(
    limit: Duration,
    cancel: &CancellationToken,
    work: F,
) -> Bounded<F::Output> {
    tokio::select! {
        result = tokio::time::timeout(limit, work) => match result {
            Ok(value) => Bounded::Done(value),
            Err(_) => Bounded::TimedOut,
        },
        _ = cancel.cancelled() => Bounded::Cancelled,
    }
}
