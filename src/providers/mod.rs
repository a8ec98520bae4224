//! External collaborators of the streaming core.
//!
//! The core consumes these only through the traits in [`traits`]; the HTTP
//! backends and the scripted fakes are interchangeable.

pub mod openai;
pub mod scripted;
pub mod siliconflow;
pub mod traits;

pub use openai::{OpenAiChat, OpenAiEmotionClassifier, OpenAiTranslator};
pub use siliconflow::{Pcm16Decoder, SiliconFlowSynthesizer};
pub use traits::{
    trim_messages, AudioStream, ChatMessage, Emotion, EmotionClassifier, Role, SpeechSynthesizer,
    TokenFragment, TokenSource, TokenStream, Translator,
};

use std::sync::Arc;

use crate::config::Config;

/// Typed failures of the HTTP backends.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider}: API key is not configured")]
    MissingApiKey { provider: &'static str },

    #[error("{provider} API error {status}: {body}")]
    Http {
        provider: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("{provider}: could not decode response: {detail}")]
    Decode {
        provider: &'static str,
        detail: String,
    },

    #[error("{provider}: request failed: {source}")]
    Transport {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

impl ProviderError {
    pub(crate) fn transport(provider: &'static str) -> impl FnOnce(reqwest::Error) -> Self {
        move |source| Self::Transport { provider, source }
    }

    /// Turn a non-success response into [`ProviderError::Http`].
    pub(crate) async fn check(
        provider: &'static str,
        resp: reqwest::Response,
    ) -> Result<reqwest::Response, Self> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(Self::Http {
            provider,
            status,
            body,
        })
    }
}

/// Every collaborator one streamed response needs.
pub struct Collaborators {
    pub tokens: Arc<dyn TokenSource>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub translator: Option<Arc<dyn Translator>>,
    pub classifier: Option<Arc<dyn EmotionClassifier>>,
}

impl Collaborators {
    /// HTTP-backed collaborators built from configuration.
    pub fn from_config(config: &Config) -> Self {
        let client = reqwest::Client::new();
        let translator: Arc<dyn Translator> =
            Arc::new(OpenAiTranslator::from_config(client.clone(), config));
        let classifier: Option<Arc<dyn EmotionClassifier>> = config.emotion.enabled.then(|| {
            Arc::new(OpenAiEmotionClassifier::from_config(client.clone(), config))
                as Arc<dyn EmotionClassifier>
        });

        Self {
            tokens: Arc::new(OpenAiChat::from_config(client.clone(), &config.llm)),
            synthesizer: Arc::new(SiliconFlowSynthesizer::from_config(client, &config.tts)),
            translator: Some(translator),
            classifier,
        }
    }

    /// In-process fakes that echo `prompt` back as the reply.
    pub fn dry_run(prompt: &str, config: &Config) -> Self {
        use scripted::{ScriptedSynthesizer, ScriptedTokenSource, StaticClassifier, SynthesisScript};

        let samples_per_chunk = (config.tts.sample_rate / 10) as usize;
        let script = SynthesisScript::chunks(3)
            .with_delay(std::time::Duration::from_millis(40))
            .with_block(config.tts.sample_rate, samples_per_chunk);

        Self {
            tokens: Arc::new(
                ScriptedTokenSource::echo(prompt, 3)
                    .with_delay(std::time::Duration::from_millis(20)),
            ),
            synthesizer: Arc::new(ScriptedSynthesizer::new(script)),
            translator: None,
            classifier: config
                .emotion
                .enabled
                .then(|| {
                    Arc::new(StaticClassifier::new(Emotion::Neutral)) as Arc<dyn EmotionClassifier>
                }),
        }
    }
}
