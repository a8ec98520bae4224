//! HTTP speech synthesis returning raw PCM16, streamed as float blocks.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::time::Duration;

use super::traits::{AudioStream, SpeechSynthesizer};
use super::ProviderError;
use crate::config::TtsConfig;
use crate::stream::AudioBlock;

const PROVIDER: &str = "siliconflow";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

// ── PCM decoding ─────────────────────────────────────────────────

/// Converts little-endian 16-bit PCM bytes to samples in `[-1.0, 1.0)`.
///
/// Network chunks can end mid-sample, so an odd trailing byte is held until
/// the next push. Whatever is left at end of stream is dropped.
#[derive(Debug, Default)]
pub struct Pcm16Decoder {
    carry: Option<u8>,
}

impl Pcm16Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<f32> {
        let mut input = bytes;
        let mut samples = Vec::with_capacity((bytes.len() + 1) / 2);

        if let Some(low) = self.carry.take() {
            match input.split_first() {
                Some((&high, rest)) => {
                    samples.push(sample(low, high));
                    input = rest;
                }
                None => {
                    self.carry = Some(low);
                    return samples;
                }
            }
        }

        let mut pairs = input.chunks_exact(2);
        samples.extend(pairs.by_ref().map(|p| sample(p[0], p[1])));
        self.carry = pairs.remainder().first().copied();
        samples
    }

    /// Whether a partial sample is buffered.
    pub fn has_partial(&self) -> bool {
        self.carry.is_some()
    }
}

fn sample(low: u8, high: u8) -> f32 {
    f32::from(i16::from_le_bytes([low, high])) / 32768.0
}

// ── Synthesizer ──────────────────────────────────────────────────

pub struct SiliconFlowSynthesizer {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    sample_rate: u32,
}

impl SiliconFlowSynthesizer {
    pub fn from_config(client: reqwest::Client, config: &TtsConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            sample_rate: config.sample_rate,
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for SiliconFlowSynthesizer {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn synthesize(&self, text: &str, voice: &str) -> anyhow::Result<AudioStream> {
        if text.trim().is_empty() {
            tracing::warn!("Empty synthesis input, producing no audio");
            return Ok(stream::empty().boxed());
        }
        let api_key = self
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ProviderError::MissingApiKey { provider: PROVIDER })?;

        let payload = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": voice,
            "sample_rate": self.sample_rate,
            "response_format": "pcm",
        });

        let resp = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(api_key)
            .json(&payload)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(ProviderError::transport(PROVIDER))?;
        let resp = ProviderError::check(PROVIDER, resp).await?;

        let body = resp.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed();
        Ok(pcm_blocks(body, self.sample_rate))
    }
}

fn pcm_blocks(body: BoxStream<'static, reqwest::Result<Vec<u8>>>, sample_rate: u32) -> AudioStream {
    stream::unfold(
        (body, Pcm16Decoder::new(), false),
        move |(mut body, mut decoder, failed)| async move {
            if failed {
                return None;
            }
            loop {
                match body.next().await {
                    Some(Ok(bytes)) => {
                        let samples = decoder.push(&bytes);
                        if !samples.is_empty() {
                            let block = AudioBlock::new(sample_rate, samples);
                            return Some((Ok(block), (body, decoder, false)));
                        }
                    }
                    Some(Err(e)) => {
                        let err = anyhow::Error::from(ProviderError::Transport {
                            provider: PROVIDER,
                            source: e,
                        });
                        return Some((Err(err), (body, decoder, true)));
                    }
                    None => {
                        if decoder.has_partial() {
                            tracing::debug!("Dropping trailing odd PCM byte");
                        }
                        return None;
                    }
                }
            }
        },
    )
    .boxed()
}
