//! Configuration loading.
//!
//! Lookup order: explicit path, then `~/.voicestream/config.toml`, then
//! built-in defaults. Environment variables override whatever was loaded.

pub mod schema;

pub use schema::{
    Config, EmotionConfig, LanguageConfig, LlmConfig, StreamConfig, TranslationConfig, TtsConfig,
};

use anyhow::Context;
use std::path::{Path, PathBuf};

const CONFIG_DIR: &str = ".voicestream";
const CONFIG_FILE: &str = "config.toml";

/// Default config location under the user's home directory.
pub fn default_config_path() -> Option<PathBuf> {
    directories::UserDirs::new().map(|u| u.home_dir().join(CONFIG_DIR).join(CONFIG_FILE))
}

impl Config {
    /// Load, apply environment overrides, and validate.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => {
                    tracing::debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let mut config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.config_path = Some(path.to_path_buf());
        tracing::info!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Overlay values taken from `lookup` (the process environment in
    /// production). Blank values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get("LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(url) = get("LLM_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = get("AI_MODEL") {
            self.llm.model = model;
        }
        if let Some(key) = get("SILICONFLOW_API_KEY") {
            self.tts.api_key = Some(key);
        }
        if let Some(voice) = get("SILICONFLOW_VOICE") {
            self.tts.voice = voice;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let stream = &self.stream;
        if stream.synthesis_workers == 0 {
            anyhow::bail!("stream.synthesis_workers must be at least 1");
        }
        if stream.translation_workers == 0 {
            anyhow::bail!("stream.translation_workers must be at least 1");
        }
        if stream.poll_interval_ms == 0 {
            anyhow::bail!("stream.poll_interval_ms must be greater than 0");
        }
        if stream.max_no_progress_polls == 0 {
            anyhow::bail!("stream.max_no_progress_polls must be greater than 0");
        }
        if stream.max_pending_chars == Some(0) {
            anyhow::bail!("stream.max_pending_chars must be greater than 0 when set");
        }
        if self.tts.sample_rate == 0 {
            anyhow::bail!("tts.sample_rate must be greater than 0");
        }
        Ok(())
    }
}
