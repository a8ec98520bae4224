//! `voicestream`: stream one model reply as ordered speech.
//!
//! ```bash
//! # Reply to a prompt, printing side-channel events as JSON lines
//! voicestream --prompt "Tell me about the weather."
//!
//! # Keep the audio as a WAV file
//! voicestream --prompt "你好" --audio-out reply.wav
//!
//! # Exercise the pipeline without any network access
//! voicestream --dry-run --prompt "One, two. Three!"
//! ```

use anyhow::Context;
use clap::Parser;
use futures_util::{Stream, StreamExt};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing_subscriber::EnvFilter;

use voicestream::providers::{ChatMessage, Collaborators};
use voicestream::stream::{SideChannel, SideChannelLimits, WavRecorder};
use voicestream::{Config, StreamOrchestrator, StreamOutput};

/// Stream an LLM reply as ordered synthesized speech.
#[derive(Parser, Debug)]
#[command(name = "voicestream", version, about, long_about = None)]
struct Cli {
    /// Config file (default: ~/.voicestream/config.toml)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// User prompt; read from stdin when omitted
    #[arg(long, short)]
    prompt: Option<String>,

    /// System prompt, replacing the configured one
    #[arg(long)]
    system: Option<String>,

    /// Write released audio here as a mono WAV file
    #[arg(long)]
    audio_out: Option<PathBuf>,

    /// Voice identifier for synthesis
    #[arg(long)]
    voice: Option<String>,

    /// Language the reply is spoken in (e.g. "en")
    #[arg(long)]
    voice_language: Option<String>,

    /// Language the reply is displayed in (e.g. "zh")
    #[arg(long)]
    text_language: Option<String>,

    /// Shortest segment sent to synthesis, in characters
    #[arg(long)]
    min_segment_length: Option<usize>,

    /// Use in-process scripted providers instead of HTTP backends
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(system) = &self.system {
            config.llm.system_prompt = Some(system.clone());
        }
        if let Some(voice) = &self.voice {
            config.tts.voice = voice.clone();
        }
        if let Some(lang) = &self.voice_language {
            config.languages.voice_output = Some(lang.clone());
        }
        if let Some(lang) = &self.text_language {
            config.languages.text_output = lang.clone();
        }
        if let Some(min) = self.min_segment_length {
            config.stream.min_segment_length = min;
        }
    }
}

/// Forwards stream output: events as JSON lines, audio to the recorder.
struct Relay<W> {
    events: W,
    recorder: Option<WavRecorder>,
    samples: usize,
    audio_ms: u64,
}

impl<W: AsyncWrite + Unpin> Relay<W> {
    fn new(events: W, recorder: Option<WavRecorder>) -> Self {
        Self {
            events,
            recorder,
            samples: 0,
            audio_ms: 0,
        }
    }

    /// Forward until `outputs` ends or `interrupt` resolves. Returns whether
    /// the run was interrupted.
    async fn run<S, F>(&mut self, outputs: &mut S, interrupt: F) -> anyhow::Result<bool>
    where
        S: Stream<Item = StreamOutput> + Unpin,
        F: Future,
    {
        tokio::pin!(interrupt);
        loop {
            let item = tokio::select! {
                item = outputs.next() => item,
                _ = &mut interrupt => {
                    tracing::warn!("Interrupted, abandoning stream");
                    return Ok(true);
                }
            };
            let Some(item) = item else {
                return Ok(false);
            };
            self.forward(item).await?;
        }
    }

    async fn forward(&mut self, item: StreamOutput) -> anyhow::Result<()> {
        match item {
            StreamOutput::Audio(block) => {
                self.samples += block.len();
                self.audio_ms += block.duration_ms();
                if let Some(recorder) = self.recorder.as_mut() {
                    recorder.write_block(&block)?;
                }
            }
            StreamOutput::Event(event) => {
                let mut line = serde_json::to_string(&event)?;
                line.push('\n');
                self.events.write_all(line.as_bytes()).await?;
                self.events.flush().await?;
            }
            StreamOutput::FullResponse(text) => {
                tracing::info!(chars = text.chars().count(), "Full response received");
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("voicestream=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    let prompt = match &cli.prompt {
        Some(prompt) => prompt.clone(),
        None => {
            let mut input = String::new();
            tokio::io::stdin()
                .read_to_string(&mut input)
                .await
                .context("Failed to read prompt from stdin")?;
            input
        }
    };
    if prompt.trim().is_empty() {
        anyhow::bail!("Prompt is empty");
    }

    let collaborators = if cli.dry_run {
        Collaborators::dry_run(&prompt, &config)
    } else {
        Collaborators::from_config(&config)
    };
    tracing::info!(
        tokens = collaborators.tokens.name(),
        synthesizer = collaborators.synthesizer.name(),
        "Providers ready"
    );

    let mut side = SideChannel::new(
        config.languages.clone(),
        SideChannelLimits::from_config(
            &config.translation,
            &config.emotion,
            config.stream.translation_workers,
        ),
    );
    if let Some(translator) = collaborators.translator {
        side = side.with_translator(translator);
    }
    if let Some(classifier) = collaborators.classifier {
        side = side.with_classifier(classifier);
    }

    let tokens = collaborators
        .tokens
        .stream(&[ChatMessage::user(prompt)])
        .await
        .context("Failed to start model stream")?;

    let orchestrator = Arc::new(StreamOrchestrator::new(
        config.stream.clone(),
        config.tts.voice.clone(),
        collaborators.synthesizer,
        side,
    ));
    let recorder = cli
        .audio_out
        .as_ref()
        .map(|path| WavRecorder::create(path, config.tts.sample_rate))
        .transpose()?;
    let (mut outputs, handle) = orchestrator.spawn(tokens, 64);

    let mut relay = Relay::new(tokio::io::stdout(), recorder);
    relay.run(&mut outputs, tokio::signal::ctrl_c()).await?;
    drop(outputs);

    if let Some(recorder) = relay.recorder.take() {
        recorder.finalize()?;
    }

    let summary = handle.await.context("Stream task panicked")??;
    tracing::info!(
        segments = summary.segments,
        failed = summary.failed,
        released = summary.released,
        samples = relay.samples,
        audio_ms = relay.audio_ms,
        liveness_exit = summary.liveness_exit,
        abandoned = summary.abandoned,
        "Done"
    );
    Ok(())
}
