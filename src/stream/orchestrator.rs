//! Drives one streamed response from model tokens to ordered audio.
//!
//! ```text
//! StreamingText ─▸ FlushingTail ─▸ AwaitingSynthesis ─▸ DrainingForce ─▸ Done
//! ```
//!
//! The orchestrator owns every piece of ordering state. Synthesis and
//! translation run on their own tasks and report back only through the
//! intake channel or a timeout-bounded join handle, so the loop below never
//! blocks on any single one of them and keeps releasing ready audio while
//! slower segments are still being synthesized.

use futures_util::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::dispatcher::{intake_channel, IntakeReceiver, SynthesisDispatcher};
use super::events::{ServerEvent, StreamOutput};
use super::reorder::ReassemblyQueue;
use super::segment::Segment;
use super::segmenter::Segmenter;
use super::side_channel::SideChannel;
use crate::config::StreamConfig;
use crate::providers::{Emotion, SpeechSynthesizer, TokenStream};

// ── State and summary ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    StreamingText,
    FlushingTail,
    AwaitingSynthesis,
    DrainingForce,
    Done,
}

impl StreamState {
    pub fn label(self) -> &'static str {
        match self {
            Self::StreamingText => "streaming_text",
            Self::FlushingTail => "flushing_tail",
            Self::AwaitingSynthesis => "awaiting_synthesis",
            Self::DrainingForce => "draining_force",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Counters reported when a run ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub segments: usize,
    pub failed: usize,
    /// Audio chunks handed to the transport.
    pub released: usize,
    /// Stale chunks dropped.
    pub discarded: usize,
    /// The drain loop gave up on outstanding synthesis.
    pub liveness_exit: bool,
    /// The consumer went away before the run finished.
    pub abandoned: bool,
}

/// The output receiver was dropped mid-run.
#[derive(Debug, thiserror::Error)]
#[error("stream output receiver was dropped")]
pub struct StreamAbandoned;

/// Whole-response side-channel work still outstanding.
struct SideTasks {
    emotion: Option<JoinHandle<Option<Emotion>>>,
    translation: Option<JoinHandle<Option<String>>>,
}

/// Activity observed by one drain.
#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    arrived: usize,
    settled: usize,
    released: usize,
}

impl Progress {
    fn any(self) -> bool {
        self.arrived + self.settled + self.released > 0
    }
}

// ── Orchestrator ──────────────────────────────────────────────────

/// Reusable across runs; each [`run`](Self::run) gets fresh state.
pub struct StreamOrchestrator {
    config: StreamConfig,
    voice: String,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    side: SideChannel,
}

impl StreamOrchestrator {
    pub fn new(
        config: StreamConfig,
        voice: impl Into<String>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        side: SideChannel,
    ) -> Self {
        Self {
            config,
            voice: voice.into(),
            synthesizer,
            side,
        }
    }

    /// Run a response to completion, sending output into `out`.
    ///
    /// Dropping the receiver abandons the run: in-flight synthesis and
    /// translation are cancelled and the summary comes back with
    /// `abandoned` set.
    pub async fn run(
        &self,
        tokens: TokenStream,
        out: mpsc::Sender<StreamOutput>,
    ) -> anyhow::Result<StreamSummary> {
        let stream_id = uuid::Uuid::new_v4().simple().to_string();
        let cancel = CancellationToken::new();
        let _cancel_on_exit = cancel.clone().drop_guard();

        let (intake_tx, intake_rx) = intake_channel();
        let dispatcher = SynthesisDispatcher::new(
            Arc::clone(&self.synthesizer),
            self.voice.clone(),
            self.config.synthesis_workers,
            intake_tx,
            cancel.child_token(),
        );

        let mut run = Run {
            stream_id: stream_id[..8].to_string(),
            config: &self.config,
            out,
            dispatcher,
            intake: intake_rx,
            queue: ReassemblyQueue::new(),
            segmenter: Segmenter::new(self.config.segmenter()),
            side: self.side.clone().with_cancellation(cancel.child_token()),
            state: StreamState::StreamingText,
            next_index: 0,
            accumulator: Vec::new(),
            full_response: String::new(),
            last_audio: None,
            liveness_exit: false,
        };

        tracing::info!(stream_id = %run.stream_id, voice = %self.voice, "Stream started");
        let outcome = run.drive(tokens).await;
        let abandoned = match outcome {
            Ok(()) => false,
            Err(e) if e.is::<StreamAbandoned>() => {
                tracing::warn!(stream_id = %run.stream_id, "Output dropped, abandoning stream");
                true
            }
            Err(e) => return Err(e),
        };

        let summary = run.summary(abandoned);
        tracing::info!(
            stream_id = %run.stream_id,
            segments = summary.segments,
            failed = summary.failed,
            released = summary.released,
            discarded = summary.discarded,
            liveness_exit = summary.liveness_exit,
            abandoned = summary.abandoned,
            "Stream finished"
        );
        Ok(summary)
    }

    /// Spawn [`run`](Self::run) and expose its output as a stream.
    pub fn spawn(
        self: Arc<Self>,
        tokens: TokenStream,
        capacity: usize,
    ) -> (
        ReceiverStream<StreamOutput>,
        JoinHandle<anyhow::Result<StreamSummary>>,
    ) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(async move { self.run(tokens, tx).await });
        (ReceiverStream::new(rx), handle)
    }
}

// ── Per-run state ─────────────────────────────────────────────────

struct Run<'a> {
    stream_id: String,
    config: &'a StreamConfig,
    out: mpsc::Sender<StreamOutput>,
    dispatcher: SynthesisDispatcher,
    intake: IntakeReceiver,
    queue: ReassemblyQueue,
    segmenter: Segmenter,
    side: SideChannel,
    state: StreamState,
    next_index: u64,
    /// Display text sent per segment.
    accumulator: Vec<String>,
    /// Raw model output.
    full_response: String,
    last_audio: Option<Instant>,
    liveness_exit: bool,
}

impl Run<'_> {
    async fn drive(&mut self, mut tokens: TokenStream) -> anyhow::Result<()> {
        self.stream_text(&mut tokens).await?;
        drop(tokens);

        self.transition(StreamState::FlushingTail);
        tracing::debug!(
            stream_id = %self.stream_id,
            chars = self.segmenter.pending().chars().count(),
            "Flushing tail"
        );
        if let Some(tail) = self.segmenter.finish() {
            self.emit_segment(tail).await?;
        }
        let full = self.full_response.clone();
        let mut side = SideTasks {
            emotion: self.side.has_classifier().then(|| self.side.classify(&full)),
            translation: None,
        };
        if self.side.needs_translation() {
            side.translation = Some(self.side.translate_full(&full));
        } else {
            self.send_response_text(None).await?;
        }

        self.transition(StreamState::AwaitingSynthesis);
        self.await_synthesis(&mut side).await?;

        // Side-channel work is timeout-bounded; keep audio flowing meanwhile.
        if let Some(handle) = side.translation.take() {
            let translated = self.await_while_pumping(handle).await?;
            self.send_response_text(translated).await?;
        }
        if let Some(handle) = side.emotion.take() {
            let emotion = self.await_while_pumping(handle).await?;
            self.send_emotion(emotion).await?;
        }

        self.transition(StreamState::DrainingForce);
        self.pump(true).await?;

        self.transition(StreamState::Done);
        let full = std::mem::take(&mut self.full_response);
        self.send(StreamOutput::FullResponse(full)).await
    }

    async fn stream_text(&mut self, tokens: &mut TokenStream) -> anyhow::Result<()> {
        let mut ticker = self.ticker();
        loop {
            tokio::select! {
                next = tokens.next() => match next {
                    Some(Ok(fragment)) => {
                        self.full_response.push_str(&fragment.delta);
                        for text in self.segmenter.push(&fragment.delta) {
                            self.emit_segment(text).await?;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(
                            stream_id = %self.stream_id,
                            error = %e,
                            "Token stream failed, ending response"
                        );
                        return Ok(());
                    }
                    None => return Ok(()),
                },
                _ = ticker.tick() => {
                    self.pump(false).await?;
                }
                _ = self.out.closed() => return Err(StreamAbandoned.into()),
            }
        }
    }

    /// Register, dispatch, and announce one finalized segment.
    async fn emit_segment(&mut self, text: String) -> anyhow::Result<()> {
        let segment = Segment::new(self.next_index, text);
        self.next_index += 1;
        self.queue.register(&segment)?;
        self.dispatcher.dispatch(&segment);

        let (display, original) = if self.side.needs_translation() {
            let handle = self.side.translate_segment(&segment.text);
            match self.await_while_pumping(handle).await? {
                Some(translated) => (translated, Some(segment.text)),
                None => (segment.text, None),
            }
        } else {
            (segment.text, None)
        };

        self.accumulator.push(display.clone());
        self.send(StreamOutput::Event(ServerEvent::segment_text(display, original)))
            .await
    }

    /// Drain until no segment owes a done marker, or until the liveness
    /// guard trips. Side-channel results that finish meanwhile are sent right
    /// away and taken out of `side`.
    async fn await_synthesis(&mut self, side: &mut SideTasks) -> anyhow::Result<()> {
        let mut idle_polls = 0u32;
        let mut ticker = self.ticker();

        while self.queue.has_pending() {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.out.closed() => return Err(StreamAbandoned.into()),
            }
            let progress = self.pump(false).await?;

            if let Some(handle) = side.translation.take_if(|h| h.is_finished()) {
                let translated = handle.await.ok().flatten();
                self.send_response_text(translated).await?;
            }
            if let Some(handle) = side.emotion.take_if(|h| h.is_finished()) {
                let emotion = handle.await.ok().flatten();
                self.send_emotion(emotion).await?;
            }

            if progress.any() {
                idle_polls = 0;
                continue;
            }
            idle_polls += 1;
            if idle_polls >= self.config.max_no_progress_polls {
                let outstanding: Vec<String> = self
                    .queue
                    .pending_ids()
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                tracing::warn!(
                    stream_id = %self.stream_id,
                    idle_polls,
                    outstanding = ?outstanding,
                    "No synthesis progress, giving up on outstanding segments"
                );
                self.liveness_exit = true;
                break;
            }
        }
        Ok(())
    }

    /// Wait for a side-channel result while still releasing audio.
    async fn await_while_pumping<T: Send + 'static>(
        &mut self,
        mut handle: JoinHandle<Option<T>>,
    ) -> anyhow::Result<Option<T>> {
        let mut ticker = self.ticker();
        loop {
            tokio::select! {
                result = &mut handle => return Ok(result.ok().flatten()),
                _ = ticker.tick() => {
                    self.pump(false).await?;
                }
                _ = self.out.closed() => {
                    handle.abort();
                    return Err(StreamAbandoned.into());
                }
            }
        }
    }

    /// Fold everything in the intake channel into the queue, then release
    /// and send whatever is ready.
    async fn pump(&mut self, force_all: bool) -> anyhow::Result<Progress> {
        let mut batch = Vec::new();
        while let Ok(message) = self.intake.try_recv() {
            batch.push(message);
        }

        let pending_before = self.queue.pending_len();
        let report = self.queue.intake(batch);
        let ready: Vec<_> = self.queue.release(force_all).collect();

        let progress = Progress {
            arrived: report.chunks,
            settled: pending_before.saturating_sub(self.queue.pending_len()),
            released: ready.len(),
        };
        if progress.any() {
            tracing::debug!(
                stream_id = %self.stream_id,
                arrived = progress.arrived,
                settled = progress.settled,
                released = progress.released,
                buffered = self.queue.buffered_len(),
                force_all,
                "Drained intake"
            );
        }

        for chunk in ready {
            self.pace().await;
            self.send(StreamOutput::Audio(chunk.block)).await?;
        }
        Ok(progress)
    }

    /// Keep consecutive audio blocks at least `min_audio_interval` apart.
    async fn pace(&mut self) {
        let interval = self.config.min_audio_interval();
        if let Some(last) = self.last_audio {
            let elapsed = last.elapsed();
            if elapsed < interval {
                tokio::time::sleep(interval - elapsed).await;
            }
        }
        self.last_audio = Some(Instant::now());
    }

    async fn send_response_text(&mut self, translated: Option<String>) -> anyhow::Result<()> {
        let event = match translated {
            Some(text) => ServerEvent::response_text(text, Some(self.full_response.clone())),
            None => ServerEvent::response_text(self.accumulator.concat(), None),
        };
        self.send(StreamOutput::Event(event)).await
    }

    async fn send_emotion(&mut self, emotion: Option<Emotion>) -> anyhow::Result<()> {
        match emotion {
            Some(emotion) => self.send(StreamOutput::Event(ServerEvent::emotion(emotion))).await,
            None => Ok(()),
        }
    }

    async fn send(&self, item: StreamOutput) -> anyhow::Result<()> {
        self.out.send(item).await.map_err(|_| StreamAbandoned)?;
        Ok(())
    }

    fn ticker(&self) -> tokio::time::Interval {
        let period = self.config.poll_interval().max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    fn transition(&mut self, next: StreamState) {
        tracing::info!(
            stream_id = %self.stream_id,
            from = %self.state,
            to = %next,
            segments = self.next_index,
            pending = self.queue.pending_len(),
            "Stream state"
        );
        self.state = next;
    }

    fn summary(&self, abandoned: bool) -> StreamSummary {
        StreamSummary {
            segments: self.next_index as usize,
            failed: self.queue.failed_count(),
            released: self.queue.released(),
            discarded: self.queue.discarded(),
            liveness_exit: self.liveness_exit,
            abandoned,
        }
    }
}
