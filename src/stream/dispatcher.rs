//! Parallel per-segment speech synthesis.
//!
//! Each dispatched segment gets its own task. Tasks wait for a permit from a
//! fixed-size pool, stream the synthesizer's blocks onto the shared intake
//! channel tagged with their segment id, and always finish with a done
//! marker. They never touch ordering state.

use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use super::segment::{Segment, SynthesisMessage};
use crate::providers::SpeechSynthesizer;

/// Sender half of the intake channel.
pub type IntakeSender = mpsc::UnboundedSender<SynthesisMessage>;
/// Receiver half of the intake channel.
pub type IntakeReceiver = mpsc::UnboundedReceiver<SynthesisMessage>;

/// Create the shared intake channel.
pub fn intake_channel() -> (IntakeSender, IntakeReceiver) {
    mpsc::unbounded_channel()
}

/// Launches one synthesis task per segment on a bounded worker pool.
pub struct SynthesisDispatcher {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    voice: Arc<str>,
    permits: Arc<Semaphore>,
    intake: IntakeSender,
    cancel: CancellationToken,
}

impl SynthesisDispatcher {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        voice: impl Into<Arc<str>>,
        workers: usize,
        intake: IntakeSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            synthesizer,
            voice: voice.into(),
            permits: Arc::new(Semaphore::new(workers.max(1))),
            intake,
            cancel,
        }
    }

    /// Schedule synthesis for `segment`.
    ///
    /// The caller must have registered the segment with the reassembly queue
    /// first. Results arrive only through the intake channel.
    pub fn dispatch(&self, segment: &Segment) {
        let synthesizer = Arc::clone(&self.synthesizer);
        let voice = Arc::clone(&self.voice);
        let permits = Arc::clone(&self.permits);
        let intake = self.intake.clone();
        let cancel = self.cancel.clone();
        let segment_id = segment.id;
        let text = segment.text.clone();

        tracing::info!(
            segment_id = %segment_id,
            order_index = segment.order_index,
            chars = text.chars().count(),
            "Dispatching synthesis"
        );

        tokio::spawn(async move {
            let _permit = tokio::select! {
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
                _ = cancel.cancelled() => return,
            };

            let started = Instant::now();
            let produce = async {
                let mut produced = 0usize;
                let mut blocks = match synthesizer.synthesize(&text, &voice).await {
                    Ok(blocks) => blocks,
                    Err(e) => {
                        tracing::warn!(
                            segment_id = %segment_id,
                            error = %e,
                            "Synthesis request failed"
                        );
                        return produced;
                    }
                };
                while let Some(block) = blocks.next().await {
                    match block {
                        Ok(block) => {
                            if intake.send(SynthesisMessage::chunk(segment_id, block)).is_err() {
                                // Receiver gone: the stream was abandoned.
                                return produced;
                            }
                            produced += 1;
                        }
                        Err(e) => {
                            tracing::warn!(
                                segment_id = %segment_id,
                                error = %e,
                                "Synthesis stream failed"
                            );
                            break;
                        }
                    }
                }
                produced
            };

            let produced = tokio::select! {
                produced = produce => produced,
                _ = cancel.cancelled() => {
                    tracing::debug!(segment_id = %segment_id, "Synthesis cancelled");
                    return;
                }
            };

            tracing::info!(
                segment_id = %segment_id,
                chunks = produced,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Synthesis finished"
            );
            let _ = intake.send(SynthesisMessage::done(segment_id));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::scripted::{ScriptedSynthesizer, SynthesisScript};
    use crate::stream::segment::SynthesisEvent;
    use std::time::Duration;

    async fn collect_until_done(
        rx: &mut IntakeReceiver,
        expected_done: usize,
    ) -> Vec<SynthesisMessage> {
        let mut out = Vec::new();
        let mut done = 0;
        while done < expected_done {
            let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("intake timed out")
                .expect("intake closed");
            if msg.event == SynthesisEvent::Done {
                done += 1;
            }
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn chunks_then_done_marker() {
        let synth = Arc::new(ScriptedSynthesizer::new(SynthesisScript::chunks(3)));
        let (tx, mut rx) = intake_channel();
        let dispatcher =
            SynthesisDispatcher::new(synth.clone(), "alice", 2, tx, CancellationToken::new());

        let segment = Segment::new(0, "hello there");
        dispatcher.dispatch(&segment);

        let messages = collect_until_done(&mut rx, 1).await;
        assert_eq!(messages.len(), 4);
        assert!(messages.iter().all(|m| m.segment_id == segment.id));
        assert_eq!(messages.last().map(|m| &m.event), Some(&SynthesisEvent::Done));
        assert_eq!(synth.calls(), vec![("hello there".to_string(), "alice".to_string())]);
    }

    #[tokio::test]
    async fn failing_synthesizer_still_sends_done() {
        let synth = Arc::new(ScriptedSynthesizer::new(SynthesisScript::fail()));
        let (tx, mut rx) = intake_channel();
        let dispatcher = SynthesisDispatcher::new(synth, "v", 1, tx, CancellationToken::new());

        let segment = Segment::new(0, "doomed");
        dispatcher.dispatch(&segment);

        let messages = collect_until_done(&mut rx, 1).await;
        assert_eq!(messages, vec![SynthesisMessage::done(segment.id)]);
    }

    #[tokio::test]
    async fn error_mid_stream_keeps_earlier_chunks() {
        let synth = Arc::new(ScriptedSynthesizer::new(SynthesisScript::chunks_then_error(2)));
        let (tx, mut rx) = intake_channel();
        let dispatcher = SynthesisDispatcher::new(synth, "v", 1, tx, CancellationToken::new());

        dispatcher.dispatch(&Segment::new(0, "partial"));
        let messages = collect_until_done(&mut rx, 1).await;
        assert_eq!(messages.len(), 3);
    }

    #[tokio::test]
    async fn pool_bounds_concurrency() {
        let synth = Arc::new(ScriptedSynthesizer::new(
            SynthesisScript::chunks(1).with_delay(Duration::from_millis(30)),
        ));
        let (tx, mut rx) = intake_channel();
        let dispatcher =
            SynthesisDispatcher::new(synth.clone(), "v", 2, tx, CancellationToken::new());

        for i in 0..6 {
            dispatcher.dispatch(&Segment::new(i, format!("segment {i}")));
        }
        collect_until_done(&mut rx, 6).await;
        assert_eq!(synth.max_concurrency(), 2);
        assert_eq!(synth.calls().len(), 6);
    }

    #[tokio::test]
    async fn cancellation_suppresses_done_marker() {
        let synth = Arc::new(ScriptedSynthesizer::new(SynthesisScript::hang()));
        let (tx, mut rx) = intake_channel();
        let cancel = CancellationToken::new();
        let dispatcher = SynthesisDispatcher::new(synth, "v", 1, tx, cancel.clone());

        dispatcher.dispatch(&Segment::new(0, "never"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        drop(dispatcher);

        let next = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("channel should close after cancellation");
        assert!(next.is_none());
    }
}
