//! End-to-end scenarios through the public API with scripted collaborators.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use voicestream::config::StreamConfig;
use voicestream::providers::scripted::{ScriptedSynthesizer, ScriptedTokenSource, SynthesisScript};
use voicestream::providers::{ChatMessage, TokenSource};
use voicestream::stream::{ServerEvent, SideChannel};
use voicestream::{StreamOrchestrator, StreamOutput, StreamSummary};

fn stream_config(max_no_progress_polls: u32) -> StreamConfig {
    StreamConfig {
        min_segment_length: 1,
        poll_interval_ms: 5,
        max_no_progress_polls,
        min_audio_interval_ms: 0,
        ..StreamConfig::default()
    }
}

async fn run(
    synth: ScriptedSynthesizer,
    config: StreamConfig,
    fragments: &[&str],
) -> (Vec<StreamOutput>, StreamSummary) {
    let source = ScriptedTokenSource::new(fragments.iter().copied());
    let tokens = source.stream(&[ChatMessage::user("hi")]).await.unwrap();
    let orchestrator = Arc::new(StreamOrchestrator::new(
        config,
        "scenario-voice",
        Arc::new(synth),
        SideChannel::disabled(),
    ));
    let (outputs, handle) = orchestrator.spawn(tokens, 32);
    let outputs: Vec<StreamOutput> =
        tokio::time::timeout(Duration::from_secs(10), outputs.collect())
            .await
            .expect("stream should finish");
    (outputs, handle.await.unwrap().unwrap())
}

fn audio_tags(outputs: &[StreamOutput]) -> Vec<f32> {
    outputs
        .iter()
        .filter_map(StreamOutput::as_audio)
        .map(|b| b.samples[0])
        .collect()
}

#[tokio::test]
async fn second_segment_waits_for_first() {
    // Segment two finishes synthesis long before segment one.
    let synth = ScriptedSynthesizer::new(SynthesisScript::chunks(1))
        .with_script_for(
            "你好，",
            SynthesisScript::chunks(3)
                .with_value(1.0)
                .with_delay(Duration::from_millis(80)),
        )
        .with_script_for("世界。", SynthesisScript::chunks(2).with_value(2.0));

    let (outputs, summary) = run(synth, stream_config(200), &["你好", "，世界", "。"]).await;

    assert_eq!(audio_tags(&outputs), vec![1.0, 1.0, 1.0, 2.0, 2.0]);
    let segments: Vec<&ServerEvent> = outputs
        .iter()
        .filter_map(StreamOutput::as_event)
        .filter(|e| e.kind() == "llm_stream")
        .collect();
    assert_eq!(
        segments,
        vec![
            &ServerEvent::segment_text("你好，", None),
            &ServerEvent::segment_text("世界。", None),
        ]
    );
    assert_eq!(summary.segments, 2);
    assert_eq!(summary.failed, 0);
}

#[tokio::test]
async fn never_finishing_segment_does_not_hang_the_stream() {
    // The first segment never sends its done marker; the later one's audio
    // is only released by the final forced flush.
    let synth = ScriptedSynthesizer::new(SynthesisScript::chunks(1).with_value(2.0))
        .with_script_for("A,", SynthesisScript::hang());

    let (outputs, summary) = run(synth, stream_config(10), &["A,", "B."]).await;

    assert!(summary.liveness_exit);
    assert_eq!(audio_tags(&outputs), vec![2.0]);
    assert_eq!(
        outputs.last(),
        Some(&StreamOutput::FullResponse("A,B.".into()))
    );
}

#[tokio::test]
async fn many_segments_stay_ordered_when_completion_is_reversed() {
    let texts: Vec<String> = (0..8).map(|i| format!("s{i}.")).collect();
    // Later segments are faster, so completion order is reversed.
    let mut synth = ScriptedSynthesizer::new(SynthesisScript::chunks(1));
    for (i, text) in texts.iter().enumerate() {
        let delay = Duration::from_millis(10 * (8 - i as u64));
        synth = synth.with_script_for(
            text.clone(),
            SynthesisScript::chunks(2).with_value(i as f32).with_delay(delay),
        );
    }
    let fragments: Vec<&str> = texts.iter().map(String::as_str).collect();

    let (outputs, summary) = run(synth, stream_config(200), &fragments).await;

    let expected: Vec<f32> = (0..8).flat_map(|i| [i as f32, i as f32]).collect();
    assert_eq!(audio_tags(&outputs), expected);
    assert_eq!(summary.released, 16);
}
