//! Streaming reassembly core.
//!
//! Model text comes in as fragments and leaves as strictly ordered audio
//! plus side-channel text events:
//!
//! ```text
//! tokens ─▸ Segmenter ─▸ SynthesisDispatcher ─▸ intake ─▸ ReassemblyQueue ─▸ audio
//!                    └─▸ SideChannel (translation, emotion) ─────────────────▸ events
//! ```
//!
//! [`StreamOrchestrator`] ties the pieces together and is the only owner of
//! ordering state.

pub mod dispatcher;
pub mod events;
pub mod orchestrator;
pub mod reorder;
pub mod segment;
pub mod segmenter;
pub mod side_channel;
pub mod wav;

pub use dispatcher::{intake_channel, IntakeReceiver, IntakeSender, SynthesisDispatcher};
pub use events::{ServerEvent, StreamOutput, FULL_RESPONSE_ID};
pub use orchestrator::{StreamAbandoned, StreamOrchestrator, StreamState, StreamSummary};
pub use reorder::{IntakeReport, ReassemblyError, ReassemblyQueue, Release};
pub use segment::{
    AudioBlock, AudioChunk, Segment, SegmentId, SegmentStatus, SynthesisEvent, SynthesisMessage,
};
pub use segmenter::{is_break_mark, segment, Segmentation, Segmenter, SegmenterConfig, BREAK_MARKS};
pub use side_channel::{SideChannel, SideChannelLimits};
pub use wav::WavRecorder;
