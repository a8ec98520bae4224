//! Low-latency streaming of model replies as ordered synthesized speech.

pub mod config;
pub mod providers;
pub mod stream;

pub use config::Config;
pub use stream::{StreamOrchestrator, StreamOutput, StreamSummary};
