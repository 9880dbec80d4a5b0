//! SmartNote pipeline: transcription → retrieval → generation.

pub mod prompt;
pub mod sanitize;
pub mod smartnote;
pub mod stream_guard;

pub use smartnote::{SmartNote, SmartNotePipeline, StreamEvent};
