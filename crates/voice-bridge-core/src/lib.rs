//! Core types for the voice call bridge.
//!
//! Everything shared between the pipeline, agent and server crates lives
//! here: the error taxonomy, PCM frame helpers, call/session identifiers
//! and the trait seams the embedding host injects at construction.

pub mod audio;
pub mod call;
pub mod error;
pub mod traits;

pub use audio::{
    comfort_tone_24k, pcm_bytes_to_samples, samples_to_pcm_bytes, FRAME_BYTES_16K,
    FRAME_BYTES_24K, FRAME_DURATION_MS, FRAME_SAMPLES_16K, FRAME_SAMPLES_24K, SAMPLE_RATE_16K,
    SAMPLE_RATE_24K,
};
pub use call::{CallDirection, CallId, CallStatus, CallerInfo, EndReason};
pub use error::{BridgeError, Result};
pub use traits::{
    AgentDelta, AgentEngine, AgentRequest, MsgContext, NullSessionStore, NullToolExecutor,
    SessionRecord, SessionStore, ToolCallContext, ToolExecutor, ToolSpec, Turn, TurnRole,
};
