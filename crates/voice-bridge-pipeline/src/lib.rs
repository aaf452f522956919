//! Audio path of the voice call bridge.
//!
//! Chunked mode composes the pieces in this crate end to end:
//! inbound 16 kHz frames are upsampled and streamed to the transcription
//! adapter; final transcripts drive the voice controller, which fans
//! sentence chunks out to parallel synthesis and reassembles the results
//! in order for the paced playout loop. Realtime mode swaps the middle of
//! that pipeline for a single bidirectional session but reuses the same
//! playout machinery.

pub mod chunker;
pub mod controller;
pub mod frames;
pub mod ordered_queue;
pub mod pacer;
pub mod realtime;
pub mod resample;
pub mod scheduler;
pub mod stt;
pub mod tts;

pub use chunker::{SentenceChunker, TextChunk};
pub use controller::{ChunkedVoiceController, ControllerConfig, ControllerState};
pub use frames::{FrameAssembler, FrameSink};
pub use ordered_queue::OrderedAudioQueue;
pub use pacer::{PlayoutPacer, FLUSH_RECOVERY_WINDOW};
pub use realtime::{RealtimeConfigView, RealtimeEvent, RealtimeVoiceAgent};
pub use resample::{downsample_24k_to_16k, upsample_16k_to_24k};
pub use scheduler::{SpeechSynthesizer, TtsScheduler, MAX_PENDING_SENTENCES};
pub use stt::{SttConfig, SttEvent, SttStream};
pub use tts::{TtsClient, TtsClientConfig};
