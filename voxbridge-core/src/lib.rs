//! # voxbridge-core
//!
//! Real-time voice conversion engine: audio in, the same speech in a target
//! voice out, chunk by chunk.
//!
//! ## Architecture
//!
//! ```text
//! AudioSource worker → RingBuffer(in) → chunk loop (ConversionSession)
//!                                           │
//!                          VoiceModel: content → generate → vocode
//!                                           │
//!                                   Crossfader (overlap-add)
//!                                           │
//!                     RingBuffer(out) → AudioSink worker (file / RTP / device)
//! ```
//!
//! Every endpoint runs on its own thread; the session's chunk loop is the only
//! caller of the model.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod error;
pub mod inference;
pub mod session;
pub mod transport;

// Convenience re-exports for downstream crates
pub use buffering::{chunk::AudioChunk, RingBuffer};
pub use error::{Result, VoxError};
pub use inference::{stub::StubVoiceModel, GenerationParams, ModelHandle, VoiceModel};
pub use session::{ConversionSession, SessionConfig, SessionState, StatsSnapshot};
pub use transport::{
    open_sink, open_source, AudioSink, AudioSource, EndpointDescriptor, Framing, TransportConfig,
};
