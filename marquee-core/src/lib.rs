//! # Marquee Core
//!
//! Media decode and A/V synchronization engine for emulator frontends:
//! opens a clip through a pluggable backend, decodes video on a worker
//! thread paced by a shared clock, and hands PCM to the host's audio sink
//! on demand.

// ============================================================================
// Foundation
// ============================================================================
pub mod error;
pub mod config;
pub mod source;

// ============================================================================
// Backends (containers, decoders, conversion)
// ============================================================================
pub mod backend;

// ============================================================================
// Pipeline
// ============================================================================
pub mod packet_queue;
pub mod demux;
pub mod clock;
pub mod surface;
pub mod frame_slot;
pub mod track;
pub mod audio;
pub mod video;

// ============================================================================
// Session
// ============================================================================
pub mod session;

#[cfg(feature = "audio-output")]
pub mod output;

pub use audio::{AudioSource, Produced};
pub use backend::{
    decoder_list, AudioParams, MatroskaBackend, MediaBackend, PixelFormat, Rational, StreamInfo,
    StreamKind, SymphoniaBackend, SyntheticBackend, SyntheticSpec, UniversalBackend, VideoParams,
};
pub use clock::PlaybackClock;
pub use config::{current_decoder, set_current_decoder, MediaConfig, OutputSpec, SOFTWARE_DECODER};
pub use error::{MediaError, Result};
pub use session::{MediaKind, MediaSession, SessionState};
pub use source::{FsResolver, MediaSource, SourceResolver, ZipResolver};
pub use surface::{DisplaySurface, MemorySurface, PixelBuffer};
pub use video::VideoStats;

#[cfg(feature = "audio-output")]
pub use output::CpalOutput;

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
