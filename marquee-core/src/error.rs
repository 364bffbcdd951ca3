//! Error taxonomy shared by every engine component.
//!
//! End-of-stream is deliberately absent: a drained track is a state, not an
//! error, and is reported through `finished`/`at_end` flags.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    /// Unreadable source, unrecognized container or no matching stream.
    #[error("Open failed: {0}")]
    Open(String),
    /// A single packet failed to decode. Recovered locally by the tracks.
    #[error("Decode failed: {0}")]
    Decode(String),
    #[error("Stream {stream_id} corrupted: {failures} consecutive decode failures")]
    StreamCorrupted { stream_id: u32, failures: u32 },
    /// Thread, buffer or resampler setup failure.
    #[error("Resource error: {0}")]
    Resource(String),
}

impl MediaError {
    pub fn open(msg: impl Into<String>) -> Self {
        MediaError::Open(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        MediaError::Decode(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        MediaError::Resource(msg.into())
    }

    /// Fatal errors abort the current operation; decode errors do not.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, MediaError::Decode(_))
    }
}

pub type Result<T> = std::result::Result<T, MediaError>;
