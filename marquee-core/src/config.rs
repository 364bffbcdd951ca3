//! Engine configuration and the process-wide decoder preference.
//!
//! The preference is global so frontends can expose a single "video decoder"
//! setting, but it is only read inside [`crate::MediaSession::open`]. Sessions
//! that are already open keep the decoder they were created with.

use std::path::Path;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{MediaError, Result};

/// Name of the decoder every backend must provide.
pub const SOFTWARE_DECODER: &str = "software";

static CURRENT_DECODER: Lazy<RwLock<String>> =
    Lazy::new(|| RwLock::new(SOFTWARE_DECODER.to_string()));

/// Preferred decoder for sessions opened from now on.
pub fn current_decoder() -> String {
    CURRENT_DECODER.read().clone()
}

pub fn set_current_decoder(name: &str) {
    let name = if name.trim().is_empty() { SOFTWARE_DECODER } else { name.trim() };
    *CURRENT_DECODER.write() = name.to_string();
    tracing::debug!("Preferred decoder set to {}", name);
}

/// Sample layout the audio sink expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Explicit decoder; `None` reads the process-wide preference at open.
    pub decoder: Option<String>,
    /// Upper bound on any single sleep in the video decode loop.
    pub max_sleep_ms: u64,
    /// Failures in a row (with no output) before a stream counts as corrupted.
    pub max_consecutive_decode_errors: u32,
    pub audio_output: OutputSpec,
    /// Frames fed to the resampler per processing call.
    pub audio_chunk_frames: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            decoder: None,
            max_sleep_ms: 50,
            max_consecutive_decode_errors: 32,
            audio_output: OutputSpec::default(),
            audio_chunk_frames: 1024,
        }
    }
}

impl MediaConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| MediaError::open(format!("Invalid config: {}", e)))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| MediaError::open(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn max_sleep(&self) -> Duration {
        Duration::from_millis(self.max_sleep_ms.max(1))
    }

    /// Decoder to request from the backend, snapshotting the global
    /// preference when none was configured explicitly.
    pub(crate) fn resolved_decoder(&self) -> String {
        self.decoder.clone().unwrap_or_else(current_decoder)
    }
}
