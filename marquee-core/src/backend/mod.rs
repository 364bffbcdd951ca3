//! # Backends
//!
//! The engine never parses containers or decodes bitstreams itself. Those jobs
//! belong to a [`MediaBackend`], which turns a byte stream into a
//! [`Container`]; the container enumerates streams, hands out packets and
//! builds the per-stream decoders.
//!
//! Shipped backends:
//! - [`MatroskaBackend`]: MKV/WebM with H.264 video (OpenH264), AAC or MP3 audio
//! - [`SymphoniaBackend`]: audio containers (WAV, FLAC, MP3, Ogg, MP4/M4A, MKV)
//! - [`SyntheticBackend`]: `.synth` descriptors rendering color bars + a tone
//! - [`UniversalBackend`]: dispatches to the above by file extension

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MediaError, Result};
use crate::source::MediaSource;

pub mod convert;
pub mod matroska;
pub mod resample;
pub mod symphonia_decode;
pub mod synthetic;

pub use convert::SoftwareConverter;
pub use matroska::{H264Decoder, MatroskaBackend};
pub use resample::RubatoResampler;
pub use symphonia_decode::SymphoniaBackend;
pub use synthetic::{SyntheticBackend, SyntheticSpec};

// ============================================================================
// Stream Description
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    Audio,
    Video,
    Other,
}

/// `num / den` seconds per tick, or a plain ratio for aspect/frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub num: u32,
    pub den: u32,
}

impl Rational {
    pub const ONE: Rational = Rational { num: 1, den: 1 };

    pub fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    /// Convert a tick count in this time base to wall time. Negative ticks clamp to zero.
    pub fn ticks_to_duration(&self, ticks: i64) -> Duration {
        if ticks <= 0 || self.den == 0 {
            return Duration::ZERO;
        }
        let nanos = ticks as u128 * self.num as u128 * 1_000_000_000 / self.den as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }
}

/// Pixel layout of decoded (pre-conversion) video frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 4:2:0 planar, Y then U then V
    I420,
    /// 4:2:0 semi-planar, Y then interleaved UV
    Nv12,
    /// Packed 8-bit RGBA
    Rgba,
}

impl PixelFormat {
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        let w = width as usize;
        let h = height as usize;
        let chroma = ((w + 1) / 2) * ((h + 1) / 2);
        match self {
            Self::I420 | Self::Nv12 => w * h + chroma * 2,
            Self::Rgba => w * h * 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub sample_aspect: Rational,
    pub frame_rate: Rational,
    pub pixel_format: PixelFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    pub id: u32,
    pub kind: StreamKind,
    pub codec: String,
    pub time_base: Rational,
    /// Stream duration in `time_base` ticks
    pub duration: Option<i64>,
    pub frame_count: Option<u64>,
    pub video: Option<VideoParams>,
    pub audio: Option<AudioParams>,
}

impl StreamInfo {
    pub fn duration(&self) -> Option<Duration> {
        self.duration.map(|ticks| self.time_base.ticks_to_duration(ticks))
    }
}

// ============================================================================
// Packets and Frames
// ============================================================================

/// One compressed unit of a single elementary stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub stream_id: u32,
    /// Presentation timestamp in stream time-base ticks
    pub pts: Option<i64>,
    pub duration: i64,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

/// Opaque handle to a frame living in decoder (device) memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSurface {
    pub handle: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameMemory {
    /// Tightly packed planes in `RawVideoFrame::format` layout
    Host(Vec<u8>),
    /// Needs [`VideoDecoder::transfer`] before it can be converted
    Device(DeviceSurface),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawVideoFrame {
    pub pts: Option<i64>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub memory: FrameMemory,
}

impl RawVideoFrame {
    pub fn is_device_resident(&self) -> bool {
        matches!(self.memory, FrameMemory::Device(_))
    }

    pub fn host_data(&self) -> Option<&[u8]> {
        match &self.memory {
            FrameMemory::Host(data) => Some(data),
            FrameMemory::Device(_) => None,
        }
    }
}

/// Decoded PCM, interleaved, nominal range -1.0..=1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioChunk {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }
}

pub fn sample_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

// ============================================================================
// Primitive Traits
// ============================================================================

/// An opened, demuxable container.
pub trait Container: Send {
    fn streams(&self) -> &[StreamInfo];

    /// Next packet in file order. `Ok(None)` at end of container.
    fn read_packet(&mut self) -> Result<Option<Packet>>;

    /// Coarse reposition; the next packet may start before `position`.
    fn seek(&mut self, position: Duration) -> Result<()>;

    fn duration(&self) -> Option<Duration>;

    /// Container-level tag lookup. Keys compare case-insensitively.
    fn metadata(&self, tag: &str) -> Option<String>;

    fn audio_decoder(&self, stream_id: u32) -> Result<Box<dyn AudioDecoder>>;

    /// Build a video decoder, honouring `preferred` when the backend supports it
    /// and falling back to software otherwise.
    fn video_decoder(&self, stream_id: u32, preferred: &str) -> Result<Box<dyn VideoDecoder>>;
}

pub trait VideoDecoder: Send {
    fn name(&self) -> &str;

    /// Decode one packet. A packet may yield zero or more frames.
    fn decode(&mut self, packet: &Packet) -> Result<Vec<RawVideoFrame>>;

    /// Drain frames held back by the decoder at end of stream.
    fn flush(&mut self) -> Result<Vec<RawVideoFrame>>;

    /// Copy a device-resident frame into host memory.
    fn transfer(&mut self, frame: RawVideoFrame) -> Result<RawVideoFrame> {
        if frame.is_device_resident() {
            Err(MediaError::resource(format!(
                "{} produced a device frame but cannot transfer it",
                self.name()
            )))
        } else {
            Ok(frame)
        }
    }

    fn reset(&mut self);
}

pub trait AudioDecoder: Send {
    fn decode(&mut self, packet: &Packet) -> Result<AudioChunk>;

    fn reset(&mut self);
}

/// Converts decoded frames into the RGBA display buffer.
pub trait ColorConverter: Send {
    fn convert(&mut self, frame: &RawVideoFrame, dst: &mut crate::surface::PixelBuffer) -> Result<()>;
}

/// Converts decoder PCM into the output device's layout.
pub trait Resampler: Send {
    fn process(&mut self, chunk: &AudioChunk, out: &mut Vec<i16>) -> Result<()>;

    /// Emit whatever the resampler still holds (end of stream).
    fn flush(&mut self, out: &mut Vec<i16>) -> Result<()>;

    fn reset(&mut self);
}

pub trait MediaBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Lower-case file extensions this backend recognizes.
    fn extensions(&self) -> &[&'static str];

    /// Decoder names accepted as a preference. Always includes `"software"`.
    fn decoders(&self) -> Vec<String>;

    fn open(&self, source: MediaSource) -> Result<Box<dyn Container>>;

    fn is_supported(&self, file_name: &str) -> bool {
        match extension_of(file_name) {
            Some(ext) => self.extensions().iter().any(|e| *e == ext),
            None => false,
        }
    }
}

pub(crate) fn extension_of(file_name: &str) -> Option<String> {
    std::path::Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

// ============================================================================
// Universal Backend
// ============================================================================

/// Picks a backend by extension, then falls back to trying each in order.
/// When several backends claim an extension they are tried in list order.
pub struct UniversalBackend {
    backends: Vec<Arc<dyn MediaBackend>>,
}

impl UniversalBackend {
    pub fn new(backends: Vec<Arc<dyn MediaBackend>>) -> Self {
        Self { backends }
    }
}

impl Default for UniversalBackend {
    fn default() -> Self {
        Self::new(vec![
            Arc::new(SyntheticBackend::new()),
            Arc::new(MatroskaBackend::new()),
            Arc::new(SymphoniaBackend::new()),
        ])
    }
}

impl MediaBackend for UniversalBackend {
    fn name(&self) -> &str {
        "universal"
    }

    fn extensions(&self) -> &[&'static str] {
        // Per-backend lists are consulted by `is_supported`.
        &[]
    }

    fn decoders(&self) -> Vec<String> {
        let mut list: Vec<String> = Vec::new();
        for backend in &self.backends {
            for name in backend.decoders() {
                if !list.contains(&name) {
                    list.push(name);
                }
            }
        }
        list
    }

    fn is_supported(&self, file_name: &str) -> bool {
        self.backends.iter().any(|b| b.is_supported(file_name))
    }

    fn open(&self, source: MediaSource) -> Result<Box<dyn Container>> {
        let claimed: Vec<&Arc<dyn MediaBackend>> = self
            .backends
            .iter()
            .filter(|b| b.is_supported(&source.name))
            .collect();
        if let [only] = claimed.as_slice() {
            return only.open(source);
        }
        let candidates = if claimed.is_empty() {
            // Unknown extension: probe every backend
            self.backends.iter().collect()
        } else {
            claimed
        };

        // Each attempt gets its own in-memory copy
        let name = source.name.clone();
        let bytes = source.into_bytes()?;
        let mut tried = Vec::new();
        for backend in candidates {
            match backend.open(MediaSource::from_bytes(name.clone(), bytes.clone())) {
                Ok(container) => return Ok(container),
                Err(e) => tried.push(format!("{}: {}", backend.name(), e)),
            }
        }
        Err(MediaError::open(format!(
            "No backend recognized {} (tried: {})",
            name,
            tried.join("; ")
        )))
    }
}

/// Names of every decoder a backend offers.
pub fn decoder_list(backend: &dyn MediaBackend) -> Vec<String> {
    backend.decoders()
}
