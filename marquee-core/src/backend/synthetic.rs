// Synthetic media: `.synth` JSON descriptors rendered as moving color bars and
// a sine tone.
//
// Useful for frontends without real media and for exercising the engine's
// timing. The descriptor can also inject decode faults and slow frames.
//
// Example descriptor:
//
//     { "duration_ms": 5000, "fps": 25, "width": 320, "height": 240,
//       "sample_rate": 48000, "channels": 2, "tags": { "title": "Bars" } }

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{
    AudioChunk, AudioDecoder, AudioParams, Container, DeviceSurface, FrameMemory, MediaBackend,
    Packet, PixelFormat, Rational, RawVideoFrame, StreamInfo, StreamKind, VideoDecoder, VideoParams,
};
use crate::config::SOFTWARE_DECODER;
use crate::error::{MediaError, Result};
use crate::source::MediaSource;

/// Decoder that hands out device frames and needs a transfer step.
pub const EMULATED_HW_DECODER: &str = "emulated-hw";

pub const VIDEO_STREAM_ID: u32 = 0;
pub const AUDIO_STREAM_ID: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticSpec {
    pub duration_ms: u64,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Pixel aspect as `[num, den]`
    pub sample_aspect: [u32; 2],
    pub sample_rate: u32,
    pub channels: u16,
    /// 0 renders silence
    pub tone_hz: f32,
    pub audio: bool,
    pub video: bool,
    /// Audio packet length
    pub packet_ms: u64,
    pub tags: BTreeMap<String, String>,
    /// Video packets from this frame index on are malformed
    pub corrupt_video_from: Option<u64>,
    /// Audio packets from this packet index on are malformed
    pub corrupt_audio_from: Option<u64>,
    /// Frames in `[start, end)` take `slow_frame_ms` to decode
    pub slow_frames: Option<(u64, u64)>,
    pub slow_frame_ms: u64,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            duration_ms: 2_000,
            fps: 30,
            width: 64,
            height: 48,
            sample_aspect: [1, 1],
            sample_rate: 44_100,
            channels: 1,
            tone_hz: 440.0,
            audio: true,
            video: true,
            packet_ms: 20,
            tags: BTreeMap::new(),
            corrupt_video_from: None,
            corrupt_audio_from: None,
            slow_frames: None,
            slow_frame_ms: 0,
        }
    }
}

impl SyntheticSpec {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let spec: Self = serde_json::from_slice(bytes)
            .map_err(|e| MediaError::open(format!("Invalid synthetic descriptor: {}", e)))?;
        spec.validate()?;
        Ok(spec)
    }

    /// In-memory `.synth` source for this descriptor.
    pub fn to_source(&self, name: &str) -> Result<MediaSource> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| MediaError::resource(format!("Failed to encode descriptor: {}", e)))?;
        Ok(MediaSource::from_bytes(name, bytes))
    }

    fn validate(&self) -> Result<()> {
        if !self.audio && !self.video {
            return Err(MediaError::open("Synthetic descriptor has no streams"));
        }
        if self.video && (self.fps == 0 || self.width == 0 || self.height == 0) {
            return Err(MediaError::open("Synthetic video needs fps, width and height"));
        }
        if self.audio && (self.sample_rate == 0 || self.channels == 0) {
            return Err(MediaError::open("Synthetic audio needs sample_rate and channels"));
        }
        Ok(())
    }

    fn total_frames(&self) -> u64 {
        self.duration_ms * self.fps as u64 / 1000
    }

    fn total_samples(&self) -> u64 {
        self.duration_ms * self.sample_rate as u64 / 1000
    }

    fn samples_per_packet(&self) -> u64 {
        (self.sample_rate as u64 * self.packet_ms / 1000).max(1)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticBackend;

impl SyntheticBackend {
    pub fn new() -> Self {
        Self
    }
}

impl MediaBackend for SyntheticBackend {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn extensions(&self) -> &[&'static str] {
        &["synth"]
    }

    fn decoders(&self) -> Vec<String> {
        vec![SOFTWARE_DECODER.to_string(), EMULATED_HW_DECODER.to_string()]
    }

    fn open(&self, source: MediaSource) -> Result<Box<dyn Container>> {
        let name = source.name.clone();
        let spec = SyntheticSpec::from_json(&source.into_bytes()?)?;
        tracing::info!(
            "Opened synthetic {}: {} ms, video {}x{}@{} ({}), audio {} Hz x{} ({})",
            name,
            spec.duration_ms,
            spec.width,
            spec.height,
            spec.fps,
            spec.video,
            spec.sample_rate,
            spec.channels,
            spec.audio
        );
        Ok(Box::new(SyntheticContainer::new(spec)))
    }
}

// ============================================================================
// Container
// ============================================================================

struct SyntheticContainer {
    spec: SyntheticSpec,
    streams: Vec<StreamInfo>,
    next_frame: u64,
    next_sample: u64,
}

impl SyntheticContainer {
    fn new(spec: SyntheticSpec) -> Self {
        let mut streams = Vec::new();
        if spec.video {
            streams.push(StreamInfo {
                id: VIDEO_STREAM_ID,
                kind: StreamKind::Video,
                codec: "bars".into(),
                time_base: Rational::new(1, spec.fps),
                duration: Some(spec.total_frames() as i64),
                frame_count: Some(spec.total_frames()),
                video: Some(VideoParams {
                    width: spec.width,
                    height: spec.height,
                    sample_aspect: Rational::new(spec.sample_aspect[0], spec.sample_aspect[1]),
                    frame_rate: Rational::new(spec.fps, 1),
                    pixel_format: PixelFormat::I420,
                }),
                audio: None,
            });
        }
        if spec.audio {
            streams.push(StreamInfo {
                id: AUDIO_STREAM_ID,
                kind: StreamKind::Audio,
                codec: "tone".into(),
                time_base: Rational::new(1, spec.sample_rate),
                duration: Some(spec.total_samples() as i64),
                frame_count: None,
                video: None,
                audio: Some(AudioParams {
                    sample_rate: spec.sample_rate,
                    channels: spec.channels,
                }),
            });
        }
        Self {
            spec,
            streams,
            next_frame: 0,
            next_sample: 0,
        }
    }

    fn video_packet(&mut self) -> Packet {
        let index = self.next_frame;
        self.next_frame += 1;
        let corrupt = self.spec.corrupt_video_from.map_or(false, |from| index >= from);
        Packet {
            stream_id: VIDEO_STREAM_ID,
            pts: Some(index as i64),
            duration: 1,
            keyframe: true,
            data: if corrupt { vec![0xFF] } else { index.to_le_bytes().to_vec() },
        }
    }

    fn audio_packet(&mut self) -> Packet {
        let start = self.next_sample;
        let count = self
            .spec
            .samples_per_packet()
            .min(self.spec.total_samples() - start);
        self.next_sample += count;

        let index = start / self.spec.samples_per_packet();
        let corrupt = self.spec.corrupt_audio_from.map_or(false, |from| index >= from);
        let data = if corrupt {
            vec![0xFF]
        } else {
            let mut data = start.to_le_bytes().to_vec();
            data.extend_from_slice(&(count as u32).to_le_bytes());
            data
        };
        Packet {
            stream_id: AUDIO_STREAM_ID,
            pts: Some(start as i64),
            duration: count as i64,
            keyframe: true,
            data,
        }
    }
}

impl Container for SyntheticContainer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        let video_left = self.spec.video && self.next_frame < self.spec.total_frames();
        let audio_left = self.spec.audio && self.next_sample < self.spec.total_samples();

        // Interleave by presentation time, video first on ties
        let packet = match (video_left, audio_left) {
            (false, false) => return Ok(None),
            (true, false) => self.video_packet(),
            (false, true) => self.audio_packet(),
            (true, true) => {
                let video_at = self.next_frame as u128 * self.spec.sample_rate as u128;
                let audio_at = self.next_sample as u128 * self.spec.fps as u128;
                if video_at <= audio_at {
                    self.video_packet()
                } else {
                    self.audio_packet()
                }
            }
        };
        Ok(Some(packet))
    }

    fn seek(&mut self, position: Duration) -> Result<()> {
        let ms = (position.as_millis() as u64).min(self.spec.duration_ms);
        self.next_frame = ms * self.spec.fps as u64 / 1000;
        let per_packet = self.spec.samples_per_packet();
        self.next_sample = (ms * self.spec.sample_rate as u64 / 1000) / per_packet * per_packet;
        Ok(())
    }

    fn duration(&self) -> Option<Duration> {
        Some(Duration::from_millis(self.spec.duration_ms))
    }

    fn metadata(&self, tag: &str) -> Option<String> {
        self.spec
            .tags
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(tag))
            .map(|(_, v)| v.clone())
    }

    fn audio_decoder(&self, stream_id: u32) -> Result<Box<dyn AudioDecoder>> {
        if stream_id != AUDIO_STREAM_ID || !self.spec.audio {
            return Err(MediaError::open(format!("No synthetic audio stream {}", stream_id)));
        }
        Ok(Box::new(ToneDecoder {
            sample_rate: self.spec.sample_rate,
            channels: self.spec.channels,
            tone_hz: self.spec.tone_hz,
        }))
    }

    fn video_decoder(&self, stream_id: u32, preferred: &str) -> Result<Box<dyn VideoDecoder>> {
        if stream_id != VIDEO_STREAM_ID || !self.spec.video {
            return Err(MediaError::open(format!("No synthetic video stream {}", stream_id)));
        }
        let bars = BarRenderer {
            width: self.spec.width,
            height: self.spec.height,
            slow_frames: self.spec.slow_frames,
            slow_frame: Duration::from_millis(self.spec.slow_frame_ms),
        };
        match preferred {
            EMULATED_HW_DECODER => Ok(Box::new(EmulatedHwDecoder { bars, held: None })),
            SOFTWARE_DECODER => Ok(Box::new(BarDecoder { bars })),
            other => {
                tracing::warn!("Decoder {} not available for synthetic video, using software", other);
                Ok(Box::new(BarDecoder { bars }))
            }
        }
    }
}

// ============================================================================
// Decoders
// ============================================================================

/// SMPTE-ish bars in BT.601 studio-range YUV
const BARS: [(u8, u8, u8); 8] = [
    (235, 128, 128),
    (210, 16, 146),
    (170, 166, 16),
    (145, 54, 34),
    (106, 202, 222),
    (81, 90, 240),
    (41, 240, 110),
    (16, 128, 128),
];

struct BarRenderer {
    width: u32,
    height: u32,
    slow_frames: Option<(u64, u64)>,
    slow_frame: Duration,
}

impl BarRenderer {
    fn frame_index(packet: &Packet) -> Result<u64> {
        let bytes: [u8; 8] = packet
            .data
            .as_slice()
            .try_into()
            .map_err(|_| MediaError::decode(format!("Malformed video packet at {:?}", packet.pts)))?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn simulate_cost(&self, index: u64) {
        if let Some((start, end)) = self.slow_frames {
            if (start..end).contains(&index) {
                thread::sleep(self.slow_frame);
            }
        }
    }

    /// I420 bars scrolled one column per frame.
    fn render(&self, index: u64) -> RawVideoFrame {
        let (w, h) = (self.width as usize, self.height as usize);
        let (cw, ch) = ((w + 1) / 2, (h + 1) / 2);
        let mut data = vec![0u8; PixelFormat::I420.buffer_size(self.width, self.height)];
        let bar_of = |x: usize| BARS[((x + index as usize) % w) * BARS.len() / w];

        let (luma, chroma) = data.split_at_mut(w * h);
        for row in luma.chunks_exact_mut(w) {
            for (x, px) in row.iter_mut().enumerate() {
                *px = bar_of(x).0;
            }
        }
        let (u_plane, v_plane) = chroma.split_at_mut(cw * ch);
        for cy in 0..ch {
            for cx in 0..cw {
                let (_, u, v) = bar_of((cx * 2).min(w - 1));
                u_plane[cy * cw + cx] = u;
                v_plane[cy * cw + cx] = v;
            }
        }

        RawVideoFrame {
            pts: Some(index as i64),
            width: self.width,
            height: self.height,
            format: PixelFormat::I420,
            memory: FrameMemory::Host(data),
        }
    }
}

struct BarDecoder {
    bars: BarRenderer,
}

impl VideoDecoder for BarDecoder {
    fn name(&self) -> &str {
        SOFTWARE_DECODER
    }

    fn decode(&mut self, packet: &Packet) -> Result<Vec<RawVideoFrame>> {
        let index = BarRenderer::frame_index(packet)?;
        self.bars.simulate_cost(index);
        Ok(vec![self.bars.render(index)])
    }

    fn flush(&mut self) -> Result<Vec<RawVideoFrame>> {
        Ok(Vec::new())
    }

    fn reset(&mut self) {}
}

/// Emits device frames one packet late, like a decoder with a reorder
/// window; the last frame only comes out of `flush`.
struct EmulatedHwDecoder {
    bars: BarRenderer,
    held: Option<RawVideoFrame>,
}

impl EmulatedHwDecoder {
    fn device_frame(&self, index: u64) -> RawVideoFrame {
        RawVideoFrame {
            pts: Some(index as i64),
            width: self.bars.width,
            height: self.bars.height,
            format: PixelFormat::I420,
            memory: FrameMemory::Device(DeviceSurface { handle: index }),
        }
    }
}

impl VideoDecoder for EmulatedHwDecoder {
    fn name(&self) -> &str {
        EMULATED_HW_DECODER
    }

    fn decode(&mut self, packet: &Packet) -> Result<Vec<RawVideoFrame>> {
        let index = BarRenderer::frame_index(packet)?;
        self.bars.simulate_cost(index);
        let frame = self.device_frame(index);
        Ok(self.held.replace(frame).into_iter().collect())
    }

    fn flush(&mut self) -> Result<Vec<RawVideoFrame>> {
        Ok(self.held.take().into_iter().collect())
    }

    fn transfer(&mut self, frame: RawVideoFrame) -> Result<RawVideoFrame> {
        match frame.memory {
            FrameMemory::Device(surface) => Ok(self.bars.render(surface.handle)),
            FrameMemory::Host(_) => Ok(frame),
        }
    }

    fn reset(&mut self) {
        self.held = None;
    }
}

struct ToneDecoder {
    sample_rate: u32,
    channels: u16,
    tone_hz: f32,
}

impl AudioDecoder for ToneDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<AudioChunk> {
        if packet.data.len() != 12 {
            return Err(MediaError::decode(format!("Malformed audio packet at {:?}", packet.pts)));
        }
        let mut start = [0u8; 8];
        start.copy_from_slice(&packet.data[..8]);
        let mut count = [0u8; 4];
        count.copy_from_slice(&packet.data[8..]);
        let start = u64::from_le_bytes(start);
        let count = u32::from_le_bytes(count) as u64;

        let step = std::f64::consts::TAU * self.tone_hz as f64 / self.sample_rate as f64;
        let mut samples = Vec::with_capacity(count as usize * self.channels as usize);
        for n in start..start + count {
            let v = ((n as f64 * step).sin() * 0.25) as f32;
            for _ in 0..self.channels {
                samples.push(v);
            }
        }
        Ok(AudioChunk {
            sample_rate: self.sample_rate,
            channels: self.channels,
            samples,
        })
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(spec: &SyntheticSpec) -> Box<dyn Container> {
        SyntheticBackend::new().open(spec.to_source("test.synth").unwrap()).unwrap()
    }

    #[test]
    fn test_packet_counts_and_interleave() {
        let spec = SyntheticSpec {
            duration_ms: 1_000,
            fps: 10,
            sample_rate: 1_000,
            packet_ms: 100,
            ..Default::default()
        };
        let mut container = open(&spec);
        assert_eq!(container.streams().len(), 2);
        assert_eq!(container.duration(), Some(Duration::from_secs(1)));

        let mut order = Vec::new();
        while let Some(p) = container.read_packet().unwrap() {
            order.push(p.stream_id);
        }
        assert_eq!(order.iter().filter(|id| **id == VIDEO_STREAM_ID).count(), 10);
        assert_eq!(order.iter().filter(|id| **id == AUDIO_STREAM_ID).count(), 10);
        // Equal cadence: strictly alternating, video first
        assert_eq!(&order[..4], &[0, 1, 0, 1]);
    }

    #[test]
    fn test_seek_positions_both_streams() {
        let spec = SyntheticSpec {
            duration_ms: 1_000,
            fps: 10,
            sample_rate: 1_000,
            packet_ms: 100,
            ..Default::default()
        };
        let mut container = open(&spec);
        container.seek(Duration::from_millis(500)).unwrap();
        let first = container.read_packet().unwrap().unwrap();
        assert_eq!((first.stream_id, first.pts), (VIDEO_STREAM_ID, Some(5)));
        let second = container.read_packet().unwrap().unwrap();
        assert_eq!((second.stream_id, second.pts), (AUDIO_STREAM_ID, Some(500)));
    }

    #[test]
    fn test_software_bars() {
        let spec = SyntheticSpec { width: 16, height: 8, ..Default::default() };
        let mut container = open(&spec);
        let mut decoder = container.video_decoder(VIDEO_STREAM_ID, SOFTWARE_DECODER).unwrap();
        let packet = container.read_packet().unwrap().unwrap();
        let frames = decoder.decode(&packet).unwrap();
        assert_eq!(frames.len(), 1);
        let data = frames[0].host_data().unwrap();
        assert_eq!(data.len(), PixelFormat::I420.buffer_size(16, 8));
        // Frame 0: first column white, last column black
        assert_eq!(data[0], 235);
        assert_eq!(data[15], 16);
    }

    #[test]
    fn test_emulated_hw_holds_one_frame() {
        let spec = SyntheticSpec { audio: false, ..Default::default() };
        let mut container = open(&spec);
        let mut decoder = container.video_decoder(VIDEO_STREAM_ID, EMULATED_HW_DECODER).unwrap();
        assert_eq!(decoder.name(), EMULATED_HW_DECODER);

        let first = container.read_packet().unwrap().unwrap();
        assert!(decoder.decode(&first).unwrap().is_empty());
        let second = container.read_packet().unwrap().unwrap();
        let out = decoder.decode(&second).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].is_device_resident());

        let host = decoder.transfer(out[0].clone()).unwrap();
        assert_eq!(host.pts, Some(0));
        assert!(host.host_data().is_some());

        let tail = decoder.flush().unwrap();
        assert_eq!(tail[0].pts, Some(1));
    }

    #[test]
    fn test_unknown_decoder_falls_back() {
        let container = open(&SyntheticSpec::default());
        let decoder = container.video_decoder(VIDEO_STREAM_ID, "vdpau").unwrap();
        assert_eq!(decoder.name(), SOFTWARE_DECODER);
    }

    #[test]
    fn test_corrupt_packets_fail_decode() {
        let spec = SyntheticSpec {
            corrupt_video_from: Some(0),
            corrupt_audio_from: Some(0),
            ..Default::default()
        };
        let mut container = open(&spec);
        let mut video = container.video_decoder(VIDEO_STREAM_ID, SOFTWARE_DECODER).unwrap();
        let mut audio = container.audio_decoder(AUDIO_STREAM_ID).unwrap();

        let v = container.read_packet().unwrap().unwrap();
        assert!(matches!(video.decode(&v), Err(MediaError::Decode(_))));
        let a = container.read_packet().unwrap().unwrap();
        assert!(matches!(audio.decode(&a), Err(MediaError::Decode(_))));
    }

    #[test]
    fn test_tone_samples() {
        let spec = SyntheticSpec { video: false, channels: 2, ..Default::default() };
        let mut container = open(&spec);
        let mut decoder = container.audio_decoder(AUDIO_STREAM_ID).unwrap();
        let packet = container.read_packet().unwrap().unwrap();
        let chunk = decoder.decode(&packet).unwrap();
        assert_eq!(chunk.frames(), 882);
        assert_eq!(chunk.samples[0], 0.0);
        assert_eq!(chunk.samples[2], chunk.samples[3]);
    }

    #[test]
    fn test_tags_and_validation() {
        let mut spec = SyntheticSpec::default();
        spec.tags.insert("Title".into(), "Bars".into());
        let container = open(&spec);
        assert_eq!(container.metadata("TITLE").as_deref(), Some("Bars"));
        assert!(container.metadata("artist").is_none());

        let empty = SyntheticSpec { audio: false, video: false, ..Default::default() };
        let err = SyntheticBackend::new().open(empty.to_source("x.synth").unwrap());
        assert!(matches!(err, Err(MediaError::Open(_))));
        assert!(SyntheticSpec::from_json(b"not json").is_err());
    }
}
