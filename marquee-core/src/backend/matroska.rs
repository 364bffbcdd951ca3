// Matroska/WebM containers with H.264 video, decoded through OpenH264.
//
// matroska-demuxer supplies tracks and frames; frame timestamps are in
// nanoseconds. Audio tracks in a codec symphonia knows (AAC, MP3) are decoded
// with it. Files without an H.264 track are refused so the symphonia backend
// can take audio-only Matroska.
//
// The demuxer cannot reposition, so the file is held in memory and a seek
// reopens it and skips ahead to the last video keyframe at or before the
// target.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use matroska_demuxer::{Frame, MatroskaFile, TrackEntry, TrackType};
use openh264::formats::YUVSource;
use symphonia::core::codecs::{CodecParameters, CodecType, CODEC_TYPE_AAC, CODEC_TYPE_MP3};

use super::symphonia_decode::SymphoniaAudioDecoder;
use super::{
    AudioDecoder, AudioParams, Container, FrameMemory, MediaBackend, Packet, PixelFormat,
    Rational, RawVideoFrame, StreamInfo, StreamKind, VideoDecoder, VideoParams,
};
use crate::config::SOFTWARE_DECODER;
use crate::error::{MediaError, Result};
use crate::source::MediaSource;

const H264_CODEC_ID: &str = "V_MPEG4/ISO/AVC";
const NANOS: Rational = Rational { num: 1, den: 1_000_000_000 };

type Reader = MatroskaFile<Cursor<Arc<[u8]>>>;

pub struct MatroskaBackend;

impl MatroskaBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MatroskaBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaBackend for MatroskaBackend {
    fn name(&self) -> &str {
        "matroska"
    }

    fn extensions(&self) -> &[&'static str] {
        &["mkv", "webm"]
    }

    fn decoders(&self) -> Vec<String> {
        vec![SOFTWARE_DECODER.to_string()]
    }

    fn open(&self, source: MediaSource) -> Result<Box<dyn Container>> {
        let name = source.name.clone();
        let bytes: Arc<[u8]> = source.into_bytes()?.into();
        let mkv = open_reader(&bytes, &name)?;

        let mut streams = Vec::new();
        let mut setups = Vec::new();
        for track in mkv.tracks() {
            if let Some((info, setup)) = describe_track(track) {
                streams.push(info);
                setups.push(setup);
            }
        }
        let video_track = streams
            .iter()
            .zip(&setups)
            .find(|(s, setup)| s.kind == StreamKind::Video && setup.codec_id == H264_CODEC_ID)
            .map(|(s, _)| s.id as u64)
            .ok_or_else(|| MediaError::open(format!("{}: no H.264 video track", name)))?;

        let info = mkv.info();
        let duration = info
            .duration()
            .filter(|d| d.is_finite() && *d > 0.0)
            .map(|ns| Duration::from_nanos(ns as u64));
        let mut tags = Vec::new();
        for (key, value) in [
            ("title", info.title()),
            ("muxing_app", Some(info.muxing_app())),
            ("writing_app", Some(info.writing_app())),
        ] {
            if let Some(value) = value {
                tags.push((key.to_string(), value.to_string()));
            }
        }

        tracing::info!(
            "Opened Matroska {}: {} track(s), duration {:?}",
            name,
            streams.len(),
            duration
        );
        Ok(Box::new(MatroskaContainer {
            name,
            bytes,
            mkv,
            frame: Frame::default(),
            staged: None,
            streams,
            setups,
            video_track,
            duration,
            tags,
        }))
    }
}

fn open_reader(bytes: &Arc<[u8]>, name: &str) -> Result<Reader> {
    MatroskaFile::open(Cursor::new(bytes.clone()))
        .map_err(|e| MediaError::open(format!("{}: failed to parse Matroska: {:?}", name, e)))
}

/// What a decoder needs beyond the stream description.
struct TrackSetup {
    codec_id: String,
    codec_private: Option<Vec<u8>>,
}

fn describe_track(track: &TrackEntry) -> Option<(StreamInfo, TrackSetup)> {
    let id = u32::try_from(track.track_number().get()).ok()?;
    let codec_id = track.codec_id().to_string();
    let (kind, video, audio) = match track.track_type() {
        TrackType::Video => {
            let v = track.video()?;
            let width = v.pixel_width().get() as u32;
            let height = v.pixel_height().get() as u32;
            let display = v
                .display_width()
                .zip(v.display_height())
                .map(|(w, h)| (w.get() as u32, h.get() as u32));
            let frame_rate = track
                .default_duration()
                .and_then(|ns| u32::try_from(ns.get()).ok())
                .map_or(Rational::new(0, 1), |ns| Rational::new(1_000_000_000, ns));
            let params = VideoParams {
                width,
                height,
                sample_aspect: sample_aspect((width, height), display),
                frame_rate,
                pixel_format: PixelFormat::I420,
            };
            (StreamKind::Video, Some(params), None)
        }
        TrackType::Audio => {
            let a = track.audio()?;
            let params = AudioParams {
                sample_rate: a.sampling_frequency() as u32,
                channels: a.channels().get() as u16,
            };
            (StreamKind::Audio, None, Some(params))
        }
        _ => (StreamKind::Other, None, None),
    };
    let info = StreamInfo {
        id,
        kind,
        codec: codec_id.clone(),
        time_base: NANOS,
        duration: None,
        frame_count: None,
        video,
        audio,
    };
    let setup = TrackSetup {
        codec_id,
        codec_private: track.codec_private().map(<[u8]>::to_vec),
    };
    Some((info, setup))
}

/// Pixel aspect implied by the display size, reduced.
fn sample_aspect(pixels: (u32, u32), display: Option<(u32, u32)>) -> Rational {
    let Some((dw, dh)) = display else {
        return Rational::ONE;
    };
    let (pw, ph) = pixels;
    if dw == 0 || dh == 0 || pw == 0 || ph == 0 {
        return Rational::ONE;
    }
    let num = dw as u64 * ph as u64;
    let den = dh as u64 * pw as u64;
    let g = gcd(num, den);
    match (u32::try_from(num / g), u32::try_from(den / g)) {
        (Ok(num), Ok(den)) => Rational::new(num, den),
        _ => Rational::ONE,
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a.max(1)
}

fn symphonia_codec(codec_id: &str) -> Option<CodecType> {
    match codec_id {
        "A_AAC" => Some(CODEC_TYPE_AAC),
        id if id.starts_with("A_AAC/") => Some(CODEC_TYPE_AAC),
        "A_MPEG/L3" => Some(CODEC_TYPE_MP3),
        _ => None,
    }
}

struct MatroskaContainer {
    name: String,
    bytes: Arc<[u8]>,
    mkv: Reader,
    frame: Frame,
    /// First packet to hand out after a seek
    staged: Option<Packet>,
    streams: Vec<StreamInfo>,
    setups: Vec<TrackSetup>,
    video_track: u64,
    duration: Option<Duration>,
    tags: Vec<(String, String)>,
}

impl MatroskaContainer {
    fn next_frame(&mut self) -> Result<bool> {
        self.mkv
            .next_frame(&mut self.frame)
            .map_err(|e| MediaError::decode(format!("{}: Matroska read error: {:?}", self.name, e)))
    }

    /// Packet for the frame last read.
    fn take_packet(&mut self) -> Result<Packet> {
        let stream_id = u32::try_from(self.frame.track)
            .map_err(|_| MediaError::decode(format!("Track number {} out of range", self.frame.track)))?;
        Ok(Packet {
            stream_id,
            pts: Some(self.frame.timestamp.min(i64::MAX as u64) as i64),
            duration: 0,
            keyframe: self.frame.is_keyframe.unwrap_or(false),
            data: std::mem::take(&mut self.frame.data),
        })
    }

    fn setup(&self, stream_id: u32) -> Option<(&StreamInfo, &TrackSetup)> {
        self.streams
            .iter()
            .zip(&self.setups)
            .find(|(s, _)| s.id == stream_id)
    }
}

impl Container for MatroskaContainer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        if let Some(packet) = self.staged.take() {
            return Ok(Some(packet));
        }
        if !self.next_frame()? {
            return Ok(None);
        }
        self.take_packet().map(Some)
    }

    fn seek(&mut self, position: Duration) -> Result<()> {
        let target = position.as_nanos().min(u64::MAX as u128) as u64;

        // First pass finds the keyframe, second pass stops just before it
        let mut mkv = open_reader(&self.bytes, &self.name)?;
        let mut frame = Frame::default();
        let mut start = 0;
        while mkv
            .next_frame(&mut frame)
            .map_err(|e| MediaError::resource(format!("{}: seek failed: {:?}", self.name, e)))?
        {
            if frame.timestamp > target {
                break;
            }
            if frame.track == self.video_track && frame.is_keyframe.unwrap_or(false) {
                start = frame.timestamp;
            }
        }

        self.mkv = open_reader(&self.bytes, &self.name)?;
        self.staged = None;
        let mut skipped = 0u64;
        while self.next_frame()? {
            if self.frame.timestamp >= start {
                self.staged = Some(self.take_packet()?);
                break;
            }
            skipped += 1;
        }
        tracing::debug!(
            "{}: seek to {:?} starts at keyframe {} ns ({} frames skipped)",
            self.name,
            position,
            start,
            skipped
        );
        Ok(())
    }

    fn duration(&self) -> Option<Duration> {
        self.duration
    }

    fn metadata(&self, tag: &str) -> Option<String> {
        self.tags
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(tag))
            .map(|(_, v)| v.clone())
    }

    fn audio_decoder(&self, stream_id: u32) -> Result<Box<dyn AudioDecoder>> {
        let (info, setup) = self
            .setup(stream_id)
            .filter(|(s, _)| s.kind == StreamKind::Audio)
            .ok_or_else(|| MediaError::open(format!("No audio track {}", stream_id)))?;
        let codec = symphonia_codec(&setup.codec_id)
            .ok_or_else(|| MediaError::open(format!("Unsupported audio codec {}", setup.codec_id)))?;
        let mut params = CodecParameters::new();
        params.for_codec(codec);
        if let Some(audio) = info.audio {
            params.with_sample_rate(audio.sample_rate);
        }
        if let Some(private) = &setup.codec_private {
            params.with_extra_data(private.clone().into_boxed_slice());
        }
        Ok(Box::new(SymphoniaAudioDecoder::new(stream_id, &params)?))
    }

    fn video_decoder(&self, stream_id: u32, preferred: &str) -> Result<Box<dyn VideoDecoder>> {
        let (_, setup) = self
            .setup(stream_id)
            .filter(|(s, _)| s.kind == StreamKind::Video)
            .ok_or_else(|| MediaError::open(format!("No video track {}", stream_id)))?;
        if setup.codec_id != H264_CODEC_ID {
            return Err(MediaError::open(format!("Unsupported video codec {}", setup.codec_id)));
        }
        if preferred != SOFTWARE_DECODER {
            tracing::warn!("Decoder {} not available for H.264, using software", preferred);
        }
        Ok(Box::new(H264Decoder::new(setup.codec_private.as_deref())?))
    }
}

// ============================================================================
// H.264
// ============================================================================

/// SPS/PPS and NAL length size from an `avcC` record. Anything else is
/// taken to be Annex B already.
fn parse_avcc(private: &[u8]) -> (Vec<Vec<u8>>, usize) {
    if private.len() < 7 || private[0] != 1 {
        let sets = if private.is_empty() { Vec::new() } else { vec![private.to_vec()] };
        return (sets, 4);
    }
    let length_size = (private[4] & 0x03) as usize + 1;
    let mut sets = Vec::new();
    let mut offset = 5;
    // SPS count is in the low 5 bits, PPS count is a full byte
    for mask in [0x1F, 0xFF] {
        let Some(&count) = private.get(offset) else {
            break;
        };
        offset += 1;
        for _ in 0..(count & mask) {
            let Some(len) = private.get(offset..offset + 2) else {
                return (sets, length_size);
            };
            let len = u16::from_be_bytes([len[0], len[1]]) as usize;
            offset += 2;
            let Some(nal) = private.get(offset..offset + len) else {
                return (sets, length_size);
            };
            let mut unit = vec![0, 0, 0, 1];
            unit.extend_from_slice(nal);
            sets.push(unit);
            offset += len;
        }
    }
    (sets, length_size)
}

/// Rewrite length-prefixed NAL units with start codes. Data that does not
/// split exactly into length-prefixed units is taken to be Annex B already.
fn to_annex_b(data: &[u8], length_size: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    let mut offset = 0;
    while offset < data.len() {
        let Some(prefix) = data.get(offset..offset + length_size) else {
            return data.to_vec();
        };
        let len = prefix.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
        offset += length_size;
        let Some(nal) = data.get(offset..offset + len) else {
            return data.to_vec();
        };
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(nal);
        offset += len;
    }
    if out.is_empty() {
        data.to_vec()
    } else {
        out
    }
}

/// Append `height` rows of `width` bytes, dropping stride padding.
fn pack_plane(src: &[u8], stride: usize, width: usize, height: usize, out: &mut Vec<u8>) -> Result<()> {
    for row in 0..height {
        let start = row * stride;
        let line = src
            .get(start..start + width)
            .ok_or_else(|| MediaError::decode("Truncated H.264 picture plane"))?;
        out.extend_from_slice(line);
    }
    Ok(())
}

fn new_openh264() -> Result<openh264::decoder::Decoder> {
    openh264::decoder::Decoder::new()
        .map_err(|e| MediaError::resource(format!("Failed to create OpenH264 decoder: {:?}", e)))
}

pub struct H264Decoder {
    inner: Option<openh264::decoder::Decoder>,
    parameter_sets: Vec<Vec<u8>>,
    length_size: usize,
    primed: bool,
}

impl H264Decoder {
    pub fn new(codec_private: Option<&[u8]>) -> Result<Self> {
        let (parameter_sets, length_size) = codec_private.map_or((Vec::new(), 4), parse_avcc);
        Ok(Self {
            inner: Some(new_openh264()?),
            parameter_sets,
            length_size,
            primed: false,
        })
    }
}

impl VideoDecoder for H264Decoder {
    fn name(&self) -> &str {
        "openh264"
    }

    fn decode(&mut self, packet: &Packet) -> Result<Vec<RawVideoFrame>> {
        let decoder = self
            .inner
            .as_mut()
            .ok_or_else(|| MediaError::resource("OpenH264 decoder unavailable"))?;
        if !self.primed {
            for unit in &self.parameter_sets {
                if let Err(e) = decoder.decode(unit) {
                    tracing::debug!("OpenH264 rejected parameter set: {:?}", e);
                }
            }
            self.primed = true;
        }

        let data = to_annex_b(&packet.data, self.length_size);
        let yuv = match decoder.decode(&data) {
            Ok(Some(yuv)) => yuv,
            Ok(None) => return Ok(Vec::new()),
            Err(e) => return Err(MediaError::decode(format!("OpenH264 decode error: {:?}", e))),
        };

        let (width, height) = yuv.dimensions();
        let (y_stride, u_stride, v_stride) = yuv.strides();
        let (chroma_w, chroma_h) = ((width + 1) / 2, (height + 1) / 2);
        let mut planes = Vec::with_capacity(PixelFormat::I420.buffer_size(width as u32, height as u32));
        pack_plane(yuv.y(), y_stride, width, height, &mut planes)?;
        pack_plane(yuv.u(), u_stride, chroma_w, chroma_h, &mut planes)?;
        pack_plane(yuv.v(), v_stride, chroma_w, chroma_h, &mut planes)?;

        Ok(vec![RawVideoFrame {
            pts: packet.pts,
            width: width as u32,
            height: height as u32,
            format: PixelFormat::I420,
            memory: FrameMemory::Host(planes),
        }])
    }

    fn flush(&mut self) -> Result<Vec<RawVideoFrame>> {
        Ok(Vec::new())
    }

    fn reset(&mut self) {
        self.inner = match new_openh264() {
            Ok(decoder) => Some(decoder),
            Err(e) => {
                tracing::error!("{}", e);
                None
            }
        };
        self.primed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avcc_parameter_sets() {
        // version, profile, compat, level, 4-byte lengths, 1 SPS, 1 PPS
        let avcc = [
            1, 0x42, 0xC0, 0x1E, 0xFF, 0xE1, 0x00, 0x03, 0x67, 0x42, 0x1E, 0x01, 0x00, 0x02, 0x68, 0xCE,
        ];
        let (sets, length_size) = parse_avcc(&avcc);
        assert_eq!(length_size, 4);
        assert_eq!(sets, vec![vec![0, 0, 0, 1, 0x67, 0x42, 0x1E], vec![0, 0, 0, 1, 0x68, 0xCE]]);
    }

    #[test]
    fn test_avcc_truncated_keeps_what_parsed() {
        let avcc = [1, 0x42, 0xC0, 0x1E, 0xFD, 0xE1, 0x00, 0x03, 0x67, 0x42, 0x1E, 0x01, 0x00, 0x09];
        let (sets, length_size) = parse_avcc(&avcc);
        assert_eq!(length_size, 2);
        assert_eq!(sets.len(), 1);
    }

    #[test]
    fn test_annex_b_private_passes_through() {
        let raw = [0, 0, 0, 1, 0x67, 0x42];
        assert_eq!(parse_avcc(&raw), (vec![raw.to_vec()], 4));
        assert_eq!(parse_avcc(&[]), (Vec::new(), 4));
    }

    #[test]
    fn test_length_prefixed_to_annex_b() {
        let avc = [0, 0, 0, 2, 0x65, 0x88, 0, 0, 0, 1, 0x41];
        assert_eq!(to_annex_b(&avc, 4), vec![0, 0, 0, 1, 0x65, 0x88, 0, 0, 0, 1, 0x41]);

        let short = [0, 2, 0x65, 0x88];
        assert_eq!(to_annex_b(&short, 2), vec![0, 0, 0, 1, 0x65, 0x88]);

        let already = [0, 0, 1, 0x65];
        assert_eq!(to_annex_b(&already, 4), already.to_vec());
        let start_code = [0, 0, 0, 1, 0x67, 0x42];
        assert_eq!(to_annex_b(&start_code, 4), start_code.to_vec());
    }

    #[test]
    fn test_pack_plane_drops_stride_padding() {
        let src = [1, 2, 3, 0, 0, 4, 5, 6, 0, 0];
        let mut out = Vec::new();
        pack_plane(&src, 5, 3, 2, &mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6]);

        assert!(pack_plane(&src, 5, 3, 3, &mut out).is_err());
    }

    #[test]
    fn test_sample_aspect_from_display_size() {
        assert_eq!(sample_aspect((720, 480), Some((640, 480))), Rational::new(8, 9));
        assert_eq!(sample_aspect((320, 240), None), Rational::ONE);
        assert_eq!(sample_aspect((320, 240), Some((0, 240))), Rational::ONE);
    }

    #[test]
    fn test_audio_codec_mapping() {
        assert_eq!(symphonia_codec("A_AAC"), Some(CODEC_TYPE_AAC));
        assert_eq!(symphonia_codec("A_AAC/MPEG4/LC"), Some(CODEC_TYPE_AAC));
        assert_eq!(symphonia_codec("A_MPEG/L3"), Some(CODEC_TYPE_MP3));
        assert_eq!(symphonia_codec("A_OPUS"), None);
    }

    #[test]
    fn test_garbage_is_open_error() {
        let source = MediaSource::from_bytes("clip.mkv", b"definitely not ebml".to_vec());
        let err = MatroskaBackend::new().open(source).err().unwrap();
        assert!(matches!(err, MediaError::Open(_)), "{:?}", err);
    }

    #[test]
    fn test_openh264_decoder_builds() {
        let decoder = H264Decoder::new(None).unwrap();
        assert_eq!(decoder.name(), "openh264");
        assert_eq!(decoder.length_size, 4);
    }
}
