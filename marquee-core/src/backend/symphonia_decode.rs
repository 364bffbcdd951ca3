// Symphonia-backed containers: audio-only media (WAV, FLAC, MP3, Ogg Vorbis,
// MP4/M4A AAC, Matroska audio).
//
// The format reader supplies packets and tags; one codec instance is built
// per audio track on demand. Video tracks are not decoded here.

use std::io::{Read, Seek, SeekFrom};
use std::time::Duration;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSourceStream, MediaSourceStreamOptions};
use symphonia::core::meta::{MetadataOptions, StandardTagKey, Tag};
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use super::{
    AudioChunk, AudioDecoder, AudioParams, Container, MediaBackend, Packet, Rational, StreamInfo,
    StreamKind, VideoDecoder,
};
use crate::config::SOFTWARE_DECODER;
use crate::error::{MediaError, Result};
use crate::source::{MediaSource, ReadSeek};

const EXTENSIONS: &[&str] = &[
    "wav", "flac", "mp3", "ogg", "oga", "m4a", "mp4", "mka", "mkv", "webm", "aac",
];

/// Lets symphonia read from a resolved [`MediaSource`].
struct SourceAdapter {
    reader: Box<dyn ReadSeek>,
    len: Option<u64>,
}

impl Read for SourceAdapter {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for SourceAdapter {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl symphonia::core::io::MediaSource for SourceAdapter {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        self.len
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaBackend;

impl SymphoniaBackend {
    pub fn new() -> Self {
        Self
    }
}

impl MediaBackend for SymphoniaBackend {
    fn name(&self) -> &str {
        "symphonia"
    }

    fn extensions(&self) -> &[&'static str] {
        EXTENSIONS
    }

    fn decoders(&self) -> Vec<String> {
        vec![SOFTWARE_DECODER.to_string()]
    }

    fn open(&self, source: MediaSource) -> Result<Box<dyn Container>> {
        let name = source.name.clone();
        let mut hint = Hint::new();
        if let Some(ext) = source.extension() {
            hint.with_extension(&ext);
        }

        let adapter = SourceAdapter {
            reader: source.reader,
            len: source.len,
        };
        let mss = MediaSourceStream::new(Box::new(adapter), MediaSourceStreamOptions::default());

        let mut probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| MediaError::open(format!("Failed to probe {}: {}", name, e)))?;

        let mut tags = Vec::new();
        if let Some(metadata) = probed.metadata.get() {
            if let Some(revision) = metadata.current() {
                collect_tags(revision.tags(), &mut tags);
            }
        }
        let mut format = probed.format;
        if let Some(revision) = format.metadata().current() {
            collect_tags(revision.tags(), &mut tags);
        }

        let tracks: Vec<(StreamInfo, CodecParameters)> = format
            .tracks()
            .iter()
            .filter(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .map(|t| (stream_info(t.id, &t.codec_params), t.codec_params.clone()))
            .collect();

        tracing::info!(
            "Opened {} with symphonia: {} audio track(s), {} tag(s)",
            name,
            tracks.len(),
            tags.len()
        );

        let duration = tracks.iter().filter_map(|(s, _)| s.duration()).max();
        let (streams, params) = tracks.into_iter().unzip();
        Ok(Box::new(SymphoniaContainer {
            format,
            streams,
            params,
            tags,
            duration,
        }))
    }
}

fn stream_info(id: u32, params: &CodecParameters) -> StreamInfo {
    let sample_rate = params.sample_rate.unwrap_or(44_100);
    let codec = symphonia::default::get_codecs()
        .get_codec(params.codec)
        .map(|c| c.short_name.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    StreamInfo {
        id,
        kind: StreamKind::Audio,
        codec,
        time_base: params
            .time_base
            .map(|tb| Rational::new(tb.numer, tb.denom))
            .unwrap_or(Rational::new(1, sample_rate)),
        duration: params.n_frames.map(|n| n as i64),
        frame_count: None,
        video: None,
        audio: Some(AudioParams {
            sample_rate,
            channels: params.channels.map(|c| c.count() as u16).unwrap_or(2),
        }),
    }
}

fn collect_tags(source: &[Tag], out: &mut Vec<(String, String)>) {
    for tag in source {
        let value = tag.value.to_string();
        if let Some(key) = tag.std_key {
            let friendly = match key {
                StandardTagKey::TrackTitle => "title".to_string(),
                StandardTagKey::Artist => "artist".to_string(),
                StandardTagKey::Album => "album".to_string(),
                StandardTagKey::Genre => "genre".to_string(),
                StandardTagKey::Date => "date".to_string(),
                StandardTagKey::TrackNumber => "track".to_string(),
                StandardTagKey::Comment => "comment".to_string(),
                other => format!("{:?}", other),
            };
            out.push((friendly, value.clone()));
        }
        out.push((tag.key.clone(), value));
    }
}

struct SymphoniaContainer {
    format: Box<dyn FormatReader>,
    streams: Vec<StreamInfo>,
    /// Codec parameters, parallel to `streams`
    params: Vec<CodecParameters>,
    tags: Vec<(String, String)>,
    duration: Option<Duration>,
}

impl Container for SymphoniaContainer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        match self.format.next_packet() {
            Ok(packet) => Ok(Some(Packet {
                stream_id: packet.track_id(),
                pts: Some(packet.ts() as i64),
                duration: packet.dur() as i64,
                keyframe: true,
                data: packet.buf().to_vec(),
            })),
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            // Chained streams are not followed
            Err(SymphoniaError::ResetRequired) => Ok(None),
            Err(e) => Err(MediaError::decode(format!("Packet read failed: {}", e))),
        }
    }

    fn seek(&mut self, position: Duration) -> Result<()> {
        let seek_to = SeekTo::Time {
            time: Time::from(position.as_secs_f64()),
            track_id: None,
        };
        self.format
            .seek(SeekMode::Coarse, seek_to)
            .map(|_| ())
            .map_err(|e| MediaError::resource(format!("Seek to {:?} failed: {}", position, e)))
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
        let index = self
            .streams
            .iter()
            .position(|s| s.id == stream_id)
            .ok_or_else(|| MediaError::open(format!("No audio track {}", stream_id)))?;
        Ok(Box::new(SymphoniaAudioDecoder::new(stream_id, &self.params[index])?))
    }

    fn video_decoder(&self, stream_id: u32, _preferred: &str) -> Result<Box<dyn VideoDecoder>> {
        Err(MediaError::open(format!(
            "Stream {} is not a video stream the symphonia backend can decode",
            stream_id
        )))
    }
}

/// Symphonia codec fed with packets from any container.
pub(crate) struct SymphoniaAudioDecoder {
    track_id: u32,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    buffer: Option<SampleBuffer<f32>>,
}

impl SymphoniaAudioDecoder {
    pub(crate) fn new(track_id: u32, params: &CodecParameters) -> Result<Self> {
        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| MediaError::open(format!("No decoder for track {}: {}", track_id, e)))?;
        Ok(Self {
            track_id,
            decoder,
            buffer: None,
        })
    }
}

impl AudioDecoder for SymphoniaAudioDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<AudioChunk> {
        let ts = packet.pts.unwrap_or(0).max(0) as u64;
        let raw = symphonia::core::formats::Packet::new_from_slice(
            self.track_id,
            ts,
            packet.duration.max(0) as u64,
            &packet.data,
        );

        match self.decoder.decode(&raw) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let capacity = decoded.capacity() as u64;
                let needed = capacity * spec.channels.count() as u64;
                if self.buffer.as_ref().map_or(false, |b| (b.capacity() as u64) < needed) {
                    self.buffer = None;
                }
                let buffer = self
                    .buffer
                    .get_or_insert_with(|| SampleBuffer::new(capacity, spec));
                buffer.copy_interleaved_ref(decoded);

                return Ok(AudioChunk {
                    sample_rate: spec.rate,
                    channels: spec.channels.count() as u16,
                    samples: buffer.samples().to_vec(),
                });
            }
            Err(SymphoniaError::ResetRequired) => {}
            Err(e) => return Err(MediaError::decode(e.to_string())),
        }

        // Stream parameters changed; the next packet starts fresh
        self.decoder.reset();
        self.buffer = None;
        Ok(AudioChunk {
            sample_rate: 0,
            channels: 0,
            samples: Vec::new(),
        })
    }

    fn reset(&mut self) {
        self.decoder.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal 16-bit PCM WAV.
    fn wav(sample_rate: u32, channels: u16, frames: usize) -> Vec<u8> {
        let data_len = frames * channels as usize * 2;
        let mut out = Vec::with_capacity(44 + data_len);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len as u32).to_le_bytes());
        out.extend_from_slice(b"WAVEfmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&(sample_rate * channels as u32 * 2).to_le_bytes());
        out.extend_from_slice(&(channels * 2).to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(data_len as u32).to_le_bytes());
        for i in 0..frames * channels as usize {
            let v = ((i % 64) as i16 - 32) * 512;
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_wav_streams_and_duration() {
        let source = MediaSource::from_bytes("tone.wav", wav(8_000, 1, 8_000));
        let container = SymphoniaBackend::new().open(source).unwrap();

        let streams = container.streams();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].kind, StreamKind::Audio);
        assert_eq!(streams[0].audio, Some(AudioParams { sample_rate: 8_000, channels: 1 }));
        assert_eq!(container.duration(), Some(Duration::from_secs(1)));
        assert!(container.metadata("title").is_none());
    }

    #[test]
    fn test_wav_decodes_every_frame() {
        let source = MediaSource::from_bytes("tone.wav", wav(8_000, 2, 4_000));
        let mut container = SymphoniaBackend::new().open(source).unwrap();
        let id = container.streams()[0].id;
        let mut decoder = container.audio_decoder(id).unwrap();

        let mut frames = 0;
        while let Some(packet) = container.read_packet().unwrap() {
            let chunk = decoder.decode(&packet).unwrap();
            assert_eq!(chunk.channels, 2);
            frames += chunk.frames();
        }
        assert_eq!(frames, 4_000);
        assert!(container.read_packet().unwrap().is_none());
    }

    #[test]
    fn test_seek_rewinds() {
        let source = MediaSource::from_bytes("tone.wav", wav(8_000, 1, 8_000));
        let mut container = SymphoniaBackend::new().open(source).unwrap();
        while container.read_packet().unwrap().is_some() {}

        container.seek(Duration::ZERO).unwrap();
        let packet = container.read_packet().unwrap().unwrap();
        assert_eq!(packet.pts, Some(0));
    }

    #[test]
    fn test_garbage_is_open_error() {
        let source = MediaSource::from_bytes("noise.wav", vec![0x42; 256]);
        assert!(matches!(SymphoniaBackend::new().open(source), Err(MediaError::Open(_))));
    }

    #[test]
    fn test_no_video_decoder() {
        let source = MediaSource::from_bytes("tone.wav", wav(8_000, 1, 800));
        let container = SymphoniaBackend::new().open(source).unwrap();
        assert!(container.video_decoder(0, SOFTWARE_DECODER).is_err());
    }
}
