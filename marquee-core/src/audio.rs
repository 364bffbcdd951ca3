// AUDIO TRACK - pull-model PCM supply
//
// The audio sink (a cpal callback, a test loop, a frontend's own mixer) calls
// `produce` whenever it wants samples. Decoding happens right there, on the
// caller's thread, one packet at a time until the request can be met.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{sample_to_i16, AudioDecoder, AudioParams, Resampler, RubatoResampler, StreamKind};
use crate::config::{MediaConfig, OutputSpec};
use crate::error::{MediaError, Result};
use crate::track::{ErrorRun, Track, TrackCore};

/// Result of one `produce` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Produced {
    /// Samples written to the front of the buffer; the rest is silence
    pub samples: usize,
    /// The stream is drained and nothing more will come
    pub finished: bool,
}

struct DecodeState {
    decoder: Box<dyn AudioDecoder>,
    resampler: Option<Box<dyn Resampler>>,
    errors: ErrorRun,
    /// Decoder and resampler have nothing more to give
    drained: bool,
    scratch: Vec<i16>,
}

pub struct AudioTrack {
    core: TrackCore,
    output: OutputSpec,
    chunk_frames: usize,
    decode: Mutex<DecodeState>,
    buffer: Mutex<VecDeque<i16>>,
    /// f32 gain bits
    volume: AtomicU32,
    frames_delivered: AtomicU64,
    finished: AtomicBool,
    active: AtomicBool,
}

impl AudioTrack {
    pub fn new(
        core: TrackCore,
        decoder: Box<dyn AudioDecoder>,
        params: AudioParams,
        config: &MediaConfig,
    ) -> Self {
        let output = config.audio_output;
        let resampler: Option<Box<dyn Resampler>> =
            if params.sample_rate != output.sample_rate || params.channels != output.channels {
                tracing::info!(
                    "Audio stream {}: converting {} Hz x{} to {} Hz x{}",
                    core.stream_id(),
                    params.sample_rate,
                    params.channels,
                    output.sample_rate,
                    output.channels
                );
                Some(Box::new(RubatoResampler::new(output, config.audio_chunk_frames)))
            } else {
                None
            };

        Self {
            core,
            output,
            chunk_frames: config.audio_chunk_frames,
            decode: Mutex::new(DecodeState {
                decoder,
                resampler,
                errors: ErrorRun::new(config.max_consecutive_decode_errors),
                drained: false,
                scratch: Vec::new(),
            }),
            buffer: Mutex::new(VecDeque::with_capacity(output.sample_rate as usize)),
            volume: AtomicU32::new(1.0f32.to_bits()),
            frames_delivered: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            active: AtomicBool::new(false),
        }
    }

    pub fn output_spec(&self) -> OutputSpec {
        self.output
    }

    /// Fill `out` with interleaved samples in the output layout.
    ///
    /// Returns how many samples are real; the remainder is zeroed. While the
    /// track is stopped it hands out silence without consuming the stream.
    pub fn produce(&self, out: &mut [i16]) -> Result<Produced> {
        let mut guard = self.decode.lock();
        if !self.active.load(Ordering::Acquire) || self.finished.load(Ordering::Acquire) {
            out.fill(0);
            return Ok(Produced {
                samples: 0,
                finished: self.finished.load(Ordering::Acquire),
            });
        }
        let state = &mut *guard;

        while !state.drained && self.buffer.lock().len() < out.len() {
            if let Err(err) = self.decode_next(state) {
                // Fatal for this stream: behave as finished from now on
                state.drained = true;
                self.buffer.lock().clear();
                self.finished.store(true, Ordering::Release);
                self.core.set_at_end(true);
                self.core.record_error(err.clone());
                out.fill(0);
                return Err(err);
            }
        }

        let mut buffer = self.buffer.lock();
        let n = out.len().min(buffer.len());
        let gain = self.volume();
        for (dst, sample) in out.iter_mut().zip(buffer.drain(..n)) {
            *dst = if gain >= 1.0 {
                sample
            } else {
                (sample as f32 * gain) as i16
            };
        }
        out[n..].fill(0);

        let channels = self.output.channels.max(1) as u64;
        self.frames_delivered.fetch_add(n as u64 / channels, Ordering::Relaxed);

        let finished = state.drained && buffer.is_empty();
        if finished && !self.finished.swap(true, Ordering::AcqRel) {
            tracing::debug!("Audio stream {} finished", self.core.stream_id());
        }
        Ok(Produced { samples: n, finished })
    }

    /// Decode one packet into the sample buffer, or drain the resampler at
    /// end of stream. Only fatal errors come back.
    fn decode_next(&self, state: &mut DecodeState) -> Result<()> {
        let Some(packet) = self.core.next_packet() else {
            if let Some(resampler) = state.resampler.as_mut() {
                state.scratch.clear();
                resampler.flush(&mut state.scratch)?;
                self.buffer.lock().extend(state.scratch.drain(..));
            }
            state.drained = true;
            self.core.set_at_end(true);
            return Ok(());
        };

        let chunk = match state.decoder.decode(&packet) {
            Ok(chunk) => chunk,
            Err(err) => {
                return match state.errors.failure(self.core.stream_id(), &err) {
                    Some(fatal) => Err(fatal),
                    None => Ok(()),
                };
            }
        };
        state.errors.success();
        if chunk.frames() == 0 {
            return Ok(());
        }

        if state.resampler.is_none()
            && (chunk.sample_rate != self.output.sample_rate || chunk.channels != self.output.channels)
        {
            tracing::info!(
                "Audio stream {} changed to {} Hz x{}, enabling conversion",
                self.core.stream_id(),
                chunk.sample_rate,
                chunk.channels
            );
            state.resampler = Some(Box::new(RubatoResampler::new(self.output, self.chunk_frames)));
        }

        match state.resampler.as_mut() {
            Some(resampler) => {
                state.scratch.clear();
                resampler.process(&chunk, &mut state.scratch)?;
                self.buffer.lock().extend(state.scratch.drain(..));
            }
            None => {
                self.buffer
                    .lock()
                    .extend(chunk.samples.iter().map(|s| sample_to_i16(*s)));
            }
        }
        Ok(())
    }

    /// Allow `produce` to consume the stream.
    pub fn start(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// Hand out silence, keeping buffered samples for `start`.
    pub fn pause(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Drop all buffered and queued data and rewind the position counter to
    /// `position`. Leaves the track inactive.
    pub fn reset_to(&self, position: Duration) {
        let mut state = self.decode.lock();
        self.active.store(false, Ordering::Release);
        state.decoder.reset();
        if let Some(resampler) = state.resampler.as_mut() {
            resampler.reset();
        }
        state.errors.reset();
        state.drained = false;
        self.buffer.lock().clear();
        self.core.reset();
        self.finished.store(false, Ordering::Release);
        let frames = position.as_secs_f64() * self.output.sample_rate as f64;
        self.frames_delivered.store(frames as u64, Ordering::Relaxed);
    }

    pub fn set_volume(&self, volume: f32) {
        let volume = if volume.is_nan() { 1.0 } else { volume.clamp(0.0, 1.0) };
        self.volume.store(volume.to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    /// Time delivered to the sink so far, at the output rate.
    pub fn position(&self) -> Duration {
        let frames = self.frames_delivered.load(Ordering::Relaxed);
        Duration::from_secs_f64(frames as f64 / self.output.sample_rate.max(1) as f64)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl Track for AudioTrack {
    fn stream_id(&self) -> u32 {
        self.core.stream_id()
    }

    fn kind(&self) -> StreamKind {
        StreamKind::Audio
    }

    fn stop(&self) {
        self.reset_to(Duration::ZERO);
    }

    fn at_end(&self) -> bool {
        self.core.at_end()
    }

    fn is_behind(&self) -> bool {
        self.core.is_behind()
    }

    fn last_error(&self) -> Option<MediaError> {
        self.core.last_error()
    }
}

/// Cloneable handle the audio sink pulls from. After the session stops or
/// closes the track it yields silence.
#[derive(Clone)]
pub struct AudioSource {
    track: Arc<AudioTrack>,
}

impl AudioSource {
    pub(crate) fn new(track: Arc<AudioTrack>) -> Self {
        Self { track }
    }

    pub fn produce(&self, out: &mut [i16]) -> Result<Produced> {
        self.track.produce(out)
    }

    pub fn spec(&self) -> OutputSpec {
        self.track.output_spec()
    }

    /// Time handed to the sink so far. Follows seeks and stops.
    pub fn position(&self) -> Duration {
        self.track.position()
    }
}
