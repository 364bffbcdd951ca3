// Sample-rate and channel conversion for the audio track.
//
// Decoded PCM is remixed to the output channel count first, then run through
// a rubato polynomial resampler when the rates differ. Rubato wants fixed
// input chunks, so remixed samples are staged until a full chunk is ready.

use rubato::{FastFixedIn, PolynomialDegree, Resampler as RubatoApi};

use super::{sample_to_i16, AudioChunk, Resampler};
use crate::config::OutputSpec;
use crate::error::{MediaError, Result};

struct Engine {
    in_rate: u32,
    inner: FastFixedIn<f32>,
    /// Planar input waiting for a full chunk
    pending: Vec<Vec<f32>>,
    /// Leading output frames that are pure filter delay
    skip: usize,
    frames_in: u64,
    frames_out: u64,
}

pub struct RubatoResampler {
    output: OutputSpec,
    chunk_frames: usize,
    engine: Option<Engine>,
}

impl RubatoResampler {
    pub fn new(output: OutputSpec, chunk_frames: usize) -> Self {
        Self {
            output,
            chunk_frames: chunk_frames.max(64),
            engine: None,
        }
    }

    fn build(&self, in_rate: u32) -> Result<Engine> {
        let ratio = self.output.sample_rate as f64 / in_rate as f64;
        let inner = FastFixedIn::<f32>::new(
            ratio,
            1.0,
            PolynomialDegree::Cubic,
            self.chunk_frames,
            self.output.channels as usize,
        )
        .map_err(|e| MediaError::resource(format!("Resampler setup failed: {}", e)))?;
        let skip = inner.output_delay();
        tracing::debug!(
            "Resampler {} Hz -> {} Hz, {} channels, chunk {}",
            in_rate,
            self.output.sample_rate,
            self.output.channels,
            self.chunk_frames
        );
        Ok(Engine {
            in_rate,
            inner,
            pending: vec![Vec::with_capacity(self.chunk_frames * 2); self.output.channels as usize],
            skip,
            frames_in: 0,
            frames_out: 0,
        })
    }

    /// Planar copy of `chunk` with the output's channel count.
    fn remix(&self, chunk: &AudioChunk) -> Vec<Vec<f32>> {
        let in_ch = chunk.channels as usize;
        let out_ch = self.output.channels as usize;
        let frames = chunk.frames();
        let mut planar = vec![Vec::with_capacity(frames); out_ch];

        for frame in chunk.samples.chunks_exact(in_ch) {
            if out_ch == 1 {
                planar[0].push(frame.iter().sum::<f32>() / in_ch as f32);
            } else {
                for (c, plane) in planar.iter_mut().enumerate() {
                    plane.push(frame[c % in_ch]);
                }
            }
        }
        planar
    }

    /// Interleave `planar` into `out` after dropping `skip` leading frames.
    /// Returns the number of frames written.
    fn emit(planar: &[Vec<f32>], skip: &mut usize, limit: Option<usize>, out: &mut Vec<i16>) -> usize {
        let frames = planar.first().map_or(0, Vec::len);
        let start = (*skip).min(frames);
        *skip -= start;
        let end = limit.map_or(frames, |l| (start + l).min(frames));
        for i in start..end {
            for plane in planar {
                out.push(sample_to_i16(plane[i]));
            }
        }
        end - start
    }

    fn drain_full_chunks(engine: &mut Engine, out: &mut Vec<i16>) -> Result<()> {
        loop {
            let needed = engine.inner.input_frames_next();
            if engine.pending.first().map_or(0, Vec::len) < needed {
                return Ok(());
            }
            let block: Vec<Vec<f32>> = engine
                .pending
                .iter_mut()
                .map(|plane| plane.drain(..needed).collect())
                .collect();
            let resampled = engine
                .inner
                .process(block.as_slice(), None)
                .map_err(|e| MediaError::resource(format!("Resampling failed: {}", e)))?;
            engine.frames_out += Self::emit(&resampled, &mut engine.skip, None, out) as u64;
        }
    }

    /// Emit everything still inside the engine: the staged partial chunk and
    /// the filter delay, trimmed to the length the input implies.
    fn finish(&self, engine: &mut Engine, out: &mut Vec<i16>) -> Result<()> {
        let ratio = self.output.sample_rate as f64 / engine.in_rate as f64;
        let target = (engine.frames_in as f64 * ratio).ceil() as u64;

        // Two passes cover a partial chunk plus a delay shorter than a chunk
        for _ in 0..2 {
            if engine.frames_out >= target {
                break;
            }
            let staged = engine.pending.first().map_or(0, Vec::len) > 0;
            let resampled = if staged {
                engine.inner.process_partial(Some(engine.pending.as_slice()), None)
            } else {
                engine.inner.process_partial(None::<&[Vec<f32>]>, None)
            }
            .map_err(|e| MediaError::resource(format!("Resampling failed: {}", e)))?;
            for plane in engine.pending.iter_mut() {
                plane.clear();
            }
            let limit = (target - engine.frames_out) as usize;
            engine.frames_out += Self::emit(&resampled, &mut engine.skip, Some(limit), out) as u64;
        }
        Ok(())
    }
}

impl Resampler for RubatoResampler {
    fn process(&mut self, chunk: &AudioChunk, out: &mut Vec<i16>) -> Result<()> {
        if chunk.frames() == 0 {
            return Ok(());
        }
        let planar = self.remix(chunk);

        // Rate changed mid-stream: drain the old engine before moving on
        if let Some(mut old) = self.engine.take() {
            if old.in_rate == chunk.sample_rate {
                self.engine = Some(old);
            } else {
                self.finish(&mut old, out)?;
            }
        }

        if chunk.sample_rate == self.output.sample_rate {
            Self::emit(&planar, &mut 0, None, out);
            return Ok(());
        }

        let mut engine = match self.engine.take() {
            Some(engine) => engine,
            None => self.build(chunk.sample_rate)?,
        };

        engine.frames_in += chunk.frames() as u64;
        for (pending, plane) in engine.pending.iter_mut().zip(planar) {
            pending.extend(plane);
        }
        let result = Self::drain_full_chunks(&mut engine, out);
        self.engine = Some(engine);
        result
    }

    fn flush(&mut self, out: &mut Vec<i16>) -> Result<()> {
        if let Some(mut engine) = self.engine.take() {
            self.finish(&mut engine, out)?;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.engine = None;
    }
}
