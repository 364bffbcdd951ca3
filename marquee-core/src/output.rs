// AUDIO OUTPUT - cpal sink pulling from an AudioSource

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};

use crate::audio::AudioSource;
use crate::config::OutputSpec;
use crate::error::{MediaError, Result};

fn default_device() -> Result<Device> {
    cpal::default_host()
        .default_output_device()
        .ok_or_else(|| MediaError::resource("No default output device found"))
}

/// Plays an `AudioSource` through the default output device until dropped.
pub struct CpalOutput {
    stream: Stream,
}

impl CpalOutput {
    /// Rate and channel count the default device prefers. Pass this as
    /// `MediaConfig::audio_output` so no conversion happens in the callback.
    pub fn default_spec() -> Result<OutputSpec> {
        let config = default_device()?
            .default_output_config()
            .map_err(|e| MediaError::resource(format!("Failed to get output config: {}", e)))?;
        Ok(OutputSpec {
            sample_rate: config.sample_rate().0,
            channels: config.channels(),
        })
    }

    pub fn start(source: AudioSource) -> Result<Self> {
        let device = default_device()?;
        let supported = device
            .default_output_config()
            .map_err(|e| MediaError::resource(format!("Failed to get output config: {}", e)))?;
        let sample_format = supported.sample_format();
        let mut config: StreamConfig = supported.into();
        let spec = source.spec();
        config.sample_rate = cpal::SampleRate(spec.sample_rate);
        config.channels = spec.channels;

        let err_fn = |err| tracing::error!("Audio stream error: {}", err);
        let mut pull = Puller::new(source);

        let stream = match sample_format {
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let samples = pull.fill(data.len());
                    for (dst, s) in data.iter_mut().zip(samples) {
                        *dst = *s as f32 / 32768.0;
                    }
                },
                err_fn,
                None,
            ),
            SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let samples = pull.fill(data.len());
                    data.copy_from_slice(samples);
                },
                err_fn,
                None,
            ),
            SampleFormat::U16 => device.build_output_stream(
                &config,
                move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                    let samples = pull.fill(data.len());
                    for (dst, s) in data.iter_mut().zip(samples) {
                        *dst = (*s as i32 + 32768) as u16;
                    }
                },
                err_fn,
                None,
            ),
            other => {
                return Err(MediaError::resource(format!(
                    "Unsupported sample format {:?}",
                    other
                )))
            }
        }
        .map_err(|e| MediaError::resource(format!("Failed to build stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| MediaError::resource(format!("Failed to start stream: {}", e)))?;
        tracing::info!(
            "Audio output started: {} Hz x{} ({:?})",
            spec.sample_rate,
            spec.channels,
            sample_format
        );
        Ok(Self { stream })
    }

    pub fn pause(&self) -> Result<()> {
        self.stream
            .pause()
            .map_err(|e| MediaError::resource(format!("Failed to pause stream: {}", e)))
    }
}

/// Callback-side state: the source plus a reusable i16 buffer.
struct Puller {
    source: AudioSource,
    scratch: Vec<i16>,
    failed: bool,
}

impl Puller {
    fn new(source: AudioSource) -> Self {
        Self {
            source,
            scratch: Vec::new(),
            failed: false,
        }
    }

    fn fill(&mut self, len: usize) -> &[i16] {
        self.scratch.resize(len, 0);
        if self.failed {
            self.scratch.fill(0);
            return &self.scratch;
        }
        if let Err(e) = self.source.produce(&mut self.scratch) {
            tracing::error!("Audio output stopped: {}", e);
            self.failed = true;
        }
        &self.scratch
    }
}
