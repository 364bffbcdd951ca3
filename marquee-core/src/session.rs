//! # Media Session
//!
//! The facade a frontend talks to. It opens media through a resolver and a
//! backend, owns the demux gate and the tracks, and maps the control surface
//! (play, pause, stop, seek, tick) onto them.
//!
//! ```no_run
//! use std::sync::Arc;
//! use marquee_core::{FsResolver, MediaKind, MediaSession, MemorySurface, UniversalBackend};
//!
//! let mut session = MediaSession::new(MediaKind::AudioVideo, Arc::new(UniversalBackend::default()));
//! let surface = MemorySurface::new(320, 240);
//! session.open(&FsResolver::new(), "", "snap/pacman.synth", Some(Box::new(surface.clone())))?;
//! session.play()?;
//! while !session.is_finished() {
//!     session.tick();
//!     std::thread::sleep(std::time::Duration::from_millis(16));
//! }
//! # Ok::<(), marquee_core::MediaError>(())
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::{AudioSource, AudioTrack};
use crate::backend::{MediaBackend, Rational, SoftwareConverter, StreamInfo, StreamKind};
use crate::clock::PlaybackClock;
use crate::config::MediaConfig;
use crate::demux::DemuxGate;
use crate::error::{MediaError, Result};
use crate::packet_queue::PacketQueue;
use crate::source::SourceResolver;
use crate::surface::DisplaySurface;
use crate::track::{Track, TrackCore};
use crate::video::{VideoStats, VideoTrack};

/// Which streams a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    Audio,
    Video,
    AudioVideo,
}

impl MediaKind {
    pub fn wants_audio(&self) -> bool {
        matches!(self, Self::Audio | Self::AudioVideo)
    }

    pub fn wants_video(&self) -> bool {
        matches!(self, Self::Video | Self::AudioVideo)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Closed,
    Stopped,
    Playing,
    Paused,
}

struct OpenMedia {
    name: String,
    gate: Arc<DemuxGate>,
    audio: Option<Arc<AudioTrack>>,
    video: Option<VideoTrack>,
    surface: Option<Box<dyn DisplaySurface>>,
    aspect_ratio: f32,
    duration: Duration,
    multiframe: bool,
}

impl OpenMedia {
    fn tracks(&self) -> impl Iterator<Item = &dyn Track> {
        let audio = self.audio.as_deref().map(|t| t as &dyn Track);
        let video = self.video.as_ref().map(|t| t as &dyn Track);
        audio.into_iter().chain(video)
    }
}

pub struct MediaSession {
    kind: MediaKind,
    backend: Arc<dyn MediaBackend>,
    config: MediaConfig,
    clock: Arc<PlaybackClock>,
    state: SessionState,
    media: Option<OpenMedia>,
    volume: f32,
    looping: bool,
    error: Option<MediaError>,
}

/// Start the pull path and the decode thread together, or neither.
fn start_tracks(media: &OpenMedia) -> Result<()> {
    if let Some(audio) = &media.audio {
        audio.start();
    }
    if let Some(video) = &media.video {
        if let Err(e) = video.play() {
            if let Some(audio) = &media.audio {
                audio.pause();
            }
            return Err(e);
        }
    }
    Ok(())
}

impl MediaSession {
    pub fn new(kind: MediaKind, backend: Arc<dyn MediaBackend>) -> Self {
        Self::with_config(kind, backend, MediaConfig::default())
    }

    pub fn with_config(kind: MediaKind, backend: Arc<dyn MediaBackend>, config: MediaConfig) -> Self {
        Self {
            kind,
            backend,
            config,
            clock: Arc::new(PlaybackClock::new()),
            state: SessionState::Closed,
            media: None,
            volume: 1.0,
            looping: false,
            error: None,
        }
    }

    pub fn config(&self) -> &MediaConfig {
        &self.config
    }

    /// Open `name` (inside `archive` when non-empty). Any media already open
    /// is closed first. With a surface, the first video frame is shown
    /// before `play`.
    pub fn open(
        &mut self,
        resolver: &dyn SourceResolver,
        archive: &str,
        name: &str,
        surface: Option<Box<dyn DisplaySurface>>,
    ) -> Result<()> {
        self.close();

        let source = resolver.resolve(archive, name)?;
        let container = self.backend.open(source)?;
        let streams = container.streams().to_vec();

        let audio_stream = self
            .kind
            .wants_audio()
            .then(|| {
                streams
                    .iter()
                    .filter(|s| s.kind == StreamKind::Audio)
                    .find_map(|s| s.audio.map(|params| (s, params)))
            })
            .flatten();
        let video_stream = self
            .kind
            .wants_video()
            .then(|| streams.iter().find(|s| s.kind == StreamKind::Video && s.video.is_some()))
            .flatten();

        // Decoders come first; a stream whose decoder cannot be built is dropped.
        let audio_decoder = audio_stream.and_then(|(s, params)| match container.audio_decoder(s.id) {
            Ok(decoder) => Some((s, params, decoder)),
            Err(e) => {
                tracing::warn!("{}: audio stream {} unusable: {}", name, s.id, e);
                None
            }
        });
        let preferred = self.config.resolved_decoder();
        let video_decoder = video_stream.and_then(|s| match container.video_decoder(s.id, &preferred) {
            Ok(decoder) => Some((s, decoder)),
            Err(e) => {
                tracing::warn!("{}: video stream {} unusable: {}", name, s.id, e);
                None
            }
        });

        if audio_decoder.is_none() && video_decoder.is_none() {
            return Err(MediaError::open(format!(
                "{}: no usable {:?} stream among {} stream(s)",
                name,
                self.kind,
                streams.len()
            )));
        }

        let mut gate = DemuxGate::new(container);
        let audio_queue = audio_decoder.as_ref().map(|(s, _, _)| {
            let queue = Arc::new(PacketQueue::new());
            gate.register(s.id, queue.clone());
            queue
        });
        let video_queue = video_decoder.as_ref().map(|(s, _)| {
            let queue = Arc::new(PacketQueue::new());
            gate.register(s.id, queue.clone());
            queue
        });
        let gate = Arc::new(gate);

        let audio = audio_decoder.zip(audio_queue).map(|((stream, params, decoder), queue)| {
            let track = AudioTrack::new(TrackCore::new(stream.id, queue, gate.clone()), decoder, params, &self.config);
            track.set_volume(self.volume);
            Arc::new(track)
        });

        let target = surface.as_ref().and_then(|s| s.size());
        let video = video_decoder.zip(video_queue).map(|((stream, decoder), queue)| {
            VideoTrack::new(
                TrackCore::new(stream.id, queue, gate.clone()),
                stream,
                decoder,
                Box::new(SoftwareConverter::new()),
                self.clock.clone(),
                &self.config,
                target,
            )
        });

        let aspect_ratio = video_stream
            .and_then(|s| s.video)
            .map(|v| {
                let sar = if v.sample_aspect.num == 0 || v.sample_aspect.den == 0 {
                    Rational::ONE
                } else {
                    v.sample_aspect
                };
                let num = v.width as f64 * sar.num as f64;
                let den = v.height as f64 * sar.den as f64;
                if den > 0.0 { (num / den) as f32 } else { 1.0 }
            })
            .filter(|_| video.is_some())
            .unwrap_or(1.0);

        let duration = gate
            .duration()
            .or_else(|| streams.iter().filter_map(StreamInfo::duration).max())
            .unwrap_or(Duration::ZERO);

        let multiframe = video.is_some()
            && video_stream
                .and_then(|s| s.frame_count)
                .map_or(true, |frames| frames > 1);

        let mut surface = surface;
        if let (Some(video), Some(surface)) = (&video, surface.as_mut()) {
            if video.preload() {
                video.tick(surface.as_mut());
            } else {
                tracing::debug!("{}: nothing to preload", name);
            }
        }

        tracing::info!(
            "Opened {} ({}{}), duration {:?}, aspect {:.3}",
            name,
            if audio.is_some() { "audio" } else { "" },
            match (&audio, &video) {
                (Some(_), Some(v)) => format!(" + video/{}", v.decoder_name()),
                (None, Some(v)) => format!("video/{}", v.decoder_name()),
                _ => String::new(),
            },
            duration,
            aspect_ratio
        );

        self.clock.reset();
        self.media = Some(OpenMedia {
            name: name.to_string(),
            gate,
            audio,
            video,
            surface,
            aspect_ratio,
            duration,
            multiframe,
        });
        self.state = SessionState::Stopped;
        Ok(())
    }

    pub fn play(&mut self) -> Result<()> {
        let Some(media) = &self.media else {
            return Ok(());
        };
        if self.state == SessionState::Playing {
            return Ok(());
        }
        if let Err(e) = start_tracks(media) {
            return Err(self.abort(e));
        }
        tracing::debug!("Playing {}", media.name);
        self.clock.start();
        self.state = SessionState::Playing;
        Ok(())
    }

    /// Freeze playback where it is. `play` resumes.
    pub fn pause(&mut self) {
        let Some(media) = &self.media else {
            return;
        };
        if self.state != SessionState::Playing {
            return;
        }
        if let Some(audio) = &media.audio {
            audio.pause();
        }
        if let Some(video) = &media.video {
            video.halt();
        }
        self.clock.pause();
        self.state = SessionState::Paused;
    }

    /// Stop and rewind to the beginning.
    pub fn stop(&mut self) {
        if self.media.is_none() {
            return;
        }
        if let Err(e) = self.reposition(Duration::ZERO, false) {
            tracing::warn!("Rewind failed: {}", e);
        }
        self.clock.reset();
        self.state = SessionState::Stopped;
    }

    /// Coarse seek. Playback continues from the new position if it was
    /// running.
    pub fn seek(&mut self, position: Duration) -> Result<()> {
        let Some(media) = &self.media else {
            return Err(MediaError::resource("Seek with no media open"));
        };
        let position = if media.duration > Duration::ZERO {
            position.min(media.duration)
        } else {
            position
        };
        let resume = self.state == SessionState::Playing;
        self.reposition(position, resume)
    }

    fn reposition(&mut self, position: Duration, resume: bool) -> Result<()> {
        let Some(media) = &self.media else {
            return Ok(());
        };
        // Silence the audio pull path before touching the gate
        if let Some(audio) = &media.audio {
            audio.reset_to(position);
        }
        if let Some(video) = &media.video {
            video.stop();
        }
        let restarted = media.gate.seek(position).and_then(|()| {
            self.clock.set(position);
            if resume {
                start_tracks(media)
            } else {
                Ok(())
            }
        });
        if let Err(e) = restarted {
            return Err(self.abort(e));
        }

        if !resume && self.state == SessionState::Playing {
            self.clock.pause();
            self.state = SessionState::Paused;
        }
        Ok(())
    }

    /// Tracks are already halted. Freeze the clock and remember why.
    fn abort(&mut self, err: MediaError) -> MediaError {
        self.clock.pause();
        self.state = SessionState::Stopped;
        tracing::error!(
            "{}: playback stopped: {}",
            self.media.as_ref().map_or("", |m| m.name.as_str()),
            err
        );
        self.error = Some(err.clone());
        err
    }

    /// Stop every track, join the video thread and release the container.
    /// Safe to call repeatedly.
    pub fn close(&mut self) {
        let Some(media) = self.media.take() else {
            return;
        };
        for track in media.tracks() {
            track.stop();
        }
        media.gate.close();
        self.clock.reset();
        self.state = SessionState::Closed;
        self.error = None;
        tracing::debug!("Closed {}", media.name);
    }

    /// Copy the newest decoded frame to the display surface. Returns whether
    /// the surface changed. A looping session that ran out is rewound here.
    pub fn tick(&mut self) -> bool {
        if self.looping && self.state == SessionState::Playing && self.is_finished() {
            tracing::debug!("Looping back to start");
            if let Err(e) = self.reposition(Duration::ZERO, true) {
                tracing::warn!("Loop rewind failed: {}", e);
            }
        }
        let Some(media) = self.media.as_mut() else {
            return false;
        };
        match (&media.video, media.surface.as_mut()) {
            (Some(video), Some(surface)) => video.tick(surface.as_mut()),
            _ => false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.media.is_some()
    }

    /// Playback position on the session clock.
    pub fn get_video_time(&self) -> Duration {
        match &self.media {
            Some(media) if media.duration > Duration::ZERO => self.clock.now().min(media.duration),
            Some(_) => self.clock.now(),
            None => Duration::ZERO,
        }
    }

    pub fn get_duration(&self) -> Duration {
        self.media.as_ref().map_or(Duration::ZERO, |m| m.duration)
    }

    pub fn get_aspect_ratio(&self) -> f32 {
        self.media.as_ref().map_or(1.0, |m| m.aspect_ratio)
    }

    /// Video with more than one frame (not a still image).
    pub fn is_multiframe(&self) -> bool {
        self.media.as_ref().map_or(false, |m| m.multiframe)
    }

    pub fn get_metadata(&self, tag: &str) -> Option<String> {
        self.media.as_ref().and_then(|m| m.gate.metadata(tag))
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = if volume.is_nan() { 1.0 } else { volume.clamp(0.0, 1.0) };
        if let Some(audio) = self.media.as_ref().and_then(|m| m.audio.as_ref()) {
            audio.set_volume(self.volume);
        }
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Restart from the beginning whenever every track runs out. Kept across
    /// `open`.
    pub fn set_loop(&mut self, looping: bool) {
        self.looping = looping;
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    pub fn is_playing(&self) -> bool {
        self.state == SessionState::Playing && self.clock.is_running() && !self.is_finished()
    }

    /// Every track has delivered everything it had.
    pub fn is_finished(&self) -> bool {
        let Some(media) = &self.media else {
            return false;
        };
        let audio_done = media.audio.as_ref().map_or(true, |a| a.is_finished());
        let video_done = media.video.as_ref().map_or(true, |v| v.at_end() && !v.is_running());
        audio_done && video_done
    }

    pub fn has_audio(&self) -> bool {
        self.media.as_ref().map_or(false, |m| m.audio.is_some())
    }

    pub fn has_video(&self) -> bool {
        self.media.as_ref().map_or(false, |m| m.video.is_some())
    }

    /// Handle for the audio sink. `None` without an audio track.
    pub fn audio_source(&self) -> Option<AudioSource> {
        self.media
            .as_ref()
            .and_then(|m| m.audio.clone())
            .map(AudioSource::new)
    }

    pub fn video_stats(&self) -> Option<VideoStats> {
        self.media.as_ref().and_then(|m| m.video.as_ref()).map(|v| v.stats())
    }

    /// Decoder the video track is using.
    pub fn video_decoder(&self) -> Option<String> {
        self.media
            .as_ref()
            .and_then(|m| m.video.as_ref())
            .map(|v| v.decoder_name().to_string())
    }

    /// Most recent fatal error: a failed play or seek, or a track that hit one.
    pub fn last_error(&self) -> Option<MediaError> {
        self.error.clone().or_else(|| {
            self.media
                .as_ref()
                .and_then(|m| m.tracks().find_map(|t| t.last_error()))
        })
    }

    /// Decoders the backend accepts as a preference.
    pub fn decoders(&self) -> Vec<String> {
        self.backend.decoders()
    }

    pub fn is_supported_media_file(&self, name: &str) -> bool {
        self.backend.is_supported(name)
    }
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        self.close();
    }
}
