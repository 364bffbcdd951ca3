//! # Video Track
//!
//! Decodes on a dedicated thread, paced to the shared [`PlaybackClock`], and
//! publishes converted frames into a [`FrameSlot`]. The display path picks up
//! the newest frame with [`VideoTrack::tick`] at whatever rate it renders.
//!
//! ```text
//!  gate ─► queue ─► decode ─► transfer ─► convert ─► wait for pts ─► publish
//!                     ▲                                                 │
//!                     └──────────────── loop while running ◄───────────┘
//! ```
//!
//! Late frames are shown immediately without waiting and are never dropped;
//! the track reports itself as behind until a frame is on time again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::backend::{ColorConverter, RawVideoFrame, Rational, StreamInfo, StreamKind, VideoDecoder};
use crate::clock::PlaybackClock;
use crate::config::MediaConfig;
use crate::error::{MediaError, Result};
use crate::frame_slot::FrameSlot;
use crate::surface::{DisplaySurface, PixelBuffer};
use crate::track::{ErrorRun, Track, TrackCore};

const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_micros(33_333);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VideoStats {
    pub frames_presented: u64,
    /// Presented more than one frame interval after their time
    pub frames_late: u64,
    pub last_lag_us: u64,
    pub decode_errors: u64,
}

/// Decoder-side state. Owned by the decode thread while it runs.
struct VideoWorker {
    decoder: Box<dyn VideoDecoder>,
    converter: Box<dyn ColorConverter>,
    /// Decoded frames not yet converted
    pending: VecDeque<RawVideoFrame>,
    /// Converted frame that was waiting when the thread was halted
    staged: Option<Arc<PixelBuffer>>,
    spare: Option<Arc<PixelBuffer>>,
    errors: ErrorRun,
    target: Option<(u32, u32)>,
    next_serial: u64,
    last_pts: Option<Duration>,
    flushed: bool,
}

struct VideoShared {
    core: TrackCore,
    clock: Arc<PlaybackClock>,
    slot: FrameSlot,
    run: AtomicBool,
    worker: Mutex<VideoWorker>,
    time_base: Rational,
    frame_interval: Duration,
    max_sleep: Duration,
    stats: Mutex<VideoStats>,
}

pub struct VideoTrack {
    shared: Arc<VideoShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    /// Slot generation last copied out by `tick`
    seen: AtomicU64,
    decoder_name: String,
}

impl VideoTrack {
    /// `target` is the display size frames are converted to; `None` keeps
    /// the coded size.
    pub fn new(
        core: TrackCore,
        stream: &StreamInfo,
        decoder: Box<dyn VideoDecoder>,
        converter: Box<dyn ColorConverter>,
        clock: Arc<PlaybackClock>,
        config: &MediaConfig,
        target: Option<(u32, u32)>,
    ) -> Self {
        let frame_interval = stream
            .video
            .map(|v| v.frame_rate)
            .filter(|r| r.num > 0 && r.den > 0)
            .map(|r| Duration::from_secs_f64(r.den as f64 / r.num as f64))
            .unwrap_or(DEFAULT_FRAME_INTERVAL);

        let decoder_name = decoder.name().to_string();
        tracing::info!(
            "Video stream {}: {} via {}, frame interval {:?}",
            stream.id,
            stream.codec,
            decoder_name,
            frame_interval
        );

        Self {
            shared: Arc::new(VideoShared {
                core,
                clock,
                slot: FrameSlot::new(),
                run: AtomicBool::new(false),
                worker: Mutex::new(VideoWorker {
                    decoder,
                    converter,
                    pending: VecDeque::new(),
                    staged: None,
                    spare: None,
                    errors: ErrorRun::new(config.max_consecutive_decode_errors),
                    target,
                    next_serial: 1,
                    last_pts: None,
                    flushed: false,
                }),
                time_base: stream.time_base,
                frame_interval,
                max_sleep: config.max_sleep(),
                stats: Mutex::new(VideoStats::default()),
            }),
            thread: Mutex::new(None),
            seen: AtomicU64::new(0),
            decoder_name,
        }
    }

    pub fn decoder_name(&self) -> &str {
        &self.decoder_name
    }

    /// Decode and publish the first frame so a surface has something to show
    /// before playback. Returns whether a frame was published.
    pub fn preload(&self) -> bool {
        if self.is_running() {
            return false;
        }
        let mut worker = self.shared.worker.lock();
        match self.shared.next_frame(&mut worker) {
            Some(frame) => {
                tracing::debug!("Preloaded frame {} at {:?}", frame.serial, frame.pts);
                worker.spare = self.shared.slot.publish(frame);
                true
            }
            None => false,
        }
    }

    /// Start the decode thread. No-op while running or once drained.
    pub fn play(&self) -> Result<()> {
        let mut running = self.thread.lock();
        if self.shared.run.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(done) = running.take() {
            // Exited on its own at end of stream, or died
            if done.join().is_err() {
                tracing::error!("Video thread for stream {} panicked", self.shared.core.stream_id());
            }
        }
        if self.shared.core.at_end() {
            return Ok(());
        }

        self.shared.run.store(true, Ordering::Release);
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("marquee-video-{}", self.shared.core.stream_id()))
            .spawn(move || shared.run_loop())
            .map_err(|e| {
                self.shared.run.store(false, Ordering::Release);
                MediaError::resource(format!("Failed to spawn video thread: {}", e))
            })?;
        *running = Some(handle);
        Ok(())
    }

    /// Stop the decode thread, keeping decoder position and queued packets.
    pub fn halt(&self) {
        self.shared.run.store(false, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Video thread for stream {} panicked", self.shared.core.stream_id());
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.run.load(Ordering::Acquire)
    }

    /// Copy the newest frame into `surface` if one arrived since the last
    /// call. Never blocks on decode.
    pub fn tick(&self, surface: &mut dyn DisplaySurface) -> bool {
        let seen = self.seen.load(Ordering::Acquire);
        let Some((generation, frame)) = self.shared.slot.latest_since(seen) else {
            return false;
        };
        self.seen.store(generation, Ordering::Release);
        surface.update(&frame);
        true
    }

    pub fn stats(&self) -> VideoStats {
        *self.shared.stats.lock()
    }
}

impl Track for VideoTrack {
    fn stream_id(&self) -> u32 {
        self.shared.core.stream_id()
    }

    fn kind(&self) -> StreamKind {
        StreamKind::Video
    }

    fn stop(&self) {
        self.halt();
        let mut worker = self.shared.worker.lock();
        worker.decoder.reset();
        worker.pending.clear();
        worker.staged = None;
        worker.errors.reset();
        worker.last_pts = None;
        worker.flushed = false;
        self.shared.core.reset();
    }

    fn at_end(&self) -> bool {
        self.shared.core.at_end()
    }

    fn is_behind(&self) -> bool {
        self.shared.core.is_behind()
    }

    fn last_error(&self) -> Option<MediaError> {
        self.shared.core.last_error()
    }
}

impl Drop for VideoTrack {
    fn drop(&mut self) {
        self.halt();
    }
}

/// Clears the run flag however the decode loop exits, unwinding included.
struct RunFlag<'a>(&'a AtomicBool);

impl Drop for RunFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl VideoShared {
    fn run_loop(&self) {
        let _running = RunFlag(&self.run);
        let mut worker = self.worker.lock();
        tracing::debug!("Video thread for stream {} started", self.core.stream_id());

        while self.run.load(Ordering::Acquire) {
            let Some(frame) = self.next_frame(&mut worker) else {
                break;
            };
            if !self.wait_until(frame.pts) {
                // Halted while waiting; present this frame first on resume
                worker.staged = Some(frame);
                break;
            }
            worker.spare = self.slot.publish(frame);
            self.stats.lock().frames_presented += 1;
        }

        tracing::debug!(
            "Video thread for stream {} exiting (at end: {})",
            self.core.stream_id(),
            self.core.at_end()
        );
    }

    /// Next converted frame, or `None` once the stream is drained or
    /// corrupted (the end flag is set either way).
    fn next_frame(&self, worker: &mut VideoWorker) -> Option<Arc<PixelBuffer>> {
        if let Some(frame) = worker.staged.take() {
            return Some(frame);
        }

        loop {
            if let Some(raw) = worker.pending.pop_front() {
                match self.convert(worker, raw) {
                    Ok(frame) => return Some(frame),
                    Err(err) if err.is_fatal() => return self.give_up(err),
                    Err(err) => {
                        if let Some(fatal) = self.note_failure(worker, &err) {
                            return self.give_up(fatal);
                        }
                        continue;
                    }
                }
            }
            if worker.flushed {
                self.core.set_at_end(true);
                return None;
            }

            match self.core.next_packet() {
                Some(packet) => match worker.decoder.decode(&packet) {
                    Ok(frames) => {
                        worker.errors.success();
                        worker.pending.extend(frames);
                    }
                    Err(err) => {
                        if let Some(fatal) = self.note_failure(worker, &err) {
                            return self.give_up(fatal);
                        }
                    }
                },
                None => {
                    match worker.decoder.flush() {
                        Ok(frames) => worker.pending.extend(frames),
                        Err(err) => tracing::debug!("Decoder flush failed: {}", err),
                    }
                    worker.flushed = true;
                }
            }
        }
    }

    fn note_failure(&self, worker: &mut VideoWorker, err: &MediaError) -> Option<MediaError> {
        self.stats.lock().decode_errors += 1;
        worker.errors.failure(self.core.stream_id(), err)
    }

    fn give_up(&self, err: MediaError) -> Option<Arc<PixelBuffer>> {
        self.core.record_error(err);
        self.core.set_at_end(true);
        None
    }

    fn convert(&self, worker: &mut VideoWorker, raw: RawVideoFrame) -> Result<Arc<PixelBuffer>> {
        let raw = if raw.is_device_resident() {
            worker.decoder.transfer(raw)?
        } else {
            raw
        };

        let pts = match raw.pts {
            Some(ticks) => self.time_base.ticks_to_duration(ticks),
            None => worker
                .last_pts
                .map_or(Duration::ZERO, |last| last + self.frame_interval),
        };

        let (width, height) = worker.target.unwrap_or((raw.width, raw.height));
        let mut buffer = FrameSlot::recycle(worker.spare.take(), width, height);
        let pixels = Arc::get_mut(&mut buffer)
            .ok_or_else(|| MediaError::resource("Frame buffer still shared"))?;
        worker.converter.convert(&raw, pixels)?;
        pixels.serial = worker.next_serial;
        pixels.pts = pts;

        worker.next_serial += 1;
        worker.last_pts = Some(pts);
        Ok(buffer)
    }

    /// Sleep in bounded steps until the clock reaches `pts`. Returns `false`
    /// if the thread was told to stop meanwhile.
    fn wait_until(&self, pts: Duration) -> bool {
        loop {
            if !self.run.load(Ordering::Acquire) {
                return false;
            }
            let now = self.clock.now();
            if pts <= now {
                let lag = now - pts;
                let late = lag > self.frame_interval;
                if late && !self.core.is_behind() {
                    tracing::debug!("Video stream {} falling behind by {:?}", self.core.stream_id(), lag);
                }
                self.core.set_behind(late);

                let mut stats = self.stats.lock();
                stats.last_lag_us = lag.as_micros() as u64;
                if late {
                    stats.frames_late += 1;
                }
                return true;
            }
            self.core.set_behind(false);
            thread::sleep((pts - now).min(self.max_sleep));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        AudioDecoder, Container, FrameMemory, Packet, PixelFormat, SoftwareConverter, VideoParams,
    };
    use crate::demux::DemuxGate;
    use crate::packet_queue::PacketQueue;
    use crate::surface::MemorySurface;
    use std::time::Instant;

    /// Video-only container at 100 fps; payload = frame index, 0xFF = corrupt,
    /// 0xEE = crash the decoder.
    struct Frames {
        streams: Vec<StreamInfo>,
        next: u64,
        count: u64,
        corrupt_from: Option<u64>,
        panic_at: Option<u64>,
    }

    impl Frames {
        fn new(count: u64) -> Self {
            Self {
                streams: vec![stream_info()],
                next: 0,
                count,
                corrupt_from: None,
                panic_at: None,
            }
        }
    }

    fn stream_info() -> StreamInfo {
        StreamInfo {
            id: 0,
            kind: StreamKind::Video,
            codec: "test".into(),
            time_base: Rational::new(1, 100),
            duration: Some(0),
            frame_count: None,
            video: Some(VideoParams {
                width: 4,
                height: 4,
                sample_aspect: Rational::ONE,
                frame_rate: Rational::new(100, 1),
                pixel_format: PixelFormat::Rgba,
            }),
            audio: None,
        }
    }

    impl Container for Frames {
        fn streams(&self) -> &[StreamInfo] {
            &self.streams
        }

        fn read_packet(&mut self) -> Result<Option<Packet>> {
            if self.next >= self.count {
                return Ok(None);
            }
            let index = self.next;
            self.next += 1;
            let corrupt = self.corrupt_from.map_or(false, |from| index >= from);
            let data = if self.panic_at == Some(index) {
                vec![0xEE]
            } else if corrupt {
                vec![0xFF]
            } else {
                vec![index as u8]
            };
            Ok(Some(Packet {
                stream_id: 0,
                pts: Some(index as i64),
                duration: 1,
                keyframe: true,
                data,
            }))
        }

        fn seek(&mut self, _position: Duration) -> Result<()> {
            self.next = 0;
            Ok(())
        }

        fn duration(&self) -> Option<Duration> {
            None
        }

        fn metadata(&self, _tag: &str) -> Option<String> {
            None
        }

        fn audio_decoder(&self, _stream_id: u32) -> Result<Box<dyn AudioDecoder>> {
            Err(MediaError::open("unused"))
        }

        fn video_decoder(&self, _stream_id: u32, _preferred: &str) -> Result<Box<dyn VideoDecoder>> {
            Ok(Box::new(SolidDecoder))
        }
    }

    /// Solid 4x4 RGBA frames whose red channel is the frame index.
    struct SolidDecoder;

    impl VideoDecoder for SolidDecoder {
        fn name(&self) -> &str {
            "solid"
        }

        fn decode(&mut self, packet: &Packet) -> Result<Vec<RawVideoFrame>> {
            if packet.data == [0xFF] {
                return Err(MediaError::decode("corrupt"));
            }
            assert_ne!(packet.data, [0xEE], "decoder crashed");
            Ok(vec![RawVideoFrame {
                pts: packet.pts,
                width: 4,
                height: 4,
                format: PixelFormat::Rgba,
                memory: FrameMemory::Host([packet.data[0], 0, 0, 255].repeat(16)),
            }])
        }

        fn flush(&mut self) -> Result<Vec<RawVideoFrame>> {
            Ok(Vec::new())
        }

        fn reset(&mut self) {}
    }

    fn video_track(count: u64, corrupt_from: Option<u64>, clock: Arc<PlaybackClock>) -> (VideoTrack, Arc<DemuxGate>) {
        let container = Frames {
            corrupt_from,
            ..Frames::new(count)
        };
        track_over(container, clock)
    }

    fn track_over(container: Frames, clock: Arc<PlaybackClock>) -> (VideoTrack, Arc<DemuxGate>) {
        let decoder = container.video_decoder(0, "software").unwrap();
        let queue = Arc::new(PacketQueue::new());
        let mut gate = DemuxGate::new(Box::new(container));
        gate.register(0, queue.clone());
        let gate = Arc::new(gate);
        let config = MediaConfig {
            max_sleep_ms: 5,
            max_consecutive_decode_errors: 3,
            ..Default::default()
        };
        let track = VideoTrack::new(
            TrackCore::new(0, queue, gate.clone()),
            &stream_info(),
            decoder,
            Box::new(SoftwareConverter::new()),
            clock,
            &config,
            None,
        );
        (track, gate)
    }

    fn wait_for_end(track: &VideoTrack) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !track.at_end() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_preload_publishes_first_frame() {
        let clock = Arc::new(PlaybackClock::new());
        let (track, _gate) = video_track(10, None, clock);
        let mut surface = MemorySurface::native();

        assert!(track.preload());
        assert!(track.tick(&mut surface));
        assert!(!track.tick(&mut surface));
        let frame = surface.snapshot().unwrap();
        assert_eq!(frame.serial, 1);
        assert_eq!(frame.pixel(0, 0), Some([0, 0, 0, 255]));
    }

    #[test]
    fn test_plays_every_frame_in_order() {
        let clock = Arc::new(PlaybackClock::new());
        let (track, _gate) = video_track(20, None, clock.clone());
        let mut surface = MemorySurface::native();

        clock.start();
        track.play().unwrap();
        let mut last_serial = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while !track.at_end() && Instant::now() < deadline {
            if track.tick(&mut surface) {
                let serial = surface.last_serial().unwrap();
                assert!(serial > last_serial);
                last_serial = serial;
            }
            thread::sleep(Duration::from_millis(1));
        }
        track.tick(&mut surface);

        assert!(track.at_end());
        assert_eq!(track.stats().frames_presented, 20);
        assert_eq!(surface.last_serial(), Some(20));
        assert_eq!(surface.snapshot().unwrap().pixel(3, 3), Some([19, 0, 0, 255]));
    }

    #[test]
    fn test_paused_clock_holds_frames() {
        let clock = Arc::new(PlaybackClock::new());
        let (track, _gate) = video_track(20, None, clock);
        track.play().unwrap();
        thread::sleep(Duration::from_millis(60));
        track.halt();

        // Only frame 0 is due at t = 0
        assert_eq!(track.stats().frames_presented, 1);
        assert!(!track.at_end());
    }

    #[test]
    fn test_late_frames_are_shown_not_dropped() {
        let clock = Arc::new(PlaybackClock::new());
        clock.set(Duration::from_secs(10));
        let (track, _gate) = video_track(5, None, clock.clone());
        clock.start();
        track.play().unwrap();
        wait_for_end(&track);

        let stats = track.stats();
        assert_eq!(stats.frames_presented, 5);
        assert_eq!(stats.frames_late, 5);
        assert!(track.is_behind());
    }

    #[test]
    fn test_corrupted_stream_ends_with_error() {
        let clock = Arc::new(PlaybackClock::new());
        let (track, _gate) = video_track(50, Some(2), clock.clone());
        clock.start();
        track.play().unwrap();
        wait_for_end(&track);

        assert!(track.at_end());
        assert_eq!(track.stats().frames_presented, 2);
        assert_eq!(
            track.last_error(),
            Some(MediaError::StreamCorrupted { stream_id: 0, failures: 3 })
        );
    }

    #[test]
    fn test_stop_and_replay() {
        let clock = Arc::new(PlaybackClock::new());
        let (track, gate) = video_track(5, None, clock.clone());
        clock.start();
        track.play().unwrap();
        wait_for_end(&track);

        track.stop();
        gate.seek(Duration::ZERO).unwrap();
        clock.reset();
        assert!(!track.at_end());

        clock.start();
        track.play().unwrap();
        wait_for_end(&track);
        assert_eq!(track.stats().frames_presented, 10);
    }

    #[test]
    fn test_crashed_thread_does_not_wedge_play() {
        let clock = Arc::new(PlaybackClock::new());
        let container = Frames {
            panic_at: Some(2),
            ..Frames::new(6)
        };
        let (track, _gate) = track_over(container, clock.clone());
        clock.start();
        track.play().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while track.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(!track.is_running());
        assert!(!track.at_end());
        assert_eq!(track.stats().frames_presented, 2);

        // The dead thread is reaped and a fresh one picks up the next packet
        track.play().unwrap();
        wait_for_end(&track);
        track.halt();
        assert!(track.at_end());
        assert_eq!(track.stats().frames_presented, 5);
    }
}
