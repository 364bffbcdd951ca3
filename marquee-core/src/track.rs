//! Shared track plumbing: the per-stream queue, end/behind flags and decode
//! error accounting used by both the audio and the video track.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{Packet, StreamKind};
use crate::demux::DemuxGate;
use crate::error::MediaError;
use crate::packet_queue::PacketQueue;

/// Capability common to audio and video tracks.
pub trait Track: Send + Sync {
    fn stream_id(&self) -> u32;

    fn kind(&self) -> StreamKind;

    /// Halt the track and drop everything queued for it.
    fn stop(&self);

    /// Nothing more will come out of this track until it is stopped.
    fn at_end(&self) -> bool;

    /// Decode is lagging the playback clock.
    fn is_behind(&self) -> bool;

    fn last_error(&self) -> Option<MediaError>;
}

pub struct TrackCore {
    stream_id: u32,
    queue: Arc<PacketQueue>,
    gate: Arc<DemuxGate>,
    at_end: AtomicBool,
    far_behind: AtomicBool,
    error: Mutex<Option<MediaError>>,
}

impl TrackCore {
    /// `queue` must already be registered with `gate` for `stream_id`.
    pub fn new(stream_id: u32, queue: Arc<PacketQueue>, gate: Arc<DemuxGate>) -> Self {
        Self {
            stream_id,
            queue,
            gate,
            at_end: AtomicBool::new(false),
            far_behind: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Next packet for this stream, reading through the gate while our queue
    /// is empty. `None` once the container is exhausted.
    pub fn next_packet(&self) -> Option<Packet> {
        loop {
            if let Some(packet) = self.queue.pop() {
                return Some(packet);
            }
            if !self.gate.read_next_packet() {
                // Another track's read may have routed our last packet
                return self.queue.pop();
            }
        }
    }

    pub fn clear_queue(&self) -> usize {
        self.queue.clear()
    }

    pub fn at_end(&self) -> bool {
        self.at_end.load(Ordering::Acquire)
    }

    pub fn set_at_end(&self, value: bool) {
        self.at_end.store(value, Ordering::Release);
    }

    pub fn is_behind(&self) -> bool {
        self.far_behind.load(Ordering::Relaxed)
    }

    pub fn set_behind(&self, value: bool) {
        self.far_behind.store(value, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: MediaError) {
        tracing::warn!("Stream {}: {}", self.stream_id, err);
        *self.error.lock() = Some(err);
    }

    pub fn last_error(&self) -> Option<MediaError> {
        self.error.lock().clone()
    }

    /// Back to the just-opened state. The caller clears decoder state.
    pub fn reset(&self) {
        self.queue.clear();
        self.set_at_end(false);
        self.set_behind(false);
    }
}

/// Counts decode failures in a row and decides when a stream is beyond
/// recovery.
#[derive(Debug, Clone)]
pub(crate) struct ErrorRun {
    limit: u32,
    count: u32,
    total: u64,
}

impl ErrorRun {
    pub(crate) fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            count: 0,
            total: 0,
        }
    }

    pub(crate) fn success(&mut self) {
        self.count = 0;
    }

    /// Note one failure. Returns `StreamCorrupted` once the run reaches the
    /// limit.
    pub(crate) fn failure(&mut self, stream_id: u32, err: &MediaError) -> Option<MediaError> {
        self.count += 1;
        self.total += 1;
        tracing::debug!(
            "Stream {}: skipping packet ({} in a row): {}",
            stream_id,
            self.count,
            err
        );
        (self.count >= self.limit).then(|| MediaError::StreamCorrupted {
            stream_id,
            failures: self.count,
        })
    }

    pub(crate) fn total(&self) -> u64 {
        self.total
    }

    pub(crate) fn reset(&mut self) {
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AudioDecoder, Container, Rational, StreamInfo, VideoDecoder};
    use crate::error::Result;
    use std::time::Duration;

    /// Two streams, packets alternate 0, 1, 0, 1...
    struct Alternating {
        streams: Vec<StreamInfo>,
        left: u32,
        next: u32,
    }

    impl Container for Alternating {
        fn streams(&self) -> &[StreamInfo] {
            &self.streams
        }

        fn read_packet(&mut self) -> Result<Option<Packet>> {
            if self.left == 0 {
                return Ok(None);
            }
            self.left -= 1;
            let id = self.next % 2;
            self.next += 1;
            Ok(Some(Packet {
                stream_id: id,
                pts: Some(self.next as i64),
                duration: 1,
                keyframe: true,
                data: Vec::new(),
            }))
        }

        fn seek(&mut self, _position: Duration) -> Result<()> {
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
            Err(MediaError::open("unused"))
        }
    }

    fn stream(id: u32, kind: StreamKind) -> StreamInfo {
        StreamInfo {
            id,
            kind,
            codec: "test".into(),
            time_base: Rational::ONE,
            duration: None,
            frame_count: None,
            video: None,
            audio: None,
        }
    }

    #[test]
    fn test_next_packet_reads_through_gate() {
        let container = Alternating {
            streams: vec![stream(0, StreamKind::Video), stream(1, StreamKind::Audio)],
            left: 6,
            next: 0,
        };
        let video_q = Arc::new(PacketQueue::new());
        let audio_q = Arc::new(PacketQueue::new());
        let mut gate = DemuxGate::new(Box::new(container));
        gate.register(0, video_q.clone());
        gate.register(1, audio_q.clone());
        let gate = Arc::new(gate);

        let audio = TrackCore::new(1, audio_q.clone(), gate.clone());
        // Reading audio routes the interleaved video packet to the other queue
        assert!(audio.next_packet().is_some());
        assert_eq!(video_q.len(), 1);

        let mut count = 1;
        while audio.next_packet().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
        assert_eq!(video_q.len(), 3);
        assert!(gate.is_at_end());
    }

    #[test]
    fn test_error_run_escalates() {
        let mut run = ErrorRun::new(3);
        let err = MediaError::decode("bad");
        assert!(run.failure(7, &err).is_none());
        assert!(run.failure(7, &err).is_none());
        run.success();
        assert!(run.failure(7, &err).is_none());
        assert!(run.failure(7, &err).is_none());
        assert_eq!(
            run.failure(7, &err),
            Some(MediaError::StreamCorrupted { stream_id: 7, failures: 3 })
        );
        assert_eq!(run.total(), 5);
    }
}
