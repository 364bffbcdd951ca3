//! Playback clock shared by the session, the video decode thread and the
//! display path.
//!
//! Wall-clock driven: while running it advances with real time from the last
//! start; paused it holds its position.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct ClockState {
    /// Position accumulated before the current run
    offset: Duration,
    /// Start of the current run, `None` while paused
    started: Option<Instant>,
}

#[derive(Debug)]
pub struct PlaybackClock {
    state: Mutex<ClockState>,
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClockState {
                offset: Duration::ZERO,
                started: None,
            }),
        }
    }

    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.started.is_none() {
            state.started = Some(Instant::now());
        }
    }

    pub fn pause(&self) {
        let mut state = self.state.lock();
        if let Some(started) = state.started.take() {
            state.offset += started.elapsed();
        }
    }

    /// Stop and rewind to zero.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.offset = Duration::ZERO;
        state.started = None;
    }

    /// Jump to `position`, keeping the running/paused state.
    pub fn set(&self, position: Duration) {
        let mut state = self.state.lock();
        state.offset = position;
        if state.started.is_some() {
            state.started = Some(Instant::now());
        }
    }

    pub fn now(&self) -> Duration {
        let state = self.state.lock();
        match state.started {
            Some(started) => state.offset + started.elapsed(),
            None => state.offset,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().started.is_some()
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_paused_clock_holds() {
        let clock = PlaybackClock::new();
        assert_eq!(clock.now(), Duration::ZERO);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(clock.now(), Duration::ZERO);
        assert!(!clock.is_running());
    }

    #[test]
    fn test_start_pause_resume() {
        let clock = PlaybackClock::new();
        clock.start();
        thread::sleep(Duration::from_millis(20));
        clock.pause();
        let held = clock.now();
        assert!(held >= Duration::from_millis(20));

        thread::sleep(Duration::from_millis(10));
        assert_eq!(clock.now(), held);

        clock.start();
        thread::sleep(Duration::from_millis(5));
        assert!(clock.now() > held);
    }

    #[test]
    fn test_monotonic_while_running() {
        let clock = PlaybackClock::new();
        clock.start();
        let mut last = clock.now();
        for _ in 0..1_000 {
            let now = clock.now();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_set_and_reset() {
        let clock = PlaybackClock::new();
        clock.set(Duration::from_secs(5));
        assert_eq!(clock.now(), Duration::from_secs(5));

        clock.start();
        clock.set(Duration::from_secs(1));
        assert!(clock.now() >= Duration::from_secs(1));
        assert!(clock.now() < Duration::from_secs(2));

        clock.reset();
        assert_eq!(clock.now(), Duration::ZERO);
        assert!(!clock.is_running());
    }
}
