//! Double-buffered hand-off of converted frames from the decode thread to the
//! display path.
//!
//! ```text
//! decode thread                         display thread
//! convert into spare ──publish()──►  [ slot: Arc<PixelBuffer>, gen ]  ──latest_since()──► copy
//!        ▲                                  │
//!        └──────── previous buffer ◄────────┘
//! ```
//!
//! Only the `Arc` handle is swapped under the lock. The decode thread converts
//! outside it and the display path copies outside it, so neither blocks the
//! other for a full frame. A returned spare is only written again once the
//! display side has let go of it (`Arc::get_mut`).

use std::sync::Arc;

use parking_lot::Mutex;

use crate::surface::PixelBuffer;

#[derive(Default)]
struct Published {
    frame: Option<Arc<PixelBuffer>>,
    generation: u64,
}

#[derive(Default)]
pub struct FrameSlot {
    inner: Mutex<Published>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `frame` the visible one. Returns the buffer it replaced so the
    /// caller can reuse it.
    pub fn publish(&self, frame: Arc<PixelBuffer>) -> Option<Arc<PixelBuffer>> {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.frame.replace(frame)
    }

    /// The current frame if it was published after generation `seen`.
    pub fn latest_since(&self, seen: u64) -> Option<(u64, Arc<PixelBuffer>)> {
        let inner = self.inner.lock();
        if inner.generation == seen {
            return None;
        }
        inner.frame.as_ref().map(|f| (inner.generation, f.clone()))
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Take a buffer to convert into: `spare` when nobody else holds it,
    /// otherwise a fresh allocation.
    pub fn recycle(spare: Option<Arc<PixelBuffer>>, width: u32, height: u32) -> Arc<PixelBuffer> {
        if let Some(mut buf) = spare {
            if let Some(inner) = Arc::get_mut(&mut buf) {
                inner.resize(width, height);
                return buf;
            }
        }
        Arc::new(PixelBuffer::new(width, height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn filled(serial: u64) -> Arc<PixelBuffer> {
        let mut buf = PixelBuffer::new(16, 16);
        buf.serial = serial;
        buf.data.fill((serial % 251) as u8);
        Arc::new(buf)
    }

    #[test]
    fn test_latest_since() {
        let slot = FrameSlot::new();
        assert!(slot.latest_since(0).is_none());

        assert!(slot.publish(filled(1)).is_none());
        let (gen, frame) = slot.latest_since(0).unwrap();
        assert_eq!(frame.serial, 1);
        assert!(slot.latest_since(gen).is_none());

        let previous = slot.publish(filled(2)).unwrap();
        assert_eq!(previous.serial, 1);
        assert_eq!(slot.latest_since(gen).unwrap().1.serial, 2);
    }

    #[test]
    fn test_recycle_respects_readers() {
        let buf = filled(1);
        let reader = buf.clone();
        let fresh = FrameSlot::recycle(Some(buf), 16, 16);
        assert!(!Arc::ptr_eq(&fresh, &reader));

        let lone = filled(2);
        let ptr = Arc::as_ptr(&lone);
        let reused = FrameSlot::recycle(Some(lone), 8, 8);
        assert_eq!(Arc::as_ptr(&reused), ptr);
        assert_eq!(reused.data.len(), 8 * 8 * 4);

        let blank = FrameSlot::recycle(None, 4, 2);
        assert_eq!((blank.width, blank.height), (4, 2));
        assert_eq!(blank.data.len(), 4 * 2 * 4);
    }

    #[test]
    fn test_reader_never_sees_partial_frame() {
        let slot = Arc::new(FrameSlot::new());
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let slot = slot.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut spare = None;
                for serial in 1..=2_000u64 {
                    let mut buf = FrameSlot::recycle(spare.take(), 16, 16);
                    let inner = Arc::get_mut(&mut buf).expect("recycled buffer is unique");
                    // Write byte by byte so a torn read would be visible
                    for byte in inner.data.iter_mut() {
                        *byte = (serial % 251) as u8;
                    }
                    inner.serial = serial;
                    spare = slot.publish(buf);
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let mut seen = 0;
        let mut last_serial = 0;
        while !done.load(Ordering::SeqCst) {
            if let Some((gen, frame)) = slot.latest_since(seen) {
                seen = gen;
                let expected = (frame.serial % 251) as u8;
                assert!(frame.data.iter().all(|b| *b == expected));
                assert!(frame.serial >= last_serial);
                last_serial = frame.serial;
            }
        }
        writer.join().unwrap();
        assert_eq!(slot.latest_since(0).unwrap().1.serial, 2_000);
    }
}
