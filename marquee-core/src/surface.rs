//! Display-side types: the converted pixel buffer and the surface it is
//! copied into on the main thread.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Converted RGBA8 image plus the identity of the frame it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    /// Packed RGBA, `width * height * 4` bytes
    pub data: Vec<u8>,
    /// Monotonic per-track frame identity
    pub serial: u64,
    pub pts: Duration,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0u8; width as usize * height as usize * 4],
            serial: 0,
            pts: Duration::ZERO,
        }
    }

    /// Resize, keeping the allocation when it is already large enough.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.data.resize(width as usize * height as usize * 4, 0);
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 4;
        Some([self.data[idx], self.data[idx + 1], self.data[idx + 2], self.data[idx + 3]])
    }
}

/// Mutable pixel target owned by the embedding application (a texture,
/// a window buffer...). Only ever touched from the display thread.
pub trait DisplaySurface: Send {
    /// Size frames should be converted to; `None` keeps the coded size.
    fn size(&self) -> Option<(u32, u32)>;

    fn update(&mut self, frame: &PixelBuffer);
}

#[derive(Debug, Default)]
struct MemoryState {
    size: Option<(u32, u32)>,
    frame: Option<PixelBuffer>,
    updates: u64,
}

/// In-memory surface. Clones share the same image, so a caller can keep a
/// handle while the session owns the other one.
#[derive(Debug, Clone, Default)]
pub struct MemorySurface {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemorySurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryState {
                size: Some((width, height)),
                ..Default::default()
            })),
        }
    }

    /// Surface that accepts frames at their coded size.
    pub fn native() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> u64 {
        self.inner.lock().updates
    }

    pub fn last_serial(&self) -> Option<u64> {
        self.inner.lock().frame.as_ref().map(|f| f.serial)
    }

    pub fn snapshot(&self) -> Option<PixelBuffer> {
        self.inner.lock().frame.clone()
    }
}

impl DisplaySurface for MemorySurface {
    fn size(&self) -> Option<(u32, u32)> {
        self.inner.lock().size
    }

    fn update(&mut self, frame: &PixelBuffer) {
        let mut state = self.inner.lock();
        let image = state
            .frame
            .get_or_insert_with(|| PixelBuffer::new(frame.width, frame.height));
        image.resize(frame.width, frame.height);
        image.data.copy_from_slice(&frame.data);
        image.serial = frame.serial;
        image.pts = frame.pts;
        state.updates += 1;
    }
}
