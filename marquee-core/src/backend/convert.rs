// Color conversion into the RGBA display buffer.
//
// Decoders hand over I420 or NV12 (or already-packed RGBA). The converter
// turns them into RGBA8 at whatever size the display surface asks for,
// using nearest-neighbour sampling when the sizes differ.

use serde::{Deserialize, Serialize};

use super::{ColorConverter, PixelFormat, RawVideoFrame};
use crate::error::{MediaError, Result};
use crate::surface::PixelBuffer;

// ============================================================================
// Color Spaces
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorSpace {
    /// SD
    Bt601,
    /// HD
    Bt709,
}

impl ColorSpace {
    /// HD material is assumed BT.709, everything smaller BT.601.
    pub fn for_height(height: u32) -> Self {
        if height >= 720 {
            Self::Bt709
        } else {
            Self::Bt601
        }
    }

    /// (Wr, Wb); Wg = 1 - Wr - Wb
    fn coefficients(&self) -> (f32, f32) {
        match self {
            Self::Bt601 => (0.299, 0.114),
            Self::Bt709 => (0.2126, 0.0722),
        }
    }
}

/// Fixed-point lookup tables for one color space.
struct Tables {
    space: ColorSpace,
    y: [i32; 256],
    u_g: [i32; 256],
    u_b: [i32; 256],
    v_r: [i32; 256],
    v_g: [i32; 256],
}

impl Tables {
    fn build(space: ColorSpace) -> Self {
        let (wr, wb) = space.coefficients();
        let wg = 1.0 - wr - wb;
        let cr_r = 2.0 * (1.0 - wr);
        let cb_g = -2.0 * wb * (1.0 - wb) / wg;
        let cr_g = -2.0 * wr * (1.0 - wr) / wg;
        let cb_b = 2.0 * (1.0 - wb);

        let mut tables = Self {
            space,
            y: [0; 256],
            u_g: [0; 256],
            u_b: [0; 256],
            v_r: [0; 256],
            v_g: [0; 256],
        };
        for i in 0..256 {
            let y = i as i32 - 16;
            let uv = i as f32 - 128.0;
            // Studio range 16-235 stretched to 0-255
            tables.y[i] = (y * 298) >> 8;
            tables.u_g[i] = (uv * cb_g) as i32;
            tables.u_b[i] = (uv * cb_b) as i32;
            tables.v_r[i] = (uv * cr_r) as i32;
            tables.v_g[i] = (uv * cr_g) as i32;
        }
        tables
    }

    #[inline]
    fn rgba(&self, y: u8, u: u8, v: u8) -> [u8; 4] {
        let luma = self.y[y as usize];
        let (u, v) = (u as usize, v as usize);
        [
            (luma + self.v_r[v]).clamp(0, 255) as u8,
            (luma + self.u_g[u] + self.v_g[v]).clamp(0, 255) as u8,
            (luma + self.u_b[u]).clamp(0, 255) as u8,
            255,
        ]
    }
}

// ============================================================================
// Converter
// ============================================================================

/// CPU converter. Tables are rebuilt only when the color space changes.
pub struct SoftwareConverter {
    tables: Tables,
    /// Forced color space; `None` picks per frame from its height
    forced: Option<ColorSpace>,
}

impl SoftwareConverter {
    pub fn new() -> Self {
        Self {
            tables: Tables::build(ColorSpace::Bt601),
            forced: None,
        }
    }

    pub fn with_color_space(space: ColorSpace) -> Self {
        Self {
            tables: Tables::build(space),
            forced: Some(space),
        }
    }

    fn tables_for(&mut self, height: u32) -> &Tables {
        let space = self.forced.unwrap_or_else(|| ColorSpace::for_height(height));
        if self.tables.space != space {
            self.tables = Tables::build(space);
        }
        &self.tables
    }
}

impl Default for SoftwareConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl ColorConverter for SoftwareConverter {
    fn convert(&mut self, frame: &RawVideoFrame, dst: &mut PixelBuffer) -> Result<()> {
        let src = frame.host_data().ok_or_else(|| {
            MediaError::resource("Device-resident frame reached the software converter")
        })?;
        let (sw, sh) = (frame.width as usize, frame.height as usize);
        let needed = frame.format.buffer_size(frame.width, frame.height);
        if sw == 0 || sh == 0 || src.len() < needed {
            return Err(MediaError::decode(format!(
                "Frame buffer too small: {} bytes for {}x{} {:?}",
                src.len(),
                sw,
                sh,
                frame.format
            )));
        }
        let (dw, dh) = (dst.width as usize, dst.height as usize);
        if dst.data.len() != dw * dh * 4 {
            return Err(MediaError::resource("Display buffer size does not match its dimensions"));
        }

        let format = frame.format;
        let tables = self.tables_for(frame.height);

        let y_size = sw * sh;
        let cw = (sw + 1) / 2;
        let ch = (sh + 1) / 2;

        for dy in 0..dh {
            let sy = dy * sh / dh;
            let row = &mut dst.data[dy * dw * 4..(dy + 1) * dw * 4];
            for dx in 0..dw {
                let sx = dx * sw / dw;
                let px = match format {
                    PixelFormat::I420 => {
                        let c = (sy / 2) * cw + sx / 2;
                        tables.rgba(src[sy * sw + sx], src[y_size + c], src[y_size + cw * ch + c])
                    }
                    PixelFormat::Nv12 => {
                        let c = y_size + ((sy / 2) * cw + sx / 2) * 2;
                        tables.rgba(src[sy * sw + sx], src[c], src[c + 1])
                    }
                    PixelFormat::Rgba => {
                        let i = (sy * sw + sx) * 4;
                        [src[i], src[i + 1], src[i + 2], src[i + 3]]
                    }
                };
                row[dx * 4..dx * 4 + 4].copy_from_slice(&px);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceSurface, FrameMemory};

    fn frame(format: PixelFormat, width: u32, height: u32, data: Vec<u8>) -> RawVideoFrame {
        RawVideoFrame {
            pts: Some(0),
            width,
            height,
            format,
            memory: FrameMemory::Host(data),
        }
    }

    fn i420(width: u32, height: u32, y: u8, u: u8, v: u8) -> RawVideoFrame {
        let luma = (width * height) as usize;
        let chroma = (((width + 1) / 2) * ((height + 1) / 2)) as usize;
        let mut data = vec![y; luma];
        data.extend(std::iter::repeat(u).take(chroma));
        data.extend(std::iter::repeat(v).take(chroma));
        frame(PixelFormat::I420, width, height, data)
    }

    #[test]
    fn test_studio_range_black_and_white() {
        let mut conv = SoftwareConverter::new();
        let mut dst = PixelBuffer::new(4, 4);

        conv.convert(&i420(4, 4, 16, 128, 128), &mut dst).unwrap();
        assert_eq!(dst.pixel(0, 0), Some([0, 0, 0, 255]));

        conv.convert(&i420(4, 4, 235, 128, 128), &mut dst).unwrap();
        let white = dst.pixel(3, 3).unwrap();
        assert!(white[..3].iter().all(|c| *c >= 254), "{:?}", white);
    }

    #[test]
    fn test_red_chroma_dominates() {
        let mut conv = SoftwareConverter::new();
        let mut dst = PixelBuffer::new(2, 2);
        conv.convert(&i420(2, 2, 81, 90, 240), &mut dst).unwrap();
        let [r, g, b, _] = dst.pixel(0, 0).unwrap();
        assert!(r > 200, "r = {}", r);
        assert!(g < 60 && b < 60, "g = {}, b = {}", g, b);
    }

    #[test]
    fn test_nv12_matches_i420() {
        let mut conv = SoftwareConverter::new();
        let mut a = PixelBuffer::new(4, 2);
        let mut b = PixelBuffer::new(4, 2);

        conv.convert(&i420(4, 2, 100, 60, 200), &mut a).unwrap();
        let mut nv12 = vec![100u8; 8];
        nv12.extend([60, 200, 60, 200]);
        conv.convert(&frame(PixelFormat::Nv12, 4, 2, nv12), &mut b).unwrap();
        assert_eq!(a.data, b.data);
    }

    #[test]
    fn test_nearest_neighbour_scaling() {
        let mut conv = SoftwareConverter::new();
        let src = frame(
            PixelFormat::Rgba,
            2,
            1,
            vec![10, 20, 30, 255, 40, 50, 60, 255],
        );
        let mut dst = PixelBuffer::new(4, 2);
        conv.convert(&src, &mut dst).unwrap();
        assert_eq!(dst.pixel(0, 0), Some([10, 20, 30, 255]));
        assert_eq!(dst.pixel(1, 1), Some([10, 20, 30, 255]));
        assert_eq!(dst.pixel(2, 0), Some([40, 50, 60, 255]));
        assert_eq!(dst.pixel(3, 1), Some([40, 50, 60, 255]));
    }

    #[test]
    fn test_rejects_device_and_short_frames() {
        let mut conv = SoftwareConverter::new();
        let mut dst = PixelBuffer::new(2, 2);

        let device = RawVideoFrame {
            pts: None,
            width: 2,
            height: 2,
            format: PixelFormat::Nv12,
            memory: FrameMemory::Device(DeviceSurface { handle: 1 }),
        };
        assert!(matches!(conv.convert(&device, &mut dst), Err(MediaError::Resource(_))));

        let short = frame(PixelFormat::I420, 2, 2, vec![0; 3]);
        assert!(matches!(conv.convert(&short, &mut dst), Err(MediaError::Decode(_))));
    }

    #[test]
    fn test_color_space_by_height() {
        assert_eq!(ColorSpace::for_height(480), ColorSpace::Bt601);
        assert_eq!(ColorSpace::for_height(1080), ColorSpace::Bt709);
    }
}
