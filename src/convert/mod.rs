mod parallel;
mod scalar;

use parallel::{RowSplit, run_on_pool};

use crate::error::{MirrorError, MirrorResult};
use crate::frame::Frame;

/// Pre-initialize the conversion thread pool so the first surface
/// conversion doesn't pay the cost. Safe to call multiple times.
pub fn warmup() {
    run_on_pool(RGB565_SPLIT.max_workers, || {});
}

/// Typical SPI panels (480×320 and below) always convert serially.
const RGB565_SPLIT: RowSplit = RowSplit {
    min_pixels: 262_144,
    min_band_pixels: 65_536,
    max_workers: 8,
};

type Rgb565Kernel = unsafe fn(*const u8, *mut u16, usize);

/// 32-bit surface layouts GPU snapshot APIs hand out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfacePixelFormat {
    Bgra8,
    Rgba8,
}

impl SurfacePixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        4
    }

    fn kernel(self) -> Rgb565Kernel {
        match self {
            Self::Bgra8 => scalar::convert_bgra_to_rgb565_unchecked,
            Self::Rgba8 => scalar::convert_rgba_to_rgb565_unchecked,
        }
    }
}

/// Pixel encoding on the display bus.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BusPixelFormat {
    /// 16 bits per pixel, big-endian.
    #[default]
    Rgb565,
    /// 18 bits per pixel sent as three bytes (`R6X2 G6X2 B6X2`).
    Rgb666,
}

impl BusPixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb565 => 2,
            Self::Rgb666 => 3,
        }
    }

    pub(crate) fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "rgb565" | "565" => Some(Self::Rgb565),
            "rgb666" | "666" | "r6x2g6x2b6x2" => Some(Self::Rgb666),
            _ => None,
        }
    }
}

pub const fn rgb565(r: u8, g: u8, b: u8) -> u16 {
    scalar::pack_rgb565(r, g, b)
}

/// Encode RGB565 source pixels into bus bytes. `dst` must hold exactly
/// `src.len() * format.bytes_per_pixel()` bytes.
pub fn encode_pixels(format: BusPixelFormat, src: &[u16], dst: &mut [u8]) {
    assert_eq!(
        dst.len(),
        src.len() * format.bytes_per_pixel(),
        "wire buffer size mismatch for {} {format:?} pixels",
        src.len()
    );
    match format {
        BusPixelFormat::Rgb565 => scalar::write_rgb565_be(src, dst),
        BusPixelFormat::Rgb666 => scalar::write_rgb666(src, dst),
    }
}

/// Convert one row of 32-bit pixels. The row width is `dst_row.len()`.
pub fn convert_row_to_rgb565(format: SurfacePixelFormat, src_row: &[u8], dst_row: &mut [u16]) {
    let pixel_count = dst_row.len();
    let required = pixel_count * format.bytes_per_pixel();
    assert!(
        src_row.len() >= required,
        "{format:?} source row too small: got {}, need at least {required} bytes",
        src_row.len()
    );
    unsafe {
        format.kernel()(src_row.as_ptr(), dst_row.as_mut_ptr(), pixel_count);
    }
}

/// Convert a pitched 32-bit surface into `frame`, keeping the frame's
/// dimensions and stride.
pub fn convert_surface_to_rgb565(
    format: SurfacePixelFormat,
    src: &[u8],
    src_pitch: usize,
    frame: &mut Frame,
) -> MirrorResult<()> {
    let layout = frame.layout();
    let width = layout.width() as usize;
    let height = layout.height() as usize;
    let row_bytes = width
        .checked_mul(format.bytes_per_pixel())
        .ok_or(MirrorError::BufferOverflow)?;
    if src_pitch < row_bytes {
        return Err(MirrorError::InvalidFrame(format!(
            "source pitch too small: pitch={src_pitch}, required={row_bytes}"
        )));
    }
    let required = src_pitch
        .checked_mul(height - 1)
        .and_then(|bytes| bytes.checked_add(row_bytes))
        .ok_or(MirrorError::BufferOverflow)?;
    if src.len() < required {
        return Err(MirrorError::InvalidFrame(format!(
            "source surface too small: got {} bytes, need at least {required}",
            src.len()
        )));
    }

    let dst_stride = layout.stride_pixels();
    let convert_row = |row: usize, dst_row: &mut [u16]| {
        let start = row * src_pitch;
        convert_row_to_rgb565(format, &src[start..start + row_bytes], &mut dst_row[..width]);
    };

    match RGB565_SPLIT.band_rows(width, height) {
        Some(band_rows) => {
            use rayon::prelude::*;
            let pixels = frame.as_mut_pixels();
            run_on_pool(RGB565_SPLIT.max_workers, || {
                pixels
                    .par_chunks_mut(dst_stride * band_rows)
                    .enumerate()
                    .for_each(|(band, rows)| {
                        let first_row = band * band_rows;
                        for (offset, dst_row) in rows.chunks_mut(dst_stride).enumerate() {
                            convert_row(first_row + offset, dst_row);
                        }
                    });
            });
        }
        None => {
            for (row, dst_row) in frame
                .as_mut_pixels()
                .chunks_mut(dst_stride)
                .take(height)
                .enumerate()
            {
                convert_row(row, dst_row);
            }
        }
    }
    Ok(())
}

/// Build a packed RGB565 frame from a 32-bit surface.
pub fn frame_from_surface(
    format: SurfacePixelFormat,
    src: &[u8],
    src_pitch: usize,
    width: u32,
    height: u32,
) -> MirrorResult<Frame> {
    let mut frame = Frame::new(width, height)?;
    convert_surface_to_rgb565(format, src, src_pitch, &mut frame)?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bgra_surface(width: usize, height: usize, pitch: usize) -> Vec<u8> {
        let mut surface = vec![0xCDu8; pitch * height];
        for y in 0..height {
            for x in 0..width {
                let idx = y * pitch + x * 4;
                surface[idx] = (x * 7) as u8;
                surface[idx + 1] = (y * 5) as u8;
                surface[idx + 2] = (x ^ y) as u8;
                surface[idx + 3] = 0xFF;
            }
        }
        surface
    }

    #[test]
    fn primaries_pack_to_rgb565() {
        assert_eq!(rgb565(0xFF, 0, 0), 0xF800);
        assert_eq!(rgb565(0, 0xFF, 0), 0x07E0);
        assert_eq!(rgb565(0, 0, 0xFF), 0x001F);
        assert_eq!(rgb565(0xFF, 0xFF, 0xFF), 0xFFFF);
    }

    #[test]
    fn bgra_and_rgba_rows_swap_channels() {
        let src = [0x00, 0x00, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0xFF];
        let mut dst = [0u16; 2];
        convert_row_to_rgb565(SurfacePixelFormat::Bgra8, &src, &mut dst);
        assert_eq!(dst, [0xF800, 0x001F]);
        convert_row_to_rgb565(SurfacePixelFormat::Rgba8, &src, &mut dst);
        assert_eq!(dst, [0x001F, 0xF800]);
    }

    #[test]
    fn wire_encodings() {
        let pixels = [0xF800u16, 0x07E0, 0x001F, 0x1234];
        let mut rgb565 = [0u8; 8];
        encode_pixels(BusPixelFormat::Rgb565, &pixels, &mut rgb565);
        assert_eq!(rgb565, [0xF8, 0x00, 0x07, 0xE0, 0x00, 0x1F, 0x12, 0x34]);

        let mut rgb666 = [0u8; 12];
        encode_pixels(BusPixelFormat::Rgb666, &pixels, &mut rgb666);
        assert_eq!(&rgb666[..3], &[0xFC, 0x00, 0x00]);
        assert_eq!(&rgb666[3..6], &[0x00, 0xFC, 0x00]);
        assert_eq!(&rgb666[6..9], &[0x00, 0x00, 0xFC]);
    }

    #[test]
    fn pitched_surface_converts_every_row() -> MirrorResult<()> {
        let (width, height, pitch) = (13usize, 7usize, 64usize);
        let surface = bgra_surface(width, height, pitch);
        let frame = frame_from_surface(
            SurfacePixelFormat::Bgra8,
            &surface,
            pitch,
            width as u32,
            height as u32,
        )?;
        for y in 0..height {
            for x in 0..width {
                let idx = y * pitch + x * 4;
                let expected = rgb565(surface[idx + 2], surface[idx + 1], surface[idx]);
                assert_eq!(frame.pixel(x as u32, y as u32), expected);
            }
        }
        Ok(())
    }

    #[test]
    fn large_surface_matches_row_conversion() -> MirrorResult<()> {
        let (width, height) = (1024usize, 640usize);
        let pitch = width * 4;
        let surface = bgra_surface(width, height, pitch);
        let frame = frame_from_surface(
            SurfacePixelFormat::Bgra8,
            &surface,
            pitch,
            width as u32,
            height as u32,
        )?;
        let mut expected = vec![0u16; width];
        for y in [0usize, 1, 317, 639] {
            convert_row_to_rgb565(
                SurfacePixelFormat::Bgra8,
                &surface[y * pitch..(y + 1) * pitch],
                &mut expected,
            );
            assert_eq!(frame.row(y as u32), expected.as_slice());
        }
        Ok(())
    }

    #[test]
    fn short_surface_is_rejected() -> MirrorResult<()> {
        let mut frame = Frame::new(4, 4)?;
        let surface = vec![0u8; 4 * 4 * 4 - 1];
        let result = convert_surface_to_rgb565(SurfacePixelFormat::Rgba8, &surface, 16, &mut frame);
        assert!(matches!(result, Err(MirrorError::InvalidFrame(_))));
        Ok(())
    }
}
