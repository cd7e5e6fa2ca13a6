use std::time::Instant;

use crate::error::{MirrorError, MirrorResult};
use crate::span::Span;

/// Source framebuffers are always 16 bits per pixel (RGB565).
pub const SOURCE_BYTES_PER_PIXEL: usize = 2;

/// Dimensions and scanline stride of a 16-bit framebuffer.
///
/// The stride may exceed `width * 2` bytes when the producer pads its
/// scanlines (GPU snapshot surfaces commonly align rows to 32 or 64
/// bytes). It must stay a whole number of pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameLayout {
    width: u32,
    height: u32,
    stride_bytes: usize,
}

impl FrameLayout {
    pub fn new(width: u32, height: u32, stride_bytes: usize) -> MirrorResult<Self> {
        if width == 0 || height == 0 {
            return Err(MirrorError::InvalidFrame(
                "frame width and height must be > 0".into(),
            ));
        }
        let row_bytes = (width as usize)
            .checked_mul(SOURCE_BYTES_PER_PIXEL)
            .ok_or(MirrorError::BufferOverflow)?;
        if stride_bytes < row_bytes {
            return Err(MirrorError::InvalidFrame(format!(
                "stride of {stride_bytes} bytes is smaller than a {width}-pixel scanline ({row_bytes} bytes)"
            )));
        }
        if stride_bytes % SOURCE_BYTES_PER_PIXEL != 0 {
            return Err(MirrorError::InvalidFrame(format!(
                "stride of {stride_bytes} bytes is not a whole number of 16-bit pixels"
            )));
        }
        let layout = Self {
            width,
            height,
            stride_bytes,
        };
        layout.storage_len()?;
        Ok(layout)
    }

    /// Layout with no scanline padding.
    pub fn packed(width: u32, height: u32) -> MirrorResult<Self> {
        let stride_bytes = (width as usize)
            .checked_mul(SOURCE_BYTES_PER_PIXEL)
            .ok_or(MirrorError::BufferOverflow)?;
        Self::new(width, height, stride_bytes)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn stride_bytes(&self) -> usize {
        self.stride_bytes
    }

    pub fn stride_pixels(&self) -> usize {
        self.stride_bytes / SOURCE_BYTES_PER_PIXEL
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Number of `u16` samples a buffer with this layout must hold.
    pub fn storage_len(&self) -> MirrorResult<usize> {
        self.stride_pixels()
            .checked_mul(self.height as usize)
            .ok_or(MirrorError::BufferOverflow)
    }

    /// Upper bound on the number of single-scanline spans a diff can
    /// produce: every span is at least one pixel wide and separated from
    /// the next one on the same row by at least one unchanged pixel.
    pub fn max_spans(&self) -> usize {
        (self.width as usize).div_ceil(2) * self.height as usize
    }

    #[inline(always)]
    fn row_start(&self, y: u32) -> usize {
        y as usize * self.stride_pixels()
    }
}

/// Borrowed, read-only view over a 16-bit framebuffer.
#[derive(Clone, Copy, Debug)]
pub struct FrameView<'a> {
    layout: FrameLayout,
    pixels: &'a [u16],
}

impl<'a> FrameView<'a> {
    pub fn new(layout: FrameLayout, pixels: &'a [u16]) -> MirrorResult<Self> {
        let expected = layout.storage_len()?;
        if pixels.len() < expected {
            return Err(MirrorError::InvalidFrame(format!(
                "pixel buffer holds {} samples, layout {}x{} with stride {} needs {}",
                pixels.len(),
                layout.width,
                layout.height,
                layout.stride_bytes,
                expected
            )));
        }
        Ok(Self { layout, pixels })
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    pub fn width(&self) -> u32 {
        self.layout.width
    }

    pub fn height(&self) -> u32 {
        self.layout.height
    }

    /// The visible pixels of scanline `y` (stride padding excluded).
    #[inline(always)]
    pub fn row(&self, y: u32) -> &'a [u16] {
        let start = self.layout.row_start(y);
        &self.pixels[start..start + self.layout.width as usize]
    }

    #[inline(always)]
    pub fn pixel(&self, x: u32, y: u32) -> u16 {
        self.row(y)[x as usize]
    }
}

/// Per-frame metadata supplied by the capture side.
#[derive(Clone, Debug, Default)]
pub struct FrameMetadata {
    /// Monotonic sequence number assigned by the frame source.
    pub sequence: u64,
    /// Time the frame was acquired from the GPU, if known.
    pub capture_time: Option<Instant>,
    /// The source knows the displayed content is stale (mode switch,
    /// panel power cycle, ...), so the frame must be sent in full rather
    /// than diffed.
    pub force_full_refresh: bool,
}

/// Owned 16-bit framebuffer.
pub struct Frame {
    layout: FrameLayout,
    pixels: Vec<u16>,
    pub metadata: FrameMetadata,
}

impl Frame {
    /// Zero-filled, unpadded frame.
    pub fn new(width: u32, height: u32) -> MirrorResult<Self> {
        Self::with_layout(FrameLayout::packed(width, height)?)
    }

    pub fn with_layout(layout: FrameLayout) -> MirrorResult<Self> {
        let len = layout.storage_len()?;
        Ok(Self {
            layout,
            pixels: vec![0; len],
            metadata: FrameMetadata::default(),
        })
    }

    pub fn from_pixels(layout: FrameLayout, pixels: Vec<u16>) -> MirrorResult<Self> {
        let expected = layout.storage_len()?;
        if pixels.len() != expected {
            return Err(MirrorError::InvalidFrame(format!(
                "pixel data length mismatch: got {}, expected {} for {}x{} with stride {}",
                pixels.len(),
                expected,
                layout.width,
                layout.height,
                layout.stride_bytes
            )));
        }
        Ok(Self {
            layout,
            pixels,
            metadata: FrameMetadata::default(),
        })
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    pub fn width(&self) -> u32 {
        self.layout.width
    }

    pub fn height(&self) -> u32 {
        self.layout.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.layout.dimensions()
    }

    pub fn view(&self) -> FrameView<'_> {
        FrameView {
            layout: self.layout,
            pixels: &self.pixels,
        }
    }

    pub fn as_pixels(&self) -> &[u16] {
        &self.pixels
    }

    pub fn as_mut_pixels(&mut self) -> &mut [u16] {
        &mut self.pixels
    }

    pub fn row(&self, y: u32) -> &[u16] {
        let start = self.layout.row_start(y);
        &self.pixels[start..start + self.layout.width as usize]
    }

    pub fn row_mut(&mut self, y: u32) -> &mut [u16] {
        let start = self.layout.row_start(y);
        let width = self.layout.width as usize;
        &mut self.pixels[start..start + width]
    }

    pub fn pixel(&self, x: u32, y: u32) -> u16 {
        self.row(y)[x as usize]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, value: u16) {
        self.row_mut(y)[x as usize] = value;
    }

    pub fn fill(&mut self, value: u16) {
        self.pixels.fill(value);
    }

    /// Fill a rectangle, clamped to the frame bounds.
    pub fn fill_rect(&mut self, x: u32, y: u32, width: u32, height: u32, value: u16) {
        let end_x = x.saturating_add(width).min(self.layout.width);
        let end_y = y.saturating_add(height).min(self.layout.height);
        if x >= end_x {
            return;
        }
        for row in y..end_y {
            self.row_mut(row)[x as usize..end_x as usize].fill(value);
        }
    }

    /// Copy the visible pixels of `src` into this frame. Strides may differ.
    pub fn copy_from(&mut self, src: &FrameView<'_>) -> MirrorResult<()> {
        if src.layout.dimensions() != self.layout.dimensions() {
            return Err(MirrorError::InvalidFrame(format!(
                "cannot copy a {}x{} frame into a {}x{} frame",
                src.width(),
                src.height(),
                self.layout.width,
                self.layout.height
            )));
        }
        for y in 0..self.layout.height {
            self.row_mut(y).copy_from_slice(src.row(y));
        }
        Ok(())
    }

    /// Copy the pixels covered by `span` from `src`, honoring the shorter
    /// final scanline.
    pub fn apply_span(&mut self, src: &FrameView<'_>, span: &Span) {
        for (y, start, end) in span.scanlines() {
            let (start, end) = (start as usize, end as usize);
            self.row_mut(y)[start..end].copy_from_slice(&src.row(y)[start..end]);
        }
    }

    /// Resize to `layout`, reusing the allocation when possible. Pixel
    /// contents are unspecified afterwards.
    pub(crate) fn ensure_layout(&mut self, layout: FrameLayout) -> MirrorResult<()> {
        if self.layout == layout {
            return Ok(());
        }
        let len = layout.storage_len()?;
        self.pixels.resize(len, 0);
        self.layout = layout;
        Ok(())
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.layout.width)
            .field("height", &self.layout.height)
            .field("stride_bytes", &self.layout.stride_bytes)
            .field("metadata", &self.metadata)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_rejects_short_or_odd_stride() {
        assert!(FrameLayout::new(4, 4, 6).is_err());
        assert!(FrameLayout::new(4, 4, 9).is_err());
        assert!(FrameLayout::new(0, 4, 8).is_err());
        assert!(FrameLayout::new(4, 4, 12).is_ok());
    }

    #[test]
    fn padded_rows_exclude_stride_padding() -> MirrorResult<()> {
        let layout = FrameLayout::new(3, 2, 8)?;
        let mut frame = Frame::with_layout(layout)?;
        assert_eq!(frame.as_pixels().len(), 8);
        frame.row_mut(1).copy_from_slice(&[7, 8, 9]);
        assert_eq!(frame.as_pixels(), &[0, 0, 0, 0, 7, 8, 9, 0]);
        assert_eq!(frame.view().row(1), &[7, 8, 9]);
        Ok(())
    }

    #[test]
    fn view_rejects_short_buffer() -> MirrorResult<()> {
        let layout = FrameLayout::packed(4, 4)?;
        let pixels = vec![0u16; 15];
        assert!(FrameView::new(layout, &pixels).is_err());
        Ok(())
    }

    #[test]
    fn apply_span_honors_short_last_scanline() -> MirrorResult<()> {
        let mut src = Frame::new(6, 3)?;
        src.fill(0xFFFF);
        let mut dst = Frame::new(6, 3)?;
        let span = Span {
            x: 1,
            y: 0,
            end_x: 5,
            end_y: 2,
            last_scan_end_x: 3,
            size: 6,
        };
        dst.apply_span(&src.view(), &span);
        assert_eq!(dst.row(0), &[0, 0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF, 0]);
        assert_eq!(dst.row(1), &[0, 0xFFFF, 0xFFFF, 0, 0, 0]);
        assert_eq!(dst.row(2), &[0; 6]);
        Ok(())
    }
}
