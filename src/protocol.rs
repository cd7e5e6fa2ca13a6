//! Turning spans into display-controller tasks.
//!
//! A span is drawn with three tasks: set the column window, set the row
//! window, then stream the covered pixels. The controller fills the window
//! in row-major order, so a span whose last scanline is shorter simply
//! stops streaming early.

use crate::convert::{BusPixelFormat, encode_pixels};
use crate::error::{MirrorError, MirrorResult};
use crate::frame::{FrameLayout, FrameView};
use crate::queue::{TASK_HEADER_BYTES, TaskProducer};
use crate::span::Span;

pub const CMD_DISPLAY_OFF: u8 = 0x28;
pub const CMD_DISPLAY_ON: u8 = 0x29;
pub const CMD_SET_COLUMN: u8 = 0x2A;
pub const CMD_SET_ROW: u8 = 0x2B;
pub const CMD_WRITE_PIXELS: u8 = 0x2C;

/// Largest coordinate a 16-bit window register can address.
const MAX_WINDOW_COORD: u32 = u16::MAX as u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisplayProtocol {
    pub set_column: u8,
    pub set_row: u8,
    pub write_pixels: u8,
    /// The controller clocks parameters as 16-bit words, so every byte of
    /// a window payload is preceded by a zero byte.
    pub wide_bus: bool,
    pub pixel_format: BusPixelFormat,
}

impl Default for DisplayProtocol {
    fn default() -> Self {
        Self::ili9486()
    }
}

/// Encoded column or row window parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowPayload {
    bytes: [u8; 8],
    len: usize,
}

impl WindowPayload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl DisplayProtocol {
    /// 320x480 class controller on a 16-bit-wide parameter bus.
    pub fn ili9486() -> Self {
        Self {
            set_column: CMD_SET_COLUMN,
            set_row: CMD_SET_ROW,
            write_pixels: CMD_WRITE_PIXELS,
            wide_bus: true,
            pixel_format: BusPixelFormat::Rgb565,
        }
    }

    /// Same command set on a plain 8-bit parameter bus.
    pub fn ili9341() -> Self {
        Self {
            wide_bus: false,
            ..Self::ili9486()
        }
    }

    pub fn with_pixel_format(mut self, pixel_format: BusPixelFormat) -> Self {
        self.pixel_format = pixel_format;
        self
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.pixel_format.bytes_per_pixel()
    }

    pub fn window_payload_len(&self) -> usize {
        if self.wide_bus { 8 } else { 4 }
    }

    /// Encode an inclusive `start..=end` window.
    pub fn window_payload(&self, start: u16, end_inclusive: u16) -> WindowPayload {
        let [start_hi, start_lo] = start.to_be_bytes();
        let [end_hi, end_lo] = end_inclusive.to_be_bytes();
        let bytes = if self.wide_bus {
            [0, start_hi, 0, start_lo, 0, end_hi, 0, end_lo]
        } else {
            [start_hi, start_lo, end_hi, end_lo, 0, 0, 0, 0]
        };
        WindowPayload {
            bytes,
            len: self.window_payload_len(),
        }
    }

    /// Inverse of [`DisplayProtocol::window_payload`].
    pub fn decode_window(&self, payload: &[u8]) -> Option<(u16, u16)> {
        match (self.wide_bus, payload) {
            (true, &[0, start_hi, 0, start_lo, 0, end_hi, 0, end_lo]) => Some((
                u16::from_be_bytes([start_hi, start_lo]),
                u16::from_be_bytes([end_hi, end_lo]),
            )),
            (false, &[start_hi, start_lo, end_hi, end_lo]) => Some((
                u16::from_be_bytes([start_hi, start_lo]),
                u16::from_be_bytes([end_hi, end_lo]),
            )),
            _ => None,
        }
    }

    /// Check that `layout` is addressable and that one scanline of pixels
    /// fits in a task of `max_payload_bytes`.
    pub fn check_layout(&self, layout: FrameLayout, max_payload_bytes: usize) -> MirrorResult<()> {
        let (width, height) = layout.dimensions();
        if width - 1 > MAX_WINDOW_COORD || height - 1 > MAX_WINDOW_COORD {
            return Err(MirrorError::InvalidConfig(format!(
                "{width}x{height} frame exceeds the 16-bit window range"
            )));
        }
        let row_bytes = width as usize * self.bytes_per_pixel();
        let required = row_bytes.max(self.window_payload_len());
        if required > max_payload_bytes {
            return Err(MirrorError::TaskTooLarge {
                payload_bytes: required,
                max_payload_bytes,
            });
        }
        Ok(())
    }

    /// Ring bytes needed to send `span` in one band, headers included.
    pub fn span_footprint(&self, span: &Span) -> usize {
        2 * (TASK_HEADER_BYTES + self.window_payload_len())
            + TASK_HEADER_BYTES
            + span.size as usize * self.bytes_per_pixel()
    }

    /// Queue a single control task.
    pub fn enqueue_command(
        &self,
        producer: &mut TaskProducer,
        cmd: u8,
        payload: &[u8],
    ) -> MirrorResult<()> {
        if payload.is_empty() {
            // A zero-sized record is the ring's wrap marker.
            return Err(MirrorError::InvalidConfig(format!(
                "command 0x{cmd:02X} needs at least one parameter byte"
            )));
        }
        if payload.len() > producer.max_payload_bytes() {
            return Err(MirrorError::TaskTooLarge {
                payload_bytes: payload.len(),
                max_payload_bytes: producer.max_payload_bytes(),
            });
        }
        let mut writer = producer.allocate(payload.len())?;
        writer.set_cmd(cmd);
        writer.payload_mut().copy_from_slice(payload);
        writer.commit();
        Ok(())
    }

    fn enqueue_window(
        &self,
        producer: &mut TaskProducer,
        cmd: u8,
        start: u32,
        end_inclusive: u32,
    ) -> MirrorResult<()> {
        let window = self.window_payload(start as u16, end_inclusive as u16);
        self.enqueue_command(producer, cmd, window.as_bytes())
    }

    /// Queue the tasks that draw `span` from `frame`. Spans whose pixels
    /// exceed one task are split into bands of whole scanlines, each with
    /// its own window. Returns the number of pixel bytes queued.
    pub fn enqueue_span(
        &self,
        producer: &mut TaskProducer,
        span: &Span,
        frame: &FrameView<'_>,
    ) -> MirrorResult<usize> {
        let bpp = self.bytes_per_pixel();
        let row_bytes = span.width() as usize * bpp;
        let max_payload_bytes = producer.max_payload_bytes();
        if row_bytes > max_payload_bytes {
            return Err(MirrorError::TaskTooLarge {
                payload_bytes: row_bytes,
                max_payload_bytes,
            });
        }
        let rows_per_band = (max_payload_bytes / row_bytes) as u32;

        let mut queued = 0;
        let mut band_y = span.y;
        while band_y < span.end_y {
            let band_end = band_y.saturating_add(rows_per_band).min(span.end_y);
            let last_scan_end_x = if band_end == span.end_y {
                span.last_scan_end_x
            } else {
                span.end_x
            };
            let band = Span {
                x: span.x,
                y: band_y,
                end_x: span.end_x,
                end_y: band_end,
                last_scan_end_x,
                size: Span::cost(span.x, band_y, span.end_x, band_end, last_scan_end_x) as u32,
            };
            queued += self.enqueue_band(producer, &band, frame)?;
            band_y = band_end;
        }
        Ok(queued)
    }

    fn enqueue_band(
        &self,
        producer: &mut TaskProducer,
        band: &Span,
        frame: &FrameView<'_>,
    ) -> MirrorResult<usize> {
        self.enqueue_window(producer, self.set_column, band.x, band.end_x - 1)?;
        self.enqueue_window(producer, self.set_row, band.y, band.end_y - 1)?;

        let bpp = self.bytes_per_pixel();
        let bytes = band.size as usize * bpp;
        let mut writer = producer.allocate(bytes)?;
        writer.set_cmd(self.write_pixels);
        let payload = writer.payload_mut();
        let mut offset = 0;
        for (y, start, end) in band.scanlines() {
            let pixels = &frame.row(y)[start as usize..end as usize];
            let len = pixels.len() * bpp;
            encode_pixels(self.pixel_format, pixels, &mut payload[offset..offset + len]);
            offset += len;
        }
        debug_assert_eq!(offset, bytes);
        writer.commit();
        Ok(bytes)
    }
}
