use crate::error::{MirrorError, MirrorResult};
use crate::frame::FrameView;
use crate::span::{Span, SpanList};

/// Pixels per coarse comparison chunk (one `u64`).
const CHUNK_PIXELS: usize = 4;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DiffMode {
    /// Compare 4-pixel chunks. Fast, may overshoot a span's end to the row
    /// end when the change reaches the last chunk.
    #[default]
    Coarse,
    /// Compare pixel pairs, then extend each span pixel by pixel until the
    /// coalescing lookahead runs out.
    Exact,
    /// Skip comparison and resend the whole frame.
    FullFrame,
}

impl DiffMode {
    pub(crate) fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "coarse" => Some(Self::Coarse),
            "exact" => Some(Self::Exact),
            "full" | "full-frame" | "fullframe" => Some(Self::FullFrame),
            _ => None,
        }
    }
}

/// Which half of the scanlines an interlaced diff visits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FieldParity {
    #[default]
    Even,
    Odd,
}

impl FieldParity {
    pub fn first_row(self) -> u32 {
        match self {
            Self::Even => 0,
            Self::Odd => 1,
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            Self::Even => Self::Odd,
            Self::Odd => Self::Even,
        }
    }
}

/// Converts a comparison of two frames into single-scanline spans.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiffEngine {
    mode: DiffMode,
    coalesce_threshold: u32,
}

impl DiffEngine {
    pub fn new(mode: DiffMode, coalesce_threshold: u32) -> Self {
        Self {
            mode,
            coalesce_threshold,
        }
    }

    pub fn mode(&self) -> DiffMode {
        self.mode
    }

    pub fn coalesce_threshold(&self) -> u32 {
        self.coalesce_threshold
    }

    /// Rebuild `spans` with the differences between `current` and
    /// `previous`. With `field` set only scanlines of that parity are
    /// compared. Returns the number of spans produced.
    pub fn diff(
        &self,
        current: &FrameView<'_>,
        previous: &FrameView<'_>,
        field: Option<FieldParity>,
        spans: &mut SpanList,
    ) -> MirrorResult<usize> {
        match self.mode {
            DiffMode::Coarse => diff_coarse(current, previous, field, spans),
            DiffMode::Exact => {
                diff_exact(current, previous, field, self.coalesce_threshold, spans)
            }
            DiffMode::FullFrame => {
                full_frame(current, spans);
                Ok(spans.len())
            }
        }
    }
}

/// Replace `spans` with one span covering the whole frame.
pub fn full_frame(current: &FrameView<'_>, spans: &mut SpanList) {
    spans.clear();
    spans.push(Span::full_frame(current.layout()));
}

pub fn diff_coarse(
    current: &FrameView<'_>,
    previous: &FrameView<'_>,
    field: Option<FieldParity>,
    spans: &mut SpanList,
) -> MirrorResult<usize> {
    ensure_same_dimensions(current, previous)?;
    spans.clear();
    for y in scan_rows(current.height(), field) {
        coarse_scanline(current.row(y), previous.row(y), y, spans);
    }
    Ok(spans.len())
}

pub fn diff_exact(
    current: &FrameView<'_>,
    previous: &FrameView<'_>,
    field: Option<FieldParity>,
    coalesce_threshold: u32,
    spans: &mut SpanList,
) -> MirrorResult<usize> {
    ensure_same_dimensions(current, previous)?;
    spans.clear();
    for y in scan_rows(current.height(), field) {
        exact_scanline(
            current.row(y),
            previous.row(y),
            y,
            coalesce_threshold,
            spans,
        );
    }
    Ok(spans.len())
}

fn ensure_same_dimensions(current: &FrameView<'_>, previous: &FrameView<'_>) -> MirrorResult<()> {
    let (cw, ch) = current.layout().dimensions();
    let (pw, ph) = previous.layout().dimensions();
    if (cw, ch) != (pw, ph) {
        return Err(MirrorError::InvalidFrame(format!(
            "cannot diff a {cw}x{ch} frame against a {pw}x{ph} frame"
        )));
    }
    Ok(())
}

#[inline(always)]
fn scan_rows(height: u32, field: Option<FieldParity>) -> impl Iterator<Item = u32> {
    let (first, step) = match field {
        Some(parity) => (parity.first_row(), 2),
        None => (0, 1),
    };
    (first..height).step_by(step)
}

/// Pack up to four pixels so that pixel `k` occupies bits `16k..16k+16`.
/// Missing lanes of a trailing partial chunk read as zero on both sides.
#[inline(always)]
fn pack_chunk(pixels: &[u16]) -> u64 {
    pixels
        .iter()
        .enumerate()
        .fold(0u64, |acc, (lane, &pixel)| acc | (u64::from(pixel) << (lane * 16)))
}

#[inline(always)]
fn chunk_diff(current: &[u16], previous: &[u16], chunk: usize) -> u64 {
    let start = chunk * CHUNK_PIXELS;
    let end = (start + CHUNK_PIXELS).min(current.len());
    pack_chunk(&current[start..end]) ^ pack_chunk(&previous[start..end])
}

fn coarse_scanline(current: &[u16], previous: &[u16], y: u32, spans: &mut SpanList) {
    let width = current.len();
    let chunks = width.div_ceil(CHUNK_PIXELS);

    let mut chunk = 0;
    while chunk < chunks {
        let diff = chunk_diff(current, previous, chunk);
        if diff == 0 {
            chunk += 1;
            continue;
        }

        let start = chunk * CHUNK_PIXELS + (diff.trailing_zeros() / 16) as usize;
        let mut last_diff = diff;
        chunk += 1;
        let end = loop {
            if chunk == chunks {
                break width;
            }
            let diff = chunk_diff(current, previous, chunk);
            if diff == 0 {
                // Exact end inside the last mismatching chunk.
                break chunk * CHUNK_PIXELS - (last_diff.leading_zeros() / 16) as usize;
            }
            last_diff = diff;
            chunk += 1;
        };
        // The terminating chunk matched, nothing to revisit there.
        chunk += 1;

        spans.push(Span::scanline(y, start as u32, end as u32));
    }
}

fn exact_scanline(
    current: &[u16],
    previous: &[u16],
    y: u32,
    coalesce_threshold: u32,
    spans: &mut SpanList,
) {
    let width = current.len();
    let mut x = 0;
    while x < width {
        let start;
        let mut end;
        if x + 1 < width {
            let first = current[x] != previous[x];
            let second = current[x + 1] != previous[x + 1];
            x += 2;
            let mut unchanged = match (first, second) {
                (false, false) => continue,
                (false, true) => {
                    start = x - 1;
                    end = x;
                    0
                }
                (true, true) => {
                    start = x - 2;
                    end = x;
                    0
                }
                (true, false) => {
                    start = x - 2;
                    end = x - 1;
                    1
                }
            };

            while x < width && unchanged <= coalesce_threshold {
                if current[x] != previous[x] {
                    end = x + 1;
                    unchanged = 0;
                } else {
                    unchanged += 1;
                }
                x += 1;
            }
        } else {
            // Lone last pixel of an odd-width row.
            x += 1;
            if current[x - 1] == previous[x - 1] {
                continue;
            }
            start = x - 1;
            end = x;
        }

        spans.push(Span::scanline(y, start as u32, end as u32));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, FrameLayout};

    fn frames(width: u32, height: u32) -> MirrorResult<(Frame, Frame)> {
        Ok((Frame::new(width, height)?, Frame::new(width, height)?))
    }

    fn collect(spans: &SpanList) -> Vec<Span> {
        spans.iter().copied().collect()
    }

    /// Deterministic pseudo-random pixels, no external generator needed.
    fn scribble(frame: &mut Frame, seed: u64, density: u64) {
        let mut state = seed;
        let (width, height) = frame.dimensions();
        for y in 0..height {
            for x in 0..width {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                if (state >> 33) % 100 < density {
                    frame.set_pixel(x, y, (state >> 17) as u16 | 1);
                }
            }
        }
    }

    #[test]
    fn exact_single_pixel_change() -> MirrorResult<()> {
        let (mut current, previous) = frames(4, 4)?;
        current.set_pixel(2, 1, 0xF800);
        let mut spans = SpanList::for_layout(current.layout());

        diff_exact(&current.view(), &previous.view(), None, 320, &mut spans)?;
        assert_eq!(
            collect(&spans),
            vec![Span {
                x: 2,
                y: 1,
                end_x: 3,
                end_y: 2,
                last_scan_end_x: 3,
                size: 1,
            }]
        );
        Ok(())
    }

    #[test]
    fn coarse_single_pixel_change_runs_to_row_end() -> MirrorResult<()> {
        let (mut current, previous) = frames(4, 4)?;
        current.set_pixel(2, 1, 0xF800);
        let mut spans = SpanList::for_layout(current.layout());

        diff_coarse(&current.view(), &previous.view(), None, &mut spans)?;
        // The start is pixel-exact, the run hits the row end inside the
        // only chunk so it extends to the row width.
        assert_eq!(collect(&spans), vec![Span::scanline(1, 2, 4)]);
        Ok(())
    }

    #[test]
    fn coarse_finds_exact_end_before_matching_chunk() -> MirrorResult<()> {
        let (mut current, previous) = frames(12, 1)?;
        current.set_pixel(5, 0, 1);
        current.set_pixel(6, 0, 1);
        let mut spans = SpanList::for_layout(current.layout());

        diff_coarse(&current.view(), &previous.view(), None, &mut spans)?;
        assert_eq!(collect(&spans), vec![Span::scanline(0, 5, 7)]);
        Ok(())
    }

    #[test]
    fn coarse_compares_trailing_partial_chunk() -> MirrorResult<()> {
        let (mut current, previous) = frames(6, 2)?;
        current.set_pixel(5, 1, 7);
        let mut spans = SpanList::for_layout(current.layout());

        diff_coarse(&current.view(), &previous.view(), None, &mut spans)?;
        assert_eq!(collect(&spans), vec![Span::scanline(1, 5, 6)]);
        Ok(())
    }

    #[test]
    fn exact_coalesces_short_gaps_only() -> MirrorResult<()> {
        let (mut current, previous) = frames(10, 2)?;
        current.set_pixel(0, 0, 1);
        current.set_pixel(3, 0, 1);
        current.set_pixel(0, 1, 1);
        current.set_pixel(4, 1, 1);
        let mut spans = SpanList::for_layout(current.layout());

        diff_exact(&current.view(), &previous.view(), None, 2, &mut spans)?;
        assert_eq!(
            collect(&spans),
            vec![
                Span::scanline(0, 0, 4),
                Span::scanline(1, 0, 1),
                Span::scanline(1, 4, 5),
            ]
        );
        Ok(())
    }

    #[test]
    fn exact_handles_odd_width_last_pixel() -> MirrorResult<()> {
        let (mut current, previous) = frames(5, 1)?;
        current.set_pixel(4, 0, 9);
        let mut spans = SpanList::for_layout(current.layout());

        diff_exact(&current.view(), &previous.view(), None, 0, &mut spans)?;
        assert_eq!(collect(&spans), vec![Span::scanline(0, 4, 5)]);
        Ok(())
    }

    #[test]
    fn interlaced_diff_visits_one_parity() -> MirrorResult<()> {
        let (mut current, previous) = frames(8, 4)?;
        current.fill(3);
        let mut spans = SpanList::for_layout(current.layout());

        for mode in [DiffMode::Coarse, DiffMode::Exact] {
            let engine = DiffEngine::new(mode, 320);
            engine.diff(
                &current.view(),
                &previous.view(),
                Some(FieldParity::Odd),
                &mut spans,
            )?;
            let rows: Vec<u32> = spans.iter().map(|span| span.y).collect();
            assert_eq!(rows, vec![1, 3], "{mode:?}");

            engine.diff(
                &current.view(),
                &previous.view(),
                Some(FieldParity::Even),
                &mut spans,
            )?;
            let rows: Vec<u32> = spans.iter().map(|span| span.y).collect();
            assert_eq!(rows, vec![0, 2], "{mode:?}");
        }
        Ok(())
    }

    #[test]
    fn applying_spans_reproduces_current_frame() -> MirrorResult<()> {
        let layout = FrameLayout::new(37, 23, 96)?;
        for (seed, density) in [(1u64, 2u64), (7, 20), (42, 75)] {
            let mut previous = Frame::with_layout(layout)?;
            scribble(&mut previous, seed, 50);
            let mut current = Frame::with_layout(layout)?;
            current.copy_from(&previous.view())?;
            scribble(&mut current, seed.wrapping_mul(31), density);

            for mode in [DiffMode::Coarse, DiffMode::Exact] {
                for threshold in [0, 3, 320] {
                    let engine = DiffEngine::new(mode, threshold);
                    let mut spans = SpanList::for_layout(layout);
                    engine.diff(&current.view(), &previous.view(), None, &mut spans)?;
                    assert!(spans.len() <= layout.max_spans());

                    let mut patched = Frame::with_layout(layout)?;
                    patched.copy_from(&previous.view())?;
                    let mut last_y = 0;
                    for span in &spans {
                        assert!(span.is_well_formed());
                        assert!(span.y >= last_y);
                        last_y = span.y;
                        patched.apply_span(&current.view(), span);
                    }
                    for y in 0..layout.height() {
                        assert_eq!(patched.row(y), current.row(y), "{mode:?} row {y}");
                    }
                }
            }
        }
        Ok(())
    }

    #[test]
    fn identical_frames_produce_no_spans() -> MirrorResult<()> {
        let (mut current, mut previous) = frames(16, 4)?;
        scribble(&mut current, 3, 60);
        previous.copy_from(&current.view())?;
        let mut spans = SpanList::for_layout(current.layout());

        assert_eq!(
            diff_coarse(&current.view(), &previous.view(), None, &mut spans)?,
            0
        );
        assert_eq!(
            diff_exact(&current.view(), &previous.view(), None, 320, &mut spans)?,
            0
        );
        Ok(())
    }

    #[test]
    fn full_frame_mode_ignores_content() -> MirrorResult<()> {
        let (current, previous) = frames(5, 3)?;
        let mut spans = SpanList::for_layout(current.layout());
        DiffEngine::new(DiffMode::FullFrame, 0).diff(
            &current.view(),
            &previous.view(),
            None,
            &mut spans,
        )?;
        assert_eq!(collect(&spans), vec![Span::full_frame(current.layout())]);
        assert_eq!(spans.total_pixels(), 15);
        Ok(())
    }

    #[test]
    fn mismatched_dimensions_are_rejected() -> MirrorResult<()> {
        let current = Frame::new(4, 4)?;
        let previous = Frame::new(4, 5)?;
        let mut spans = SpanList::with_capacity(8);
        let err = diff_coarse(&current.view(), &previous.view(), None, &mut spans);
        assert!(matches!(err, Err(MirrorError::InvalidFrame(_))));
        Ok(())
    }
}
