use crate::span::{Span, SpanList};

/// Merge cost limits for [`merge_spans`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergePolicy {
    /// Maximum number of unchanged pixels a single merge may add.
    pub threshold: u32,
    /// When set, a merged span must fit in one task of this many bytes.
    pub max_task_bytes: Option<usize>,
    /// Wire bytes per pixel, for the task size check.
    pub bytes_per_pixel: usize,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            threshold: 320,
            max_task_bytes: None,
            bytes_per_pixel: 2,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub merges: u32,
    /// Unchanged pixels added by all merges. Overlapping spans can make a
    /// single merge's waste negative, so this is signed.
    pub wasted_pixels: i64,
}

#[derive(Clone, Copy)]
struct MergeCandidate {
    x: u32,
    y: u32,
    end_x: u32,
    end_y: u32,
    last_scan_end_x: u32,
    size: u64,
}

impl MergeCandidate {
    #[inline(always)]
    fn bounding(i: &Span, j: &Span) -> Self {
        let x = i.x.min(j.x);
        let y = i.y.min(j.y);
        let end_x = i.end_x.max(j.end_x);
        let end_y = i.end_y.max(j.end_y);
        // The last scanline belongs to whichever span reaches lowest; when
        // both end on the same row it is the union of their last rows.
        let last_scan_end_x = if end_y > i.end_y {
            j.last_scan_end_x
        } else if end_y > j.end_y {
            i.last_scan_end_x
        } else {
            i.last_scan_end_x.max(j.last_scan_end_x)
        };
        Self {
            x,
            y,
            end_x,
            end_y,
            last_scan_end_x,
            size: Span::cost(x, y, end_x, end_y, last_scan_end_x),
        }
    }

    #[inline(always)]
    fn into_span(self) -> Span {
        Span {
            x: self.x,
            y: self.y,
            end_x: self.end_x,
            end_y: self.end_y,
            last_scan_end_x: self.last_scan_end_x,
            size: self.size as u32,
        }
    }
}

/// Greedily merge nearby spans in place when the merged shape costs at most
/// `policy.threshold` extra pixels.
///
/// For each span the list is scanned forward while the candidate starts no
/// lower than the span's end row. The list stays non-decreasing in `y` and
/// never grows.
pub fn merge_spans(spans: &mut SpanList, policy: &MergePolicy) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    let max_pixels = policy
        .max_task_bytes
        .map(|bytes| (bytes / policy.bytes_per_pixel.max(1)) as u64);

    let mut cursor = spans.head();
    while let Some(i) = cursor {
        let mut prev = i;
        let mut candidate = spans.next(i);
        while let Some(j) = candidate {
            let (span_i, span_j) = (*spans.get(i), *spans.get(j));
            if span_j.y > span_i.end_y {
                break;
            }

            let merged = MergeCandidate::bounding(&span_i, &span_j);
            let wasted = merged.size as i64 - span_i.size as i64 - span_j.size as i64;
            let fits = max_pixels.is_none_or(|max| merged.size <= max);
            if wasted <= policy.threshold as i64 && fits {
                *spans.get_mut(i) = merged.into_span();
                spans.unlink_after(prev);
                outcome.merges += 1;
                outcome.wasted_pixels += wasted;
            } else {
                prev = j;
            }
            candidate = spans.next(prev);
        }
        cursor = spans.next(i);
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{DiffEngine, DiffMode};
    use crate::frame::Frame;
    use crate::error::MirrorResult;

    fn policy(threshold: u32) -> MergePolicy {
        MergePolicy {
            threshold,
            ..MergePolicy::default()
        }
    }

    #[test]
    fn nearly_unchanged_next_row_is_absorbed() {
        let mut spans = SpanList::with_capacity(2);
        spans.push(Span::scanline(0, 0, 10));
        // Covers x 0..10 on row 1 but only two pixels of it changed.
        spans.push(Span {
            x: 0,
            y: 1,
            end_x: 10,
            end_y: 2,
            last_scan_end_x: 10,
            size: 2,
        });

        let outcome = merge_spans(&mut spans, &policy(8));
        assert_eq!(outcome.merges, 1);
        assert_eq!(outcome.wasted_pixels, 8);
        let merged: Vec<Span> = spans.iter().copied().collect();
        assert_eq!(
            merged,
            vec![Span {
                x: 0,
                y: 0,
                end_x: 10,
                end_y: 2,
                last_scan_end_x: 10,
                size: 20,
            }]
        );
    }

    #[test]
    fn waste_above_threshold_keeps_spans_apart() {
        let mut spans = SpanList::with_capacity(2);
        spans.push(Span::scanline(0, 0, 4));
        spans.push(Span::scanline(0, 20, 24));

        let outcome = merge_spans(&mut spans, &policy(15));
        assert_eq!(outcome.merges, 0);
        assert_eq!(spans.len(), 2);

        let outcome = merge_spans(&mut spans, &policy(16));
        assert_eq!(outcome.merges, 1);
        assert_eq!(spans.iter().next().copied(), Some(Span::scanline(0, 0, 24)));
    }

    #[test]
    fn task_size_limit_blocks_merge() {
        let mut spans = SpanList::with_capacity(2);
        spans.push(Span::scanline(0, 0, 10));
        spans.push(Span::scanline(1, 0, 10));
        let limited = MergePolicy {
            threshold: 320,
            max_task_bytes: Some(30),
            bytes_per_pixel: 2,
        };
        assert_eq!(merge_spans(&mut spans, &limited).merges, 0);
        assert_eq!(spans.len(), 2);
    }

    #[test]
    fn ragged_last_row_is_kept_when_lower_span_is_shorter() {
        let mut spans = SpanList::with_capacity(2);
        spans.push(Span::scanline(4, 2, 12));
        spans.push(Span::scanline(5, 2, 5));

        merge_spans(&mut spans, &policy(0));
        let merged = *spans.iter().next().unwrap();
        assert_eq!(
            merged,
            Span {
                x: 2,
                y: 4,
                end_x: 12,
                end_y: 6,
                last_scan_end_x: 5,
                size: 13,
            }
        );
        assert!(merged.is_well_formed());
    }

    #[test]
    fn merged_spans_still_cover_every_change() -> MirrorResult<()> {
        let mut previous = Frame::new(64, 32)?;
        previous.fill(0x1111);
        let mut current = Frame::new(64, 32)?;
        current.copy_from(&previous.view())?;
        current.fill_rect(3, 2, 10, 5, 0xF800);
        current.fill_rect(40, 3, 4, 12, 0x07E0);
        current.fill_rect(20, 20, 1, 1, 0x001F);
        current.fill_rect(0, 31, 64, 1, 0xFFFF);

        for threshold in [0, 8, 64, 320, 5000] {
            let mut spans = SpanList::for_layout(current.layout());
            DiffEngine::new(DiffMode::Exact, 4).diff(
                &current.view(),
                &previous.view(),
                None,
                &mut spans,
            )?;
            let before = spans.len();
            let before_pixels = spans.total_pixels();
            let outcome = merge_spans(&mut spans, &policy(threshold));

            assert!(spans.len() <= before);
            assert_eq!(before - spans.len(), outcome.merges as usize);
            assert_eq!(
                spans.total_pixels() as i64,
                before_pixels as i64 + outcome.wasted_pixels
            );

            let mut last_y = 0;
            for span in &spans {
                assert!(span.is_well_formed());
                assert!(span.y >= last_y, "ordering broken at threshold {threshold}");
                last_y = span.y;
            }
            for y in 0..32 {
                for x in 0..64 {
                    if current.pixel(x, y) != previous.pixel(x, y) {
                        assert!(
                            spans.iter().any(|span| span.contains(x, y)),
                            "pixel ({x},{y}) lost at threshold {threshold}"
                        );
                    }
                }
            }
        }
        Ok(())
    }
}
