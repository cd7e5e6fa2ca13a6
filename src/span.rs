use crate::frame::FrameLayout;

/// A rectangular run of changed pixels whose final scanline may be shorter
/// than the others.
///
/// Rows `y..end_y - 1` cover columns `x..end_x`; the last row `end_y - 1`
/// covers `x..last_scan_end_x`. `size` is the exact number of covered
/// pixels and is what the merger uses for cost accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Span {
    pub x: u32,
    pub y: u32,
    pub end_x: u32,
    pub end_y: u32,
    pub last_scan_end_x: u32,
    pub size: u32,
}

impl Span {
    /// Span covering `x..end_x` on a single scanline `y`.
    #[inline]
    pub fn scanline(y: u32, x: u32, end_x: u32) -> Self {
        debug_assert!(x < end_x, "empty scanline span {x}..{end_x}");
        Self {
            x,
            y,
            end_x,
            end_y: y + 1,
            last_scan_end_x: end_x,
            size: end_x - x,
        }
    }

    pub fn full_frame(layout: FrameLayout) -> Self {
        let (width, height) = layout.dimensions();
        Self {
            x: 0,
            y: 0,
            end_x: width,
            end_y: height,
            last_scan_end_x: width,
            size: width * height,
        }
    }

    pub fn width(&self) -> u32 {
        self.end_x - self.x
    }

    pub fn height(&self) -> u32 {
        self.end_y - self.y
    }

    /// Pixel count of the shape spanning `x..end_x` over `y..end_y` with the
    /// last row ending at `last_scan_end_x`.
    #[inline]
    pub fn cost(x: u32, y: u32, end_x: u32, end_y: u32, last_scan_end_x: u32) -> u64 {
        (end_x - x) as u64 * (end_y - y - 1) as u64 + (last_scan_end_x - x) as u64
    }

    pub fn contains(&self, px: u32, py: u32) -> bool {
        if py < self.y || py >= self.end_y || px < self.x {
            return false;
        }
        let row_end = if py + 1 == self.end_y {
            self.last_scan_end_x
        } else {
            self.end_x
        };
        px < row_end
    }

    /// Iterates `(y, start_x, end_x)` for every covered scanline.
    pub fn scanlines(&self) -> impl Iterator<Item = (u32, u32, u32)> + '_ {
        (self.y..self.end_y).map(move |row| {
            let row_end = if row + 1 == self.end_y {
                self.last_scan_end_x
            } else {
                self.end_x
            };
            (row, self.x, row_end)
        })
    }

    /// Geometry is internally consistent: non-empty, last scanline within
    /// the rectangle, and `size` matches the shape.
    pub fn is_well_formed(&self) -> bool {
        self.x < self.end_x
            && self.y < self.end_y
            && self.x < self.last_scan_end_x
            && self.last_scan_end_x <= self.end_x
            && self.size as u64
                == Self::cost(
                    self.x,
                    self.y,
                    self.end_x,
                    self.end_y,
                    self.last_scan_end_x,
                )
    }
}

#[derive(Clone, Copy, Debug)]
struct SpanNode {
    span: Span,
    next: Option<usize>,
}

/// Arena-backed singly linked list of spans.
///
/// Nodes are appended in scan order and only ever unlinked, never freed,
/// until the next [`SpanList::clear`]. The arena is sized once for the
/// worst case of a frame layout so the per-frame diff never allocates.
#[derive(Clone, Debug)]
pub struct SpanList {
    nodes: Vec<SpanNode>,
    head: Option<usize>,
    tail: Option<usize>,
    live: usize,
}

impl SpanList {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            head: None,
            tail: None,
            live: 0,
        }
    }

    pub fn for_layout(layout: FrameLayout) -> Self {
        Self::with_capacity(layout.max_spans())
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.head = None;
        self.tail = None;
        self.live = 0;
    }

    /// Number of linked (not yet merged away) spans.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn capacity(&self) -> usize {
        self.nodes.capacity()
    }

    /// Append in scan order. `span.y` must not precede the current tail.
    pub fn push(&mut self, span: Span) -> usize {
        let index = self.nodes.len();
        if let Some(tail) = self.tail {
            debug_assert!(
                self.nodes[tail].span.y <= span.y,
                "span list must be non-decreasing in y"
            );
            self.nodes[tail].next = Some(index);
        } else {
            self.head = Some(index);
        }
        self.nodes.push(SpanNode { span, next: None });
        self.tail = Some(index);
        self.live += 1;
        index
    }

    pub fn head(&self) -> Option<usize> {
        self.head
    }

    pub fn next(&self, index: usize) -> Option<usize> {
        self.nodes[index].next
    }

    pub fn get(&self, index: usize) -> &Span {
        &self.nodes[index].span
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Span {
        &mut self.nodes[index].span
    }

    /// Unlink the node following `prev` and return its span.
    pub(crate) fn unlink_after(&mut self, prev: usize) -> Option<Span> {
        let removed = self.nodes[prev].next?;
        let after = self.nodes[removed].next;
        self.nodes[prev].next = after;
        if self.tail == Some(removed) {
            self.tail = Some(prev);
        }
        self.live -= 1;
        Some(self.nodes[removed].span)
    }

    pub fn iter(&self) -> SpanIter<'_> {
        SpanIter {
            list: self,
            cursor: self.head,
        }
    }

    /// Sum of `size` over the linked spans.
    pub fn total_pixels(&self) -> u64 {
        self.iter().map(|span| span.size as u64).sum()
    }
}

impl<'a> IntoIterator for &'a SpanList {
    type Item = &'a Span;
    type IntoIter = SpanIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct SpanIter<'a> {
    list: &'a SpanList,
    cursor: Option<usize>,
}

impl<'a> Iterator for SpanIter<'a> {
    type Item = &'a Span;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let node = &self.list.nodes[index];
        self.cursor = node.next;
        Some(&node.span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ragged_span_covers_short_last_row() {
        let span = Span {
            x: 2,
            y: 1,
            end_x: 8,
            end_y: 3,
            last_scan_end_x: 4,
            size: 8,
        };
        assert!(span.is_well_formed());
        assert!(span.contains(7, 1));
        assert!(span.contains(3, 2));
        assert!(!span.contains(4, 2));
        assert!(!span.contains(1, 1));
        assert_eq!(
            span.scanlines().collect::<Vec<_>>(),
            vec![(1, 2, 8), (2, 2, 4)]
        );
    }

    #[test]
    fn unlink_keeps_order_and_tail() {
        let mut list = SpanList::with_capacity(4);
        let a = list.push(Span::scanline(0, 0, 4));
        list.push(Span::scanline(1, 0, 4));
        list.push(Span::scanline(2, 1, 3));
        assert_eq!(list.len(), 3);

        assert_eq!(list.unlink_after(a), Some(Span::scanline(1, 0, 4)));
        assert!(list.next(a).is_some());
        assert_eq!(list.unlink_after(a), Some(Span::scanline(2, 1, 3)));
        assert_eq!(list.unlink_after(a), None);
        assert_eq!(list.len(), 1);

        list.push(Span::scanline(3, 0, 1));
        let ys: Vec<u32> = list.iter().map(|span| span.y).collect();
        assert_eq!(ys, vec![0, 3]);
        assert_eq!(list.total_pixels(), 5);
    }

    #[test]
    fn arena_is_sized_for_worst_case() {
        let layout = FrameLayout::packed(5, 3).unwrap();
        let list = SpanList::for_layout(layout);
        assert!(list.capacity() >= 9);
        assert!(list.is_empty());
    }
}
