//! Byte-range to page-segment translation.
//!
//! A read or write against the logical file is broken into [`Segment`]s, each
//! confined to a single page. For writes that begin past end-of-file the
//! splitter starts at the old size so the gap is emitted as zero-fill
//! segments ahead of the caller's data.
//!
//! ```text
//!  old size         requested offset
//!     |                   |
//!  ---+---- ZeroFill -----+------ DataCopy ------>
//! ```

use crate::error::PageIoError;
use std::ops::Range;

/// Smallest page size accepted by [`PageGeometry::new`].
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest page size accepted by [`PageGeometry::new`] (1 MiB).
pub const MAX_PAGE_SIZE: usize = 1 << 20;

/// Fixed page size expressed as a shift, so index math stays in shifts and masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGeometry {
    shift: u32,
}

impl PageGeometry {
    pub fn new(page_size: usize) -> Result<Self, PageIoError> {
        if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(PageIoError::invalid_input(format!(
                "page size {} must be a power of two between {} and {}",
                page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        Ok(Self {
            shift: page_size.trailing_zeros(),
        })
    }

    pub fn page_size(&self) -> usize {
        1 << self.shift
    }

    pub fn index_of(&self, pos: u64) -> u64 {
        pos >> self.shift
    }

    pub fn offset_in_page(&self, pos: u64) -> usize {
        (pos & (self.page_size() as u64 - 1)) as usize
    }

    pub fn page_start(&self, index: u64) -> u64 {
        index << self.shift
    }

    /// Number of distinct pages touched by `[start, start + len)`.
    pub fn pages_spanned(&self, start: u64, len: u64) -> u64 {
        if len == 0 {
            return 0;
        }
        let last = start.saturating_add(len - 1);
        self.index_of(last) - self.index_of(start) + 1
    }
}

/// How the bytes of a segment are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Lies before the requested offset: zero `[offset, page_size)`, copy nothing.
    ZeroFill,
    /// Caller bytes copied into `[offset, offset + len)`.
    DataCopy,
    /// A fresh page past the old end-of-file: zero the page tail, then copy.
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub page_index: u64,
    /// Offset inside the page.
    pub offset: usize,
    pub len: usize,
    pub kind: SegmentKind,
}

impl Segment {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    pub fn copies_data(&self) -> bool {
        !matches!(self.kind, SegmentKind::ZeroFill)
    }

    /// Bytes of the page that must be zeroed before any copy.
    pub fn zero_range(&self, page_size: usize) -> Option<Range<usize>> {
        match self.kind {
            SegmentKind::ZeroFill | SegmentKind::Mixed => Some(self.offset..page_size),
            SegmentKind::DataCopy => None,
        }
    }
}

/// Iterator over the segments of one request. Built by [`split_write`] or [`split_read`].
#[derive(Debug, Clone)]
pub struct Segments {
    geometry: PageGeometry,
    pos: u64,
    end: u64,
    data_start: u64,
    old_size: u64,
    zero_fill: bool,
}

impl Iterator for Segments {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        if self.pos >= self.end {
            return None;
        }
        let page_size = self.geometry.page_size();
        let page_index = self.geometry.index_of(self.pos);
        let offset = self.geometry.offset_in_page(self.pos);
        let remaining = self.end - self.pos;
        let mut len = (page_size - offset).min(remaining.min(page_size as u64) as usize);

        let kind = if self.zero_fill && self.pos < self.data_start {
            // cap so the boundary lands exactly on the requested offset
            let gap = self.data_start - self.pos;
            len = len.min(gap.min(page_size as u64) as usize);
            SegmentKind::ZeroFill
        } else if self.zero_fill && offset == 0 && self.pos >= self.old_size && len < page_size {
            SegmentKind::Mixed
        } else {
            SegmentKind::DataCopy
        };

        self.pos += len as u64;
        Some(Segment {
            page_index,
            offset,
            len,
            kind,
        })
    }
}

/// Split a write of `size` bytes at `offset` against a file of `current_size`.
///
/// Fails only when `offset + size` overflows.
pub fn split_write(
    geometry: PageGeometry,
    offset: u64,
    size: usize,
    current_size: u64,
) -> Result<Segments, PageIoError> {
    let end = offset.checked_add(size as u64).ok_or_else(|| {
        PageIoError::invalid_input(format!("write range {}+{} overflows", offset, size))
    })?;
    // zero-length writes never extend the file
    let pos = if size == 0 { end } else { offset.min(current_size) };
    Ok(Segments {
        geometry,
        pos,
        end,
        data_start: offset,
        old_size: current_size,
        zero_fill: true,
    })
}

/// Number of bytes a read of `size` at `offset` may return from a file of `current_size`.
pub fn clamp_read(offset: u64, size: usize, current_size: u64) -> usize {
    if offset >= current_size {
        return 0;
    }
    (current_size - offset).min(size as u64) as usize
}

/// Split a read, clamped to end-of-file. A read at or past EOF yields no segments.
pub fn split_read(geometry: PageGeometry, offset: u64, size: usize, current_size: u64) -> Segments {
    let len = clamp_read(offset, size, current_size);
    Segments {
        geometry,
        pos: offset,
        end: offset + len as u64,
        data_start: offset,
        old_size: current_size,
        zero_fill: false,
    }
}
