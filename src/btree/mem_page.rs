//! Parsed view of a B-tree page.
//!
//! ```text
//! ┌────────┬─────────────────┬─────────────┬──────────────────────┐
//! │ header │ cell pointers → │ unallocated │ ← cell content area  │
//! └────────┴─────────────────┴─────────────┴──────────────────────┘
//!                                          ^ content_start
//! ```
//!
//! The cell pointer array holds 2-byte offsets sorted by key. Cell content
//! grows from the end of the page toward the pointers. Space freed inside
//! the content area is kept on a list of freeblocks (2-byte next offset,
//! 2-byte size) sorted by offset; gaps smaller than four bytes cannot hold
//! a freeblock and are counted as fragmented bytes instead.
//!
//! A [`MemPage`] caches the header fields and works on a borrowed page
//! buffer. It is recomputed from the page content whenever needed and never
//! stored on disk.

use std::cmp::Ordering;

use crate::common::{Error, PageNo, Result};

use super::cell::{parse_cell, CellInfo, PayloadLimits, MIN_CELL_SIZE};
use super::cursor::Location;
use super::page_header::{
    header_offset, read_u16, write_u16, write_u32, PageHeader, OFFSET_RIGHT_CHILD,
};

/// Result of searching a page for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchResult {
    /// Page to descend into; `PageNo::NONE` on a leaf.
    pub child: PageNo,
    /// Cell index the location refers to. On an internal page this is the
    /// index of the child pointer: a cell index, or the cell count for the
    /// right child.
    pub index: usize,
    pub location: Location,
}

/// Parsed B-tree page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemPage {
    no: PageNo,
    header_offset: usize,
    header: PageHeader,
    usable: usize,
}

impl MemPage {
    /// Parse the header of page `no` held in `data`.
    ///
    /// # Errors
    /// Returns `Error::Corrupt` for a bad page flag, or a cell count or
    /// content start that does not fit the page.
    pub fn parse(no: PageNo, data: &[u8]) -> Result<Self> {
        let header_offset = header_offset(no);
        let usable = data.len();
        let header = PageHeader::read(data, header_offset, no)?;
        let page = Self {
            no,
            header_offset,
            header,
            usable,
        };
        if page.pointer_end() > usable {
            return Err(Error::corrupt(format!("wrong cell number for {}", no)));
        }
        if (header.content_start as usize) < page.pointer_end() || header.content_start as usize > usable {
            return Err(Error::corrupt(format!("bad content start for {}", no)));
        }
        Ok(page)
    }

    /// Format `data` as an empty page.
    pub fn init(no: PageNo, data: &mut [u8], is_leaf: bool) -> Self {
        let header_offset = header_offset(no);
        let usable = data.len();
        data[header_offset..].fill(0);
        let header = PageHeader::empty(is_leaf, usable);
        header.write(data, header_offset);
        Self {
            no,
            header_offset,
            header,
            usable,
        }
    }

    #[inline]
    pub fn no(&self) -> PageNo {
        self.no
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.header.is_leaf
    }

    #[inline]
    pub fn cell_count(&self) -> usize {
        self.header.cell_count as usize
    }

    #[inline]
    pub fn header(&self) -> &PageHeader {
        &self.header
    }

    #[inline]
    pub fn right_child(&self) -> PageNo {
        PageNo::new(self.header.right_child)
    }

    pub fn set_right_child(&mut self, data: &mut [u8], child: PageNo) {
        debug_assert!(!self.is_leaf());
        self.header.right_child = child.0;
        write_u32(data, self.header_offset + OFFSET_RIGHT_CHILD, child.0);
    }

    #[inline]
    fn pointer_start(&self) -> usize {
        self.header_offset + self.header.size()
    }

    #[inline]
    fn pointer_end(&self) -> usize {
        self.pointer_start() + 2 * self.cell_count()
    }

    // ========================================================================
    // Cells
    // ========================================================================

    /// Offset of cell `i` in the page.
    ///
    /// # Errors
    /// Returns `Error::Corrupt` if the pointer lands outside the content area.
    pub fn cell_offset(&self, data: &[u8], i: usize) -> Result<usize> {
        debug_assert!(i < self.cell_count());
        let offset = read_u16(data, self.pointer_start() + 2 * i) as usize;
        if offset < self.pointer_end() || offset >= self.usable {
            return Err(Error::corrupt(format!("cell pointer {} out of range on {}", i, self.no)));
        }
        Ok(offset)
    }

    pub fn cell(&self, data: &[u8], i: usize, limits: &PayloadLimits) -> Result<CellInfo> {
        let offset = self.cell_offset(data, i)?;
        parse_cell(data, offset, self.is_leaf(), limits)
    }

    /// Raw bytes of cell `i`.
    pub fn cell_bytes<'a>(&self, data: &'a [u8], i: usize, limits: &PayloadLimits) -> Result<&'a [u8]> {
        let cell = self.cell(data, i, limits)?;
        Ok(&data[cell.offset..cell.offset + cell.size])
    }

    /// Copies of every cell, in key order.
    pub fn cells(&self, data: &[u8], limits: &PayloadLimits) -> Result<Vec<Vec<u8>>> {
        (0..self.cell_count())
            .map(|i| self.cell_bytes(data, i, limits).map(<[u8]>::to_vec))
            .collect()
    }

    /// Child page referenced by child pointer `i`: cell `i`'s left child, or
    /// the right child for `i == cell_count`.
    pub fn child(&self, data: &[u8], i: usize, limits: &PayloadLimits) -> Result<PageNo> {
        if i == self.cell_count() {
            Ok(self.right_child())
        } else {
            Ok(PageNo::new(self.cell(data, i, limits)?.left_child))
        }
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Locate `key` on this page.
    ///
    /// The lowest and highest cells are checked first so that ascending
    /// and descending insert patterns resolve without a binary search.
    ///
    /// On a leaf, `Equal` names the matching cell, `Left` the first cell
    /// greater than the key and `Right` the last cell when the key is past
    /// every cell. An empty leaf reports `Invalid` at index 0.
    ///
    /// On an internal page the result names the child to descend into: the
    /// left child of the first cell whose key is not less than `key`
    /// (`Equal` or `Left`), else the right child (`Right`).
    pub fn search(&self, data: &[u8], key: &[u8], limits: &PayloadLimits) -> Result<SearchResult> {
        let n = self.cell_count();
        if n == 0 {
            return Ok(if self.is_leaf() {
                SearchResult {
                    child: PageNo::NONE,
                    index: 0,
                    location: Location::Invalid,
                }
            } else {
                SearchResult {
                    child: self.right_child(),
                    index: 0,
                    location: Location::Right,
                }
            });
        }

        let low = self.cell(data, 0, limits)?;
        match key.cmp(low.key(data)) {
            Ordering::Less => return Ok(self.result_at(0, low, Location::Left)),
            Ordering::Equal => return Ok(self.result_at(0, low, Location::Equal)),
            Ordering::Greater => {}
        }

        let high = self.cell(data, n - 1, limits)?;
        match key.cmp(high.key(data)) {
            Ordering::Equal => return Ok(self.result_at(n - 1, high, Location::Equal)),
            Ordering::Greater => return Ok(self.past_end()),
            Ordering::Less => {}
        }

        // low < key < high: find the first cell not less than key.
        let (mut lo, mut hi) = (1, n - 1);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let cell = self.cell(data, mid, limits)?;
            match key.cmp(cell.key(data)) {
                Ordering::Equal => return Ok(self.result_at(mid, cell, Location::Equal)),
                Ordering::Greater => lo = mid + 1,
                Ordering::Less => hi = mid,
            }
        }
        let cell = self.cell(data, lo, limits)?;
        let location = if key == cell.key(data) {
            Location::Equal
        } else {
            Location::Left
        };
        Ok(self.result_at(lo, cell, location))
    }

    fn result_at(&self, index: usize, cell: CellInfo, location: Location) -> SearchResult {
        SearchResult {
            child: if self.is_leaf() {
                PageNo::NONE
            } else {
                PageNo::new(cell.left_child)
            },
            index,
            location,
        }
    }

    fn past_end(&self) -> SearchResult {
        if self.is_leaf() {
            SearchResult {
                child: PageNo::NONE,
                index: self.cell_count() - 1,
                location: Location::Right,
            }
        } else {
            SearchResult {
                child: self.right_child(),
                index: self.cell_count(),
                location: Location::Right,
            }
        }
    }

    // ========================================================================
    // Space management
    // ========================================================================

    /// Freeblocks as `(offset, size)`, in offset order.
    fn freeblocks(&self, data: &[u8]) -> Result<Vec<(usize, usize)>> {
        let mut blocks = Vec::new();
        let mut next = self.header.first_freeblock as usize;
        let mut last_end = 0;
        while next != 0 {
            if next < last_end || next + 4 > self.usable {
                return Err(Error::corrupt(format!("freeblock list out of order on {}", self.no)));
            }
            let size = read_u16(data, next + 2) as usize;
            if size < 4 || next + size > self.usable {
                return Err(Error::corrupt(format!("bad freeblock size on {}", self.no)));
            }
            blocks.push((next, size));
            last_end = next + size;
            next = read_u16(data, next) as usize;
        }
        Ok(blocks)
    }

    fn write_freeblocks(&mut self, data: &mut [u8], blocks: &[(usize, usize)]) {
        for (i, &(offset, size)) in blocks.iter().enumerate() {
            let next = blocks.get(i + 1).map_or(0, |b| b.0);
            write_u16(data, offset, next as u16);
            write_u16(data, offset + 2, size as u16);
        }
        self.header.first_freeblock = blocks.first().map_or(0, |b| b.0 as u16);
    }

    fn write_header(&self, data: &mut [u8]) {
        self.header.write(data, self.header_offset);
    }

    /// Bytes between the pointer array and the content area.
    #[inline]
    fn gap(&self) -> usize {
        self.header.content_start as usize - self.pointer_end()
    }

    /// Total free bytes: gap, freeblocks and fragments.
    pub fn free_space(&self, data: &[u8]) -> Result<usize> {
        let blocks: usize = self.freeblocks(data)?.iter().map(|b| b.1).sum();
        Ok(self.gap() + blocks + self.header.fragmented as usize)
    }

    /// Find room for `size` content bytes plus a 2-byte pointer: first-fit
    /// from the freeblocks, then the gap, then the gap after defragmenting.
    /// Returns the content offset, or `None` if the page lacks the space.
    fn allocate(&mut self, data: &mut [u8], size: usize) -> Result<Option<usize>> {
        if self.gap() >= 2 && self.header.first_freeblock != 0 {
            if let Some(offset) = self.allocate_from_freeblock(data, size)? {
                return Ok(Some(offset));
            }
        }
        if self.gap() < 2 + size {
            if self.free_space(data)? < 2 + size {
                return Ok(None);
            }
            self.defragment(data, &PayloadLimits::new(self.usable))?;
        }
        let start = self.header.content_start as usize - size;
        self.header.content_start = start as u32;
        Ok(Some(start))
    }

    fn allocate_from_freeblock(&mut self, data: &mut [u8], size: usize) -> Result<Option<usize>> {
        let mut blocks = self.freeblocks(data)?;
        for i in 0..blocks.len() {
            let (offset, block_size) = blocks[i];
            if block_size < size {
                continue;
            }
            let remainder = block_size - size;
            if remainder < 4 {
                let fragmented = self.header.fragmented as usize + remainder;
                if fragmented > u8::MAX as usize {
                    continue;
                }
                self.header.fragmented = fragmented as u8;
                blocks.remove(i);
                self.write_freeblocks(data, &blocks);
                return Ok(Some(offset));
            }
            // Take the tail so the block keeps its offset.
            blocks[i].1 = remainder;
            self.write_freeblocks(data, &blocks);
            return Ok(Some(offset + remainder));
        }
        Ok(None)
    }

    /// Insert `cell` so that it becomes cell `index`.
    ///
    /// Returns `false`, leaving the page untouched, if it does not fit.
    pub fn insert_cell(&mut self, data: &mut [u8], index: usize, cell: &[u8]) -> Result<bool> {
        debug_assert!(index <= self.cell_count());
        debug_assert!(cell.len() >= MIN_CELL_SIZE);
        if self.cell_count() == u16::MAX as usize {
            return Ok(false);
        }
        let Some(offset) = self.allocate(data, cell.len())? else {
            return Ok(false);
        };
        data[offset..offset + cell.len()].copy_from_slice(cell);

        let at = self.pointer_start() + 2 * index;
        let end = self.pointer_end();
        data.copy_within(at..end, at + 2);
        write_u16(data, at, offset as u16);

        self.header.cell_count += 1;
        self.write_header(data);
        Ok(true)
    }

    /// Remove cell `index`, returning its space to the page.
    pub fn drop_cell(&mut self, data: &mut [u8], index: usize, limits: &PayloadLimits) -> Result<()> {
        debug_assert!(index < self.cell_count());
        let cell = self.cell(data, index, limits)?;

        let at = self.pointer_start() + 2 * index;
        let end = self.pointer_end();
        data.copy_within(at + 2..end, at);
        self.header.cell_count -= 1;

        if self.cell_count() == 0 {
            let right_child = self.header.right_child;
            self.header = PageHeader::empty(self.is_leaf(), self.usable);
            self.header.right_child = right_child;
            self.write_header(data);
            return Ok(());
        }

        self.free(data, cell.offset, cell.size)?;
        self.write_header(data);
        Ok(())
    }

    /// Return `size` bytes at `offset` to the freeblock list, merging
    /// neighbours and absorbing blocks at the content start into the gap.
    fn free(&mut self, data: &mut [u8], offset: usize, size: usize) -> Result<()> {
        let mut blocks = self.freeblocks(data)?;
        blocks.push((offset, size));
        blocks.sort_unstable_by_key(|b| b.0);

        let mut fragmented = self.header.fragmented as usize;
        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(blocks.len());
        for (offset, size) in blocks {
            if let Some(last) = merged.last_mut() {
                let last_end = last.0 + last.1;
                if offset < last_end {
                    return Err(Error::corrupt(format!("overlapping free space on {}", self.no)));
                }
                let between = offset - last_end;
                if between <= 3 {
                    // The bytes between were fragments.
                    fragmented = fragmented.saturating_sub(between);
                    last.1 = offset + size - last.0;
                    continue;
                }
            }
            merged.push((offset, size));
        }

        let content_start = self.header.content_start as usize;
        if let Some(&(first, first_size)) = merged.first() {
            let between = first.saturating_sub(content_start);
            if between <= 3 {
                fragmented = fragmented.saturating_sub(between);
                self.header.content_start = (first + first_size) as u32;
                merged.remove(0);
            }
        }

        self.header.fragmented = fragmented as u8;
        self.write_freeblocks(data, &merged);
        Ok(())
    }

    /// Move every cell to the end of the page, leaving one contiguous gap.
    pub fn defragment(&mut self, data: &mut [u8], limits: &PayloadLimits) -> Result<()> {
        let cells = self.cells(data, limits)?;
        let right_child = self.right_child();
        *self = Self::rebuild(self.no, data, self.is_leaf(), &cells, right_child)?;
        Ok(())
    }

    /// Rewrite page `no` to hold exactly `cells`, in order.
    ///
    /// # Errors
    /// Returns `Error::Corrupt` if the cells do not fit.
    pub fn rebuild(
        no: PageNo,
        data: &mut [u8],
        is_leaf: bool,
        cells: &[Vec<u8>],
        right_child: PageNo,
    ) -> Result<Self> {
        let mut page = Self::init(no, data, is_leaf);
        let pointer_end = page.pointer_start() + 2 * cells.len();
        let content: usize = cells.iter().map(Vec::len).sum();
        if pointer_end + content > page.usable || cells.len() > u16::MAX as usize {
            return Err(Error::corrupt(format!("{} cells do not fit on {}", cells.len(), no)));
        }

        let mut start = page.usable;
        for (i, cell) in cells.iter().enumerate() {
            start -= cell.len();
            data[start..start + cell.len()].copy_from_slice(cell);
            write_u16(data, page.pointer_start() + 2 * i, start as u16);
        }
        page.header.cell_count = cells.len() as u16;
        page.header.content_start = start as u32;
        page.header.right_child = if is_leaf { 0 } else { right_child.0 };
        page.write_header(data);
        Ok(page)
    }
}
