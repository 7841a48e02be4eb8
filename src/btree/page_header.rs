//! B-tree page header.
//!
//! ```text
//! offset  size  field
//! ------  ----  ----------------------------------------------
//!      0     1  page flag (1 = internal, 2 = leaf)
//!      1     2  offset of the first freeblock, 0 if none
//!      3     2  number of cells
//!      5     2  start of the cell content area (0 means 65536)
//!      7     1  fragmented free bytes
//!      8     4  right child page number (internal pages only)
//! ```
//!
//! The header starts at offset 0, except on page 1 where it follows the
//! 100-byte file header. All integers are big-endian.

use crate::common::{Error, PageNo, Result};
use crate::storage::FileHeader;

pub const PAGE_INTERNAL: u8 = 1;
pub const PAGE_LEAF: u8 = 2;

pub const OFFSET_FLAG: usize = 0;
pub const OFFSET_FIRST_FREEBLOCK: usize = 1;
pub const OFFSET_CELL_COUNT: usize = 3;
pub const OFFSET_CONTENT_START: usize = 5;
pub const OFFSET_FRAGMENTED: usize = 7;
pub const OFFSET_RIGHT_CHILD: usize = 8;

pub const LEAF_HEADER_SIZE: usize = 8;
pub const INTERNAL_HEADER_SIZE: usize = 12;

/// Where the page header begins on page 1.
pub const PAGE1_HEADER_OFFSET: usize = FileHeader::SIZE;

/// Offset of the page header within page `no`.
#[inline]
pub fn header_offset(no: PageNo) -> usize {
    if no == PageNo::FIRST {
        PAGE1_HEADER_OFFSET
    } else {
        0
    }
}

#[inline]
pub(crate) fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

#[inline]
pub(crate) fn write_u16(data: &mut [u8], at: usize, value: u16) {
    data[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub(crate) fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

#[inline]
pub(crate) fn write_u32(data: &mut [u8], at: usize, value: u32) {
    data[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

/// Decoded page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub is_leaf: bool,
    pub first_freeblock: u16,
    pub cell_count: u16,
    /// Start of the cell content area, already mapped from 0 to 65536.
    pub content_start: u32,
    pub fragmented: u8,
    /// Zero on leaf pages.
    pub right_child: u32,
}

impl PageHeader {
    /// Header of an empty page whose content area ends at `usable`.
    pub fn empty(is_leaf: bool, usable: usize) -> Self {
        Self {
            is_leaf,
            first_freeblock: 0,
            cell_count: 0,
            content_start: usable as u32,
            fragmented: 0,
            right_child: 0,
        }
    }

    /// # Errors
    /// Returns `Error::Corrupt` for an unknown page flag.
    pub fn read(data: &[u8], offset: usize, no: PageNo) -> Result<Self> {
        let flag = data[offset + OFFSET_FLAG];
        let is_leaf = match flag {
            PAGE_LEAF => true,
            PAGE_INTERNAL => false,
            _ => return Err(Error::corrupt(format!("wrong page flag {} for page {}", flag, no))),
        };
        let content_start = match read_u16(data, offset + OFFSET_CONTENT_START) {
            0 => 65536,
            n => n as u32,
        };
        Ok(Self {
            is_leaf,
            first_freeblock: read_u16(data, offset + OFFSET_FIRST_FREEBLOCK),
            cell_count: read_u16(data, offset + OFFSET_CELL_COUNT),
            content_start,
            fragmented: data[offset + OFFSET_FRAGMENTED],
            right_child: if is_leaf {
                0
            } else {
                read_u32(data, offset + OFFSET_RIGHT_CHILD)
            },
        })
    }

    pub fn write(&self, data: &mut [u8], offset: usize) {
        data[offset + OFFSET_FLAG] = if self.is_leaf { PAGE_LEAF } else { PAGE_INTERNAL };
        write_u16(data, offset + OFFSET_FIRST_FREEBLOCK, self.first_freeblock);
        write_u16(data, offset + OFFSET_CELL_COUNT, self.cell_count);
        // 65536 does not fit in two bytes and is stored as 0.
        write_u16(data, offset + OFFSET_CONTENT_START, self.content_start as u16);
        data[offset + OFFSET_FRAGMENTED] = self.fragmented;
        if !self.is_leaf {
            write_u32(data, offset + OFFSET_RIGHT_CHILD, self.right_child);
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        if self.is_leaf {
            LEAF_HEADER_SIZE
        } else {
            INTERNAL_HEADER_SIZE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_offset() {
        assert_eq!(header_offset(PageNo::FIRST), 100);
        assert_eq!(header_offset(PageNo::new(2)), 0);
    }

    #[test]
    fn test_write_read() {
        let mut data = vec![0u8; 1024];
        let header = PageHeader {
            is_leaf: false,
            first_freeblock: 300,
            cell_count: 7,
            content_start: 500,
            fragmented: 3,
            right_child: 42,
        };
        header.write(&mut data, 0);
        assert_eq!(data[0], PAGE_INTERNAL);
        assert_eq!(&data[8..12], &[0, 0, 0, 42]);
        assert_eq!(PageHeader::read(&data, 0, PageNo::new(2)).unwrap(), header);
        assert_eq!(header.size(), 12);
    }

    #[test]
    fn test_full_size_content_start() {
        let mut data = vec![0u8; 65536];
        let header = PageHeader::empty(true, 65536);
        header.write(&mut data, 0);
        assert_eq!(read_u16(&data, OFFSET_CONTENT_START), 0);
        assert_eq!(PageHeader::read(&data, 0, PageNo::new(3)).unwrap().content_start, 65536);
    }

    #[test]
    fn test_bad_flag_is_corrupt() {
        let data = vec![9u8; 512];
        assert!(matches!(
            PageHeader::read(&data, 0, PageNo::new(5)),
            Err(Error::Corrupt(_))
        ));
    }
}
