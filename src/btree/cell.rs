//! Cell codec.
//!
//! ```text
//! leaf cell:      varint data size | varint key size | key | data prefix | [overflow page]
//! internal cell:  left child (4)   | varint key size | key
//! overflow page:  next page (4)    | data
//! ```
//!
//! A leaf cell stores as much of its payload (key followed by data) as the
//! page allows; the rest lives in a chain of overflow pages whose first page
//! number ends the cell. Keys are always stored in full on the page.

use crate::common::{Error, Result};

use super::page_header::{read_u32, write_u32};
use super::varint::{get_varint, put_varint, varint_len};

/// Smallest cell the page can store. A freed cell must be able to hold a
/// freeblock header.
pub const MIN_CELL_SIZE: usize = 4;

/// Overflow page header: the next page number.
pub const OVERFLOW_HEADER_SIZE: usize = 4;

/// How much of a payload stays on the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadLimits {
    pub usable: usize,
    /// Largest payload stored without overflow.
    pub max_local: usize,
    /// Least payload kept on the page once a payload overflows.
    pub min_local: usize,
}

impl PayloadLimits {
    pub fn new(usable: usize) -> Self {
        Self {
            usable,
            max_local: (usable - 12) * 64 / 255 - 23,
            min_local: (usable - 12) * 32 / 255 - 23,
        }
    }

    /// Largest key accepted by the tree.
    #[inline]
    pub fn max_key(&self) -> usize {
        self.min_local
    }

    /// Payload bytes kept in the cell for a payload of `payload` bytes.
    ///
    /// The local part is chosen so the overflow chain's last page is as
    /// full as possible, without dropping below `min_local`.
    pub fn local_size(&self, payload: u64) -> usize {
        if payload <= self.max_local as u64 {
            return payload as usize;
        }
        let min = self.min_local as u64;
        let surplus = min + (payload - min) % (self.usable - OVERFLOW_HEADER_SIZE) as u64;
        if surplus <= self.max_local as u64 {
            surplus as usize
        } else {
            self.min_local
        }
    }

    /// Data bytes carried by each overflow page.
    #[inline]
    pub fn overflow_capacity(&self) -> usize {
        self.usable - OVERFLOW_HEADER_SIZE
    }
}

/// A cell decoded in place.
///
/// Offsets are relative to the buffer the cell was parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellInfo {
    pub offset: usize,
    /// Internal cells only.
    pub left_child: u32,
    pub key_start: usize,
    pub key_len: usize,
    /// Leaf cells only: total data length, local and overflow.
    pub data_size: u64,
    /// Leaf cells only: data bytes stored in the cell.
    pub local_data: usize,
    /// First overflow page, 0 if the payload is entirely local.
    pub overflow: u32,
    /// Bytes the cell occupies on the page.
    pub size: usize,
}

impl CellInfo {
    #[inline]
    pub fn key<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.key_start..self.key_start + self.key_len]
    }

    #[inline]
    pub fn local_data<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let start = self.key_start + self.key_len;
        &data[start..start + self.local_data]
    }

    #[inline]
    pub fn has_overflow(&self) -> bool {
        self.overflow != 0
    }
}

fn truncated(offset: usize) -> Error {
    Error::corrupt(format!("cell at offset {} runs past the page", offset))
}

/// Decode the cell starting at `offset`.
///
/// # Errors
/// Returns `Error::Corrupt` if the cell does not fit in `data` or its key
/// would not be local.
pub fn parse_cell(data: &[u8], offset: usize, is_leaf: bool, limits: &PayloadLimits) -> Result<CellInfo> {
    if is_leaf {
        parse_leaf_cell(data, offset, limits)
    } else {
        parse_internal_cell(data, offset)
    }
}

fn parse_leaf_cell(data: &[u8], offset: usize, limits: &PayloadLimits) -> Result<CellInfo> {
    let rest = data.get(offset..).ok_or_else(|| truncated(offset))?;
    let (data_size, n1) = get_varint(rest).ok_or_else(|| truncated(offset))?;
    let (key_size, n2) = get_varint(&rest[n1..]).ok_or_else(|| truncated(offset))?;

    let payload = key_size.saturating_add(data_size);
    let local = limits.local_size(payload);
    if key_size > local as u64 {
        return Err(Error::corrupt(format!("overflowing key in cell at offset {}", offset)));
    }
    let key_len = key_size as usize;
    let header = n1 + n2;
    let overflow_at = offset + header + local;
    let (overflow, raw_size) = if payload > local as u64 {
        if overflow_at + 4 > data.len() {
            return Err(truncated(offset));
        }
        (read_u32(data, overflow_at), header + local + 4)
    } else {
        (0, header + local)
    };
    if overflow_at > data.len() {
        return Err(truncated(offset));
    }
    if payload > local as u64 && overflow == 0 {
        return Err(Error::corrupt(format!("missing overflow page in cell at offset {}", offset)));
    }

    let size = raw_size.max(MIN_CELL_SIZE);
    if offset + size > data.len() {
        return Err(truncated(offset));
    }
    Ok(CellInfo {
        offset,
        left_child: 0,
        key_start: offset + header,
        key_len,
        data_size,
        local_data: local - key_len,
        overflow,
        size,
    })
}

fn parse_internal_cell(data: &[u8], offset: usize) -> Result<CellInfo> {
    if offset + 4 > data.len() {
        return Err(truncated(offset));
    }
    let left_child = read_u32(data, offset);
    let (key_size, n) = get_varint(&data[offset + 4..]).ok_or_else(|| truncated(offset))?;
    let key_start = offset + 4 + n;
    let end = (key_start as u64).saturating_add(key_size);
    if end > data.len() as u64 {
        return Err(truncated(offset));
    }
    Ok(CellInfo {
        offset,
        left_child,
        key_start,
        key_len: key_size as usize,
        data_size: 0,
        local_data: 0,
        overflow: 0,
        size: 4 + n + key_size as usize,
    })
}

/// Encode an internal cell.
pub fn encode_internal_cell(left_child: u32, key: &[u8]) -> Vec<u8> {
    let mut cell = vec![0u8; 4 + varint_len(key.len() as u64) + key.len()];
    write_u32(&mut cell, 0, left_child);
    let n = put_varint(&mut cell[4..], key.len() as u64);
    cell[4 + n..].copy_from_slice(key);
    cell
}

/// Encode a leaf cell for `key` and `value`.
///
/// Returns the cell and, when the value does not fit locally, the offset
/// into `value` where the overflow chain must start. In that case the last
/// four bytes of the cell are a placeholder for the first overflow page;
/// see [`set_overflow`].
pub fn encode_leaf_cell(key: &[u8], value: &[u8], limits: &PayloadLimits) -> (Vec<u8>, Option<usize>) {
    let payload = (key.len() + value.len()) as u64;
    let local = limits.local_size(payload);
    let local_data = local - key.len();
    let spills = payload > local as u64;

    let header = varint_len(value.len() as u64) + varint_len(key.len() as u64);
    let raw_size = header + local + if spills { 4 } else { 0 };
    let mut cell = vec![0u8; raw_size.max(MIN_CELL_SIZE)];

    let mut at = put_varint(&mut cell, value.len() as u64);
    at += put_varint(&mut cell[at..], key.len() as u64);
    cell[at..at + key.len()].copy_from_slice(key);
    at += key.len();
    cell[at..at + local_data].copy_from_slice(&value[..local_data]);

    (cell, spills.then_some(local_data))
}

/// Store the first overflow page number in a cell built by
/// [`encode_leaf_cell`].
pub fn set_overflow(cell: &mut [u8], page: u32) {
    let at = cell.len() - 4;
    write_u32(cell, at, page);
}
