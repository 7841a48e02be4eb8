//! Database file header.
//!
//! The first 100 bytes of page 1 describe the database as a whole. The
//! B-tree page header of page 1 follows immediately after.

use crate::common::config::validate_page_size;
use crate::common::{Error, Result};

/// Metadata stored at the start of page 1.
///
/// # Layout (100 bytes, big-endian)
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       16    magic "udb format 1\0"
/// 16      2     page size (1 means 65536)
/// 18      1     write version (2 = WAL)
/// 19      1     read version (2 = WAL)
/// 20      1     reserved bytes at the end of each page
/// 24      4     change counter
/// 28      4     database size in pages
/// 32      4     first freelist trunk page (unused, 0)
/// 36      4     freelist page count (unused, 0)
/// 96      4     CRC32 of bytes 0..96
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub page_size: usize,
    pub write_version: u8,
    pub read_version: u8,
    pub reserved: u8,
    pub change_counter: u32,
    pub database_size: u32,
}

impl FileHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 100;

    pub const MAGIC: &'static [u8; 16] = b"udb format 1\0\0\0\0";

    pub const OFFSET_MAGIC: usize = 0;
    pub const OFFSET_PAGE_SIZE: usize = 16;
    pub const OFFSET_WRITE_VERSION: usize = 18;
    pub const OFFSET_READ_VERSION: usize = 19;
    pub const OFFSET_RESERVED: usize = 20;
    pub const OFFSET_CHANGE_COUNTER: usize = 24;
    pub const OFFSET_DATABASE_SIZE: usize = 28;
    pub const OFFSET_CHECKSUM: usize = 96;

    /// File format version for WAL-mode databases.
    pub const WAL_VERSION: u8 = 2;

    /// A header for a fresh database.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            write_version: Self::WAL_VERSION,
            read_version: Self::WAL_VERSION,
            reserved: 0,
            change_counter: 0,
            database_size: 1,
        }
    }

    /// True if `data` starts with the header magic.
    pub fn has_magic(data: &[u8]) -> bool {
        data.len() >= Self::SIZE && &data[..16] == Self::MAGIC
    }

    /// Parse and verify a header.
    ///
    /// # Errors
    /// Returns `Error::Corrupt` if the magic, checksum or page size is bad.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if !Self::has_magic(data) {
            return Err(Error::corrupt("file is not a database"));
        }
        let stored = read_u32(data, Self::OFFSET_CHECKSUM);
        if stored != Self::compute_checksum(data) {
            return Err(Error::corrupt("file header checksum mismatch"));
        }

        let raw = u16::from_be_bytes([data[Self::OFFSET_PAGE_SIZE], data[Self::OFFSET_PAGE_SIZE + 1]]);
        let page_size = if raw == 1 { 65536 } else { raw as usize };
        validate_page_size(page_size)
            .map_err(|_| Error::corrupt(format!("bad page size {} in file header", page_size)))?;

        Ok(Self {
            page_size,
            write_version: data[Self::OFFSET_WRITE_VERSION],
            read_version: data[Self::OFFSET_READ_VERSION],
            reserved: data[Self::OFFSET_RESERVED],
            change_counter: read_u32(data, Self::OFFSET_CHANGE_COUNTER),
            database_size: read_u32(data, Self::OFFSET_DATABASE_SIZE),
        })
    }

    /// Write this header, including a fresh checksum, to the start of `data`.
    ///
    /// # Panics
    /// Panics if `data.len() < FileHeader::SIZE`.
    pub fn write_to(&self, data: &mut [u8]) {
        assert!(data.len() >= Self::SIZE, "buffer too small for FileHeader");

        data[..Self::SIZE].fill(0);
        data[Self::OFFSET_MAGIC..Self::OFFSET_MAGIC + 16].copy_from_slice(Self::MAGIC);
        let raw = if self.page_size == 65536 {
            1u16
        } else {
            self.page_size as u16
        };
        data[Self::OFFSET_PAGE_SIZE..Self::OFFSET_PAGE_SIZE + 2].copy_from_slice(&raw.to_be_bytes());
        data[Self::OFFSET_WRITE_VERSION] = self.write_version;
        data[Self::OFFSET_READ_VERSION] = self.read_version;
        data[Self::OFFSET_RESERVED] = self.reserved;
        write_u32(data, Self::OFFSET_CHANGE_COUNTER, self.change_counter);
        write_u32(data, Self::OFFSET_DATABASE_SIZE, self.database_size);

        let checksum = Self::compute_checksum(data);
        write_u32(data, Self::OFFSET_CHECKSUM, checksum);
    }

    /// CRC32 of the header bytes preceding the checksum field.
    pub fn compute_checksum(data: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data[..Self::OFFSET_CHECKSUM]);
        hasher.finalize()
    }

    /// Usable bytes per page.
    #[inline]
    pub fn usable_size(&self) -> usize {
        self.page_size - self.reserved as usize
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn write_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

// ============================================================================
// TESTS
// ============================================================================
