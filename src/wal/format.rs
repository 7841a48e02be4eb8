//! WAL file format: header, frame headers and the running checksum.
//!
//! ```text
//! WAL header (32 bytes, big-endian fields)
//!   0   magic              0x377f0682 (LE checksum words) / 0x377f0683 (BE)
//!   4   file format        3007000
//!   8   page size
//!   12  checkpoint sequence
//!   16  salt-1
//!   20  salt-2
//!   24  checksum-1         over bytes 0..24
//!   28  checksum-2
//!
//! Frame header (24 bytes, big-endian fields), followed by one page
//!   0   page number
//!   4   database size in pages after commit, 0 for non-commit frames
//!   8   salt-1             copied from the WAL header
//!   12  salt-2
//!   16  checksum-1         running, over header bytes 0..8 and the page
//!   20  checksum-2
//! ```

use crate::common::config::validate_page_size;

/// Magic number selecting little-endian checksum words.
pub const WAL_MAGIC_LE: u32 = 0x377f_0682;

/// Magic number selecting big-endian checksum words.
pub const WAL_MAGIC_BE: u32 = 0x377f_0683;

/// The only WAL format version this crate reads and writes.
pub const WAL_FORMAT_VERSION: u32 = 3_007_000;

pub const WAL_HEADER_SIZE: usize = 32;
pub const FRAME_HEADER_SIZE: usize = 24;

/// Magic matching this machine's byte order, so checksums read words natively.
pub fn native_magic() -> u32 {
    if cfg!(target_endian = "big") {
        WAL_MAGIC_BE
    } else {
        WAL_MAGIC_LE
    }
}

/// Fibonacci-weighted checksum over `data`, continuing from `seed`.
///
/// `data` is consumed as pairs of 32-bit words read in the requested byte
/// order:
///
/// ```text
/// s0 += x[i] + s1
/// s1 += x[i+1] + s0
/// ```
///
/// # Panics
/// Panics if `data.len()` is not a multiple of 8.
pub fn checksum(data: &[u8], seed: (u32, u32), big_endian: bool) -> (u32, u32) {
    assert!(data.len() % 8 == 0, "checksum input must be a multiple of 8 bytes");

    let word = |b: &[u8]| {
        let bytes = [b[0], b[1], b[2], b[3]];
        if big_endian {
            u32::from_be_bytes(bytes)
        } else {
            u32::from_le_bytes(bytes)
        }
    };

    let (mut s0, mut s1) = seed;
    for pair in data.chunks_exact(8) {
        s0 = s0.wrapping_add(word(&pair[0..4])).wrapping_add(s1);
        s1 = s1.wrapping_add(word(&pair[4..8])).wrapping_add(s0);
    }
    (s0, s1)
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// The 32-byte header at the start of the WAL file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalHeader {
    pub magic: u32,
    pub file_format: u32,
    pub page_size: u32,
    /// Incremented every time the WAL restarts.
    pub checkpoint_seq: u32,
    /// Changed on every restart so frames of an earlier generation stop
    /// validating.
    pub salt1: u32,
    pub salt2: u32,
    pub checksum1: u32,
    pub checksum2: u32,
}

impl WalHeader {
    /// Build a header with the native magic and a valid checksum.
    pub fn new(page_size: usize, checkpoint_seq: u32, salts: (u32, u32)) -> Self {
        let mut header = Self {
            magic: native_magic(),
            file_format: WAL_FORMAT_VERSION,
            page_size: page_size as u32,
            checkpoint_seq,
            salt1: salts.0,
            salt2: salts.1,
            checksum1: 0,
            checksum2: 0,
        };
        let (c1, c2) = header.compute_checksum();
        header.checksum1 = c1;
        header.checksum2 = c2;
        header
    }

    /// Whether checksum words are read big-endian.
    #[inline]
    pub fn big_endian_checksum(&self) -> bool {
        self.magic & 1 == 1
    }

    #[inline]
    pub fn salts(&self) -> (u32, u32) {
        (self.salt1, self.salt2)
    }

    #[inline]
    pub fn checksum(&self) -> (u32, u32) {
        (self.checksum1, self.checksum2)
    }

    pub fn to_bytes(&self) -> [u8; WAL_HEADER_SIZE] {
        let mut buf = [0u8; WAL_HEADER_SIZE];
        put_u32(&mut buf, 0, self.magic);
        put_u32(&mut buf, 4, self.file_format);
        put_u32(&mut buf, 8, self.page_size);
        put_u32(&mut buf, 12, self.checkpoint_seq);
        put_u32(&mut buf, 16, self.salt1);
        put_u32(&mut buf, 20, self.salt2);
        put_u32(&mut buf, 24, self.checksum1);
        put_u32(&mut buf, 28, self.checksum2);
        buf
    }

    /// # Panics
    /// Panics if `buf` is shorter than 32 bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        assert!(buf.len() >= WAL_HEADER_SIZE, "buffer too small for WalHeader");
        Self {
            magic: get_u32(buf, 0),
            file_format: get_u32(buf, 4),
            page_size: get_u32(buf, 8),
            checkpoint_seq: get_u32(buf, 12),
            salt1: get_u32(buf, 16),
            salt2: get_u32(buf, 20),
            checksum1: get_u32(buf, 24),
            checksum2: get_u32(buf, 28),
        }
    }

    /// Checksum of the first 24 header bytes.
    pub fn compute_checksum(&self) -> (u32, u32) {
        checksum(&self.to_bytes()[..24], (0, 0), self.big_endian_checksum())
    }

    /// Whether this header can start a valid log.
    pub fn is_valid(&self) -> bool {
        (self.magic == WAL_MAGIC_LE || self.magic == WAL_MAGIC_BE)
            && self.file_format == WAL_FORMAT_VERSION
            && validate_page_size(self.page_size as usize).is_ok()
            && self.compute_checksum() == self.checksum()
    }
}

/// The 24-byte header in front of each page image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub page_no: u32,
    /// Database size in pages for a commit frame, 0 otherwise.
    pub db_size: u32,
    pub salt1: u32,
    pub salt2: u32,
    pub checksum1: u32,
    pub checksum2: u32,
}

impl FrameHeader {
    #[inline]
    pub fn is_commit(&self) -> bool {
        self.db_size != 0
    }

    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        put_u32(&mut buf, 0, self.page_no);
        put_u32(&mut buf, 4, self.db_size);
        put_u32(&mut buf, 8, self.salt1);
        put_u32(&mut buf, 12, self.salt2);
        put_u32(&mut buf, 16, self.checksum1);
        put_u32(&mut buf, 20, self.checksum2);
        buf
    }

    /// # Panics
    /// Panics if `buf` is shorter than 24 bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        assert!(buf.len() >= FRAME_HEADER_SIZE, "buffer too small for FrameHeader");
        Self {
            page_no: get_u32(buf, 0),
            db_size: get_u32(buf, 4),
            salt1: get_u32(buf, 8),
            salt2: get_u32(buf, 12),
            checksum1: get_u32(buf, 16),
            checksum2: get_u32(buf, 20),
        }
    }

    /// Build the header for `page`, chaining the checksum from `running`.
    ///
    /// Returns the header; its checksum is the new running checksum.
    pub fn encode(
        page_no: u32,
        db_size: u32,
        salts: (u32, u32),
        page: &[u8],
        running: (u32, u32),
        big_endian: bool,
    ) -> Self {
        let mut header = Self {
            page_no,
            db_size,
            salt1: salts.0,
            salt2: salts.1,
            checksum1: 0,
            checksum2: 0,
        };
        let sum = checksum(&header.to_bytes()[..8], running, big_endian);
        let (c1, c2) = checksum(page, sum, big_endian);
        header.checksum1 = c1;
        header.checksum2 = c2;
        header
    }

    /// Validate a frame read back from disk against the expected salts and
    /// running checksum.
    ///
    /// Returns the new running checksum if the frame is trustworthy.
    pub fn verify(
        &self,
        page: &[u8],
        salts: (u32, u32),
        running: (u32, u32),
        big_endian: bool,
    ) -> Option<(u32, u32)> {
        if self.page_no == 0 || (self.salt1, self.salt2) != salts {
            return None;
        }
        let sum = checksum(&self.to_bytes()[..8], running, big_endian);
        let sum = checksum(page, sum, big_endian);
        (sum == (self.checksum1, self.checksum2)).then_some(sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_known_values() {
        // Two words, little-endian: x0 = 1, x1 = 2.
        let data = [1, 0, 0, 0, 2, 0, 0, 0];
        assert_eq!(checksum(&data, (0, 0), false), (1, 3));
        // Same bytes read big-endian.
        assert_eq!(
            checksum(&data, (0, 0), true),
            (0x0100_0000, 0x0300_0000)
        );
        // Chaining from a seed equals one pass over the concatenation.
        let both = [data, data].concat();
        let once = checksum(&both, (0, 0), false);
        let twice = checksum(&data, checksum(&data, (0, 0), false), false);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_checksum_wraps() {
        let data = [0xff; 16];
        let (s0, s1) = checksum(&data, (u32::MAX, u32::MAX), true);
        // Nothing to assert beyond "no overflow panic"; values are stable.
        assert_eq!((s0, s1), checksum(&data, (u32::MAX, u32::MAX), true));
    }

    #[test]
    fn test_header_roundtrip_and_validity() {
        let header = WalHeader::new(4096, 3, (0xdead_beef, 0x1234_5678));
        assert!(header.is_valid());
        assert_eq!(WalHeader::from_bytes(&header.to_bytes()), header);

        let mut bad = header;
        bad.salt2 ^= 1;
        assert!(!bad.is_valid());

        let mut bad = header;
        bad.file_format = 3_007_001;
        bad.checksum1 = bad.compute_checksum().0;
        bad.checksum2 = bad.compute_checksum().1;
        assert!(!bad.is_valid());
    }

    #[test]
    fn test_header_byte_layout() {
        let header = WalHeader::new(512, 0, (1, 2));
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..3], &[0x37, 0x7f, 0x06]);
        assert_eq!(&bytes[4..8], &3_007_000u32.to_be_bytes());
        assert_eq!(&bytes[8..12], &512u32.to_be_bytes());
        assert_eq!(&bytes[16..20], &1u32.to_be_bytes());
    }

    #[test]
    fn test_both_magics_validate() {
        for magic in [WAL_MAGIC_LE, WAL_MAGIC_BE] {
            let mut header = WalHeader::new(1024, 0, (5, 6));
            header.magic = magic;
            let (c1, c2) = header.compute_checksum();
            header.checksum1 = c1;
            header.checksum2 = c2;
            assert!(header.is_valid());
            assert_eq!(header.big_endian_checksum(), magic == WAL_MAGIC_BE);
        }
    }

    #[test]
    fn test_frame_encode_verify() {
        let page = vec![0x5a; 512];
        let salts = (11, 22);
        let running = (7, 9);

        let frame = FrameHeader::encode(3, 10, salts, &page, running, false);
        assert!(frame.is_commit());
        assert_eq!(FrameHeader::from_bytes(&frame.to_bytes()), frame);

        let next = frame.verify(&page, salts, running, false);
        assert_eq!(next, Some((frame.checksum1, frame.checksum2)));

        // Wrong generation.
        assert_eq!(frame.verify(&page, (12, 22), running, false), None);
        // Wrong chain position.
        assert_eq!(frame.verify(&page, salts, (0, 0), false), None);
        // Torn page.
        let mut torn = page.clone();
        torn[100] ^= 0x01;
        assert_eq!(frame.verify(&torn, salts, running, false), None);
    }
}
