//! WAL frame number type.

use std::fmt;

/// Identifies a frame of the write-ahead log.
///
/// Frames are numbered from 1 in append order. Zero means "no frame"; a
/// snapshot bound of zero sees an empty log.
///
/// # Example
/// ```
/// use udb::FrameNo;
///
/// let frame = FrameNo::new(1);
/// assert_eq!(frame.file_offset(4096), 32);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FrameNo(pub u32);

impl FrameNo {
    pub const NONE: FrameNo = FrameNo(0);

    #[inline]
    pub fn new(no: u32) -> Self {
        FrameNo(no)
    }

    /// Byte offset of this frame's header inside the WAL file.
    #[inline]
    pub fn file_offset(&self, page_size: usize) -> u64 {
        debug_assert!(self.0 > 0);
        crate::wal::WAL_HEADER_SIZE as u64
            + (self.0 as u64 - 1) * (crate::wal::FRAME_HEADER_SIZE + page_size) as u64
    }
}

impl fmt::Display for FrameNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_no_offsets() {
        assert_eq!(FrameNo::new(1).file_offset(4096), 32);
        assert_eq!(FrameNo::new(2).file_offset(4096), 32 + 24 + 4096);
        assert_eq!(FrameNo::new(3).file_offset(512), 32 + 2 * 536);
    }

    #[test]
    fn test_frame_no_equality() {
        assert_eq!(FrameNo::new(5), FrameNo::new(5));
        assert_ne!(FrameNo::new(5), FrameNo::new(6));
        assert_eq!(FrameNo::default(), FrameNo::NONE);
    }

    #[test]
    fn test_frame_no_display() {
        assert_eq!(format!("{}", FrameNo::new(42)), "Frame(42)");
    }
}
