//! Page number type.

use std::fmt;

/// Identifies a page of the database file.
///
/// Page numbers are 1-based: page 1 starts at file offset 0 and carries the
/// database file header. Zero is never a valid page and doubles as the
/// "no page" marker inside on-disk pointers.
///
/// # Example
/// ```
/// use udb::PageNo;
///
/// let page_no = PageNo::new(3);
/// assert!(page_no.is_valid());
/// assert_eq!(page_no.file_offset(4096), 8192);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PageNo(pub u32);

impl PageNo {
    /// The "no page" sentinel.
    pub const NONE: PageNo = PageNo(0);

    /// The first page of every database.
    pub const FIRST: PageNo = PageNo(1);

    #[inline]
    pub fn new(no: u32) -> Self {
        PageNo(no)
    }

    /// Check if this is a real page number.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// Byte offset of this page in a file of `page_size` pages.
    #[inline]
    pub fn file_offset(&self, page_size: usize) -> u64 {
        debug_assert!(self.is_valid());
        (self.0 as u64 - 1) * page_size as u64
    }

    #[inline]
    pub fn next(&self) -> PageNo {
        PageNo(self.0 + 1)
    }
}

impl fmt::Display for PageNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Page({})", self.0)
        } else {
            write!(f, "Page(NONE)")
        }
    }
}

impl From<u32> for PageNo {
    fn from(no: u32) -> Self {
        PageNo(no)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_no_validity() {
        assert!(PageNo::new(1).is_valid());
        assert!(!PageNo::NONE.is_valid());
        assert_eq!(PageNo::default(), PageNo::NONE);
    }

    #[test]
    fn test_page_no_offsets() {
        assert_eq!(PageNo::FIRST.file_offset(4096), 0);
        assert_eq!(PageNo::new(2).file_offset(512), 512);
        assert_eq!(PageNo::new(100_000).file_offset(65536), 99_999 * 65536);
    }

    #[test]
    fn test_page_no_ordering() {
        assert!(PageNo::new(1) < PageNo::new(2));
        assert_eq!(PageNo::new(4).next(), PageNo::new(5));
    }

    #[test]
    fn test_page_no_display() {
        assert_eq!(format!("{}", PageNo::new(42)), "Page(42)");
        assert_eq!(format!("{}", PageNo::NONE), "Page(NONE)");
    }
}
