//! Tree handles and overflow chains.

use crate::common::{Error, PageNo, Result};
use crate::pager::Pager;

use super::cell::{PayloadLimits, OVERFLOW_HEADER_SIZE};
use super::page_header::{read_u32, write_u32};

/// A named B-tree, identified by its root page.
///
/// The root page number never changes while the tree exists: a root split
/// moves the root's content into a new child instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BTree {
    name: String,
    root: PageNo,
}

impl BTree {
    pub(crate) fn new(name: &str, root: PageNo) -> Self {
        Self {
            name: name.to_string(),
            root,
        }
    }

    /// The catalog: tree names mapped to root pages, rooted at page 1.
    pub(crate) fn catalog() -> Self {
        Self::new("", PageNo::FIRST)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn root(&self) -> PageNo {
        self.root
    }
}

/// Write `data` to a new chain of overflow pages, returning the first.
///
/// Pages are allocated from the last chunk backward so each page's next
/// pointer is known when it is written.
pub(crate) fn write_overflow(pager: &Pager, data: &[u8], limits: &PayloadLimits) -> Result<PageNo> {
    let mut next = PageNo::NONE;
    for chunk in data.chunks(limits.overflow_capacity()).rev() {
        let handle = pager.allocate_page()?;
        let mut page = pager.write(&handle)?;
        write_u32(&mut page, 0, next.0);
        page[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + chunk.len()].copy_from_slice(chunk);
        next = handle.no();
    }
    Ok(next)
}

/// Append `len` bytes read from the overflow chain starting at `first`.
///
/// # Errors
/// Returns `Error::Corrupt` if the chain ends early, leaves the database
/// or visits more pages than the database holds.
pub(crate) fn read_overflow(
    pager: &Pager,
    first: PageNo,
    len: usize,
    limits: &PayloadLimits,
    out: &mut Vec<u8>,
) -> Result<()> {
    let mut next = first;
    let mut remaining = len;
    let mut visited = 0u32;
    while remaining > 0 {
        if !next.is_valid() || next.0 > pager.page_count() {
            return Err(Error::corrupt(format!("overflow chain points to {}", next)));
        }
        visited += 1;
        if visited > pager.page_count() {
            return Err(Error::corrupt("overflow chain loops"));
        }

        let handle = pager.get_page(next)?;
        let page = handle.data();
        let n = remaining.min(limits.overflow_capacity());
        out.extend_from_slice(&page[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + n]);
        remaining -= n;
        next = PageNo::new(read_u32(&page, 0));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::Config;
    use crate::pager::Engine;
    use tempfile::tempdir;

    #[test]
    fn test_overflow_chain_roundtrip() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(Config::new().with_page_size(512)).unwrap();
        let pager = engine.open_pager(dir.path().join("t.db")).unwrap();
        pager.begin_read().unwrap();
        pager.begin_write().unwrap();

        let limits = PayloadLimits::new(512);
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let first = write_overflow(&pager, &data, &limits).unwrap();
        // 2000 bytes at 508 per page.
        assert_eq!(pager.page_count(), 1 + 4);

        let mut out = Vec::new();
        read_overflow(&pager, first, data.len(), &limits, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_overflow_cycle_is_corrupt() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(Config::new().with_page_size(512)).unwrap();
        let pager = engine.open_pager(dir.path().join("t.db")).unwrap();
        pager.begin_read().unwrap();
        pager.begin_write().unwrap();

        // Page 2 points to itself.
        let handle = pager.allocate_page().unwrap();
        write_u32(&mut pager.write(&handle).unwrap(), 0, 2);
        drop(handle);

        let limits = PayloadLimits::new(512);
        let mut out = Vec::new();
        let err = read_overflow(&pager, PageNo::new(2), 10_000, &limits, &mut out).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));

        let err = read_overflow(&pager, PageNo::new(9), 10, &limits, &mut out).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn test_catalog_handle() {
        let catalog = BTree::catalog();
        assert_eq!(catalog.root(), PageNo::FIRST);
        assert_eq!(catalog.name(), "");
    }
}
