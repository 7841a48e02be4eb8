//! Database file - page-granular file I/O.
//!
//! The [`DbFile`] handles all direct file operations on the main database
//! file:
//! - Reading and writing whole pages
//! - Reading the file header before the page size is known
//! - Truncating after a checkpoint

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::common::{PageNo, Result};

/// The main database file.
///
/// # File Layout
/// Pages are laid out sequentially, numbered from 1:
/// ```text
/// ┌─────────┬─────────┬─────────┬─────────┐
/// │ Page 1  │ Page 2  │  ...    │ Page N  │
/// └─────────┴─────────┴─────────┴─────────┘
/// Offset:  0   page_size   ...   (N-1)×page_size
/// ```
///
/// # Thread Safety
/// `DbFile` is single-threaded; each pager owns one behind a mutex. Several
/// pagers may open the same path, each with its own handle.
///
/// # Durability
/// Writes are not synced individually. Callers sync after a batch (the
/// checkpointer does so once per backfill).
pub struct DbFile {
    file: File,
    path: PathBuf,
    page_size: usize,
}

impl DbFile {
    /// Open a database file, creating it if it does not exist.
    ///
    /// # Errors
    /// Returns an I/O error if the file cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;

        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            page_size,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Change the page size, e.g. after reading it from the file header.
    pub fn set_page_size(&mut self, page_size: usize) {
        self.page_size = page_size;
    }

    /// Read the first `buf.len()` bytes of the file.
    ///
    /// Returns `false` without touching `buf` if the file is shorter.
    pub fn read_prefix(&mut self, buf: &mut [u8]) -> Result<bool> {
        if self.len()? < buf.len() as u64 {
            return Ok(false);
        }
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(buf)?;
        Ok(true)
    }

    /// Read a page into `buf`.
    ///
    /// # Errors
    /// A page that extends past the end of the file is a short read and
    /// surfaces as an I/O error of kind `UnexpectedEof`.
    pub fn read_page(&mut self, page_no: PageNo, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        self.file.seek(SeekFrom::Start(page_no.file_offset(self.page_size)))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Write a page, extending the file if needed.
    pub fn write_page(&mut self, page_no: PageNo, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), self.page_size);
        self.file.seek(SeekFrom::Start(page_no.file_offset(self.page_size)))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Shrink or grow the file to exactly `pages` pages.
    pub fn truncate(&mut self, pages: u32) -> Result<()> {
        self.file.set_len(pages as u64 * self.page_size as u64)?;
        Ok(())
    }

    /// Flush file content to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// File length in bytes.
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Number of whole pages in the file.
    pub fn page_count(&self) -> Result<u32> {
        Ok((self.len()? / self.page_size as u64) as u32)
    }
}

impl std::fmt::Debug for DbFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbFile")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_new_database() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let file = DbFile::open(&path, 4096).unwrap();
        assert!(path.exists());
        assert!(file.is_empty().unwrap());
        assert_eq!(file.page_count().unwrap(), 0);
    }

    #[test]
    fn test_write_and_read_page() {
        let dir = tempdir().unwrap();
        let mut file = DbFile::open(dir.path().join("test.db"), 512).unwrap();

        let mut page = vec![0u8; 512];
        page[0] = 0xAB;
        page[511] = 0xEF;
        file.write_page(PageNo::new(2), &page).unwrap();
        assert_eq!(file.page_count().unwrap(), 2);

        let mut back = vec![0u8; 512];
        file.read_page(PageNo::new(2), &mut back).unwrap();
        assert_eq!(back, page);

        // The hole before page 2 reads as zeros.
        file.read_page(PageNo::new(1), &mut back).unwrap();
        assert!(back.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_short_read_is_an_error() {
        let dir = tempdir().unwrap();
        let mut file = DbFile::open(dir.path().join("test.db"), 512).unwrap();
        file.write_page(PageNo::new(1), &[1u8; 512]).unwrap();

        let mut buf = vec![0u8; 512];
        let err = file.read_page(PageNo::new(2), &mut buf).unwrap_err();
        match err {
            crate::common::Error::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("expected I/O error, got {:?}", other),
        }
    }

    #[test]
    fn test_read_prefix() {
        let dir = tempdir().unwrap();
        let mut file = DbFile::open(dir.path().join("test.db"), 512).unwrap();

        let mut header = [0u8; 100];
        assert!(!file.read_prefix(&mut header).unwrap());

        file.write_page(PageNo::new(1), &[7u8; 512]).unwrap();
        assert!(file.read_prefix(&mut header).unwrap());
        assert_eq!(header[99], 7);
    }

    #[test]
    fn test_truncate() {
        let dir = tempdir().unwrap();
        let mut file = DbFile::open(dir.path().join("test.db"), 512).unwrap();
        for n in 1..=4 {
            file.write_page(PageNo::new(n), &[n as u8; 512]).unwrap();
        }
        file.truncate(2).unwrap();
        file.sync().unwrap();
        assert_eq!(file.page_count().unwrap(), 2);
    }

    #[test]
    fn test_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let mut file = DbFile::open(&path, 1024).unwrap();
            file.write_page(PageNo::new(1), &[0x42; 1024]).unwrap();
            file.sync().unwrap();
        }

        let mut file = DbFile::open(&path, 1024).unwrap();
        let mut buf = vec![0u8; 1024];
        file.read_page(PageNo::new(1), &mut buf).unwrap();
        assert_eq!(buf[0], 0x42);
    }
}
