//! State shared by every connection to one WAL file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::common::{FrameNo, Result};

use super::format::{native_magic, FrameHeader, WalHeader, FRAME_HEADER_SIZE, WAL_HEADER_SIZE};
use super::index::{WalIndex, WAL_NPAGE};
use super::locks::WalLocks;
use super::{READMARK_NOT_USED, WAL_NREADER};

/// Versioned summary of the committed log.
///
/// A reader copies this at the start of its transaction. Any later commit
/// bumps `change`, so comparing two copies tells whether the log moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalIndexHeader {
    /// Incremented on every commit and restart.
    pub change: u32,
    pub page_size: u32,
    /// Last valid commit frame, 0 for an empty log.
    pub max_frame: u32,
    /// Database size in pages as of `max_frame`.
    pub n_page: u32,
    /// Running checksum after `max_frame`.
    pub frame_cksum: (u32, u32),
    pub salt: (u32, u32),
    pub checkpoint_seq: u32,
    pub big_end: bool,
}

impl WalIndexHeader {
    fn empty(page_size: usize, salt: (u32, u32)) -> Self {
        Self {
            change: 0,
            page_size: page_size as u32,
            max_frame: 0,
            n_page: 0,
            frame_cksum: (0, 0),
            salt,
            checkpoint_seq: 0,
            big_end: native_magic() & 1 == 1,
        }
    }

    /// The WAL file header that starts a log with this header's salts.
    pub fn wal_header(&self) -> WalHeader {
        WalHeader::new(self.page_size as usize, self.checkpoint_seq, self.salt)
    }
}

/// Shared WAL state.
///
/// One instance exists per WAL path inside an engine; every pager on that
/// database holds a [`Wal`](super::Wal) connection pointing at it.
pub struct WalShared {
    path: PathBuf,
    file: Mutex<File>,
    pub(crate) index: RwLock<WalIndex>,
    pub(crate) header: Mutex<WalIndexHeader>,
    /// Frames already copied into the database file.
    pub(crate) backfill: AtomicU32,
    pub(crate) read_marks: [AtomicU32; WAL_NREADER],
    pub(crate) locks: WalLocks,
}

impl WalShared {
    /// Open the log at `path`, creating it if needed, and rebuild the index
    /// from whatever valid frames it holds.
    ///
    /// `page_size` is used only when the file has no valid header.
    ///
    /// # Errors
    /// Returns an I/O error if the file cannot be opened or read, or
    /// `Error::Busy` if another connection is recovering the same log.
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        Self::open_with_block_size(path, page_size, WAL_NPAGE)
    }

    pub(crate) fn open_with_block_size<P: AsRef<Path>>(
        path: P,
        page_size: usize,
        npage: usize,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;

        let shared = Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(file),
            index: RwLock::new(WalIndex::with_block_size(npage)),
            header: Mutex::new(WalIndexHeader::empty(page_size, random_salts())),
            backfill: AtomicU32::new(0),
            read_marks: std::array::from_fn(|i| {
                AtomicU32::new(if i == 0 { 0 } else { READMARK_NOT_USED })
            }),
            locks: WalLocks::new(),
        };
        shared.recover(page_size)?;
        Ok(shared)
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the current index header.
    pub fn header(&self) -> WalIndexHeader {
        *self.header.lock()
    }

    #[inline]
    pub fn backfill(&self) -> u32 {
        self.backfill.load(Ordering::Acquire)
    }

    #[inline]
    pub fn read_mark(&self, slot: usize) -> u32 {
        self.read_marks[slot].load(Ordering::Acquire)
    }

    /// Rebuild the index from the log file.
    ///
    /// Frames are accepted while salts and the running checksum match. Only
    /// frames up to the last commit frame become visible.
    fn recover(&self, page_size: usize) -> Result<()> {
        self.locks.recover.try_lock_exclusive()?;
        let result = self.recover_locked(page_size);
        self.locks.recover.unlock_exclusive();
        result
    }

    fn recover_locked(&self, page_size: usize) -> Result<()> {
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        if len < WAL_HEADER_SIZE as u64 {
            return Ok(());
        }

        let mut raw = [0u8; WAL_HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut raw)?;
        let wal_header = WalHeader::from_bytes(&raw);
        if !wal_header.is_valid() {
            tracing::debug!(path = %self.path.display(), "ignoring wal with invalid header");
            return Ok(());
        }

        let ps = wal_header.page_size as usize;
        let big_end = wal_header.big_endian_checksum();
        let salts = wal_header.salts();
        let mut running = wal_header.checksum();

        let mut recovered = WalIndexHeader {
            change: 0,
            page_size: wal_header.page_size,
            max_frame: 0,
            n_page: 0,
            frame_cksum: running,
            salt: salts,
            checkpoint_seq: wal_header.checkpoint_seq,
            big_end,
        };

        let mut index = self.index.write();
        let mut frame_buf = vec![0u8; FRAME_HEADER_SIZE + ps];
        let mut frame = 1u32;
        while FrameNo::new(frame).file_offset(ps) + frame_buf.len() as u64 <= len {
            file.seek(SeekFrom::Start(FrameNo::new(frame).file_offset(ps)))?;
            file.read_exact(&mut frame_buf)?;
            let header = FrameHeader::from_bytes(&frame_buf);
            let Some(next) = header.verify(&frame_buf[FRAME_HEADER_SIZE..], salts, running, big_end)
            else {
                tracing::warn!(path = %self.path.display(), frame, "wal recovery stopped at invalid frame");
                break;
            };
            running = next;
            index.append(frame, header.page_no)?;
            if header.is_commit() {
                recovered.max_frame = frame;
                recovered.n_page = header.db_size;
                recovered.frame_cksum = running;
            }
            frame += 1;
        }
        index.truncate(recovered.max_frame);

        tracing::debug!(
            path = %self.path.display(),
            max_frame = recovered.max_frame,
            page_size,
            "recovered wal"
        );
        *self.header.lock() = recovered;
        Ok(())
    }

    // ========================================================================
    // File access
    // ========================================================================

    /// Read the page image stored in `frame`.
    pub(crate) fn read_frame(&self, frame: u32, page_size: usize, buf: &mut [u8]) -> Result<()> {
        let offset = FrameNo::new(frame).file_offset(page_size) + FRAME_HEADER_SIZE as u64;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf[..page_size])?;
        Ok(())
    }

    pub(crate) fn write_frame(
        &self,
        frame: u32,
        header: &FrameHeader,
        page: &[u8],
    ) -> Result<()> {
        let offset = FrameNo::new(frame).file_offset(page.len());
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&header.to_bytes())?;
        file.write_all(page)?;
        Ok(())
    }

    pub(crate) fn write_header(&self, header: &WalHeader) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.to_bytes())?;
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    /// Shrink the log file to at most `len` bytes.
    pub(crate) fn truncate_file(&self, len: u64) -> Result<()> {
        let file = self.file.lock();
        if file.metadata()?.len() > len {
            file.set_len(len)?;
        }
        Ok(())
    }

    pub fn file_len(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }
}

impl std::fmt::Debug for WalShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalShared")
            .field("path", &self.path)
            .field("header", &*self.header.lock())
            .field("backfill", &self.backfill())
            .finish()
    }
}

pub(crate) fn random_salts() -> (u32, u32) {
    (rand::random(), rand::random())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_log(path: &Path, frames: &[(u32, u32, u8)], salts: (u32, u32)) {
        let header = WalHeader::new(512, 0, salts);
        let mut bytes = header.to_bytes().to_vec();
        let mut running = header.checksum();
        for &(page_no, db_size, fill) in frames {
            let page = vec![fill; 512];
            let fh = FrameHeader::encode(page_no, db_size, salts, &page, running, header.big_endian_checksum());
            running = (fh.checksum1, fh.checksum2);
            bytes.extend_from_slice(&fh.to_bytes());
            bytes.extend_from_slice(&page);
        }
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_open_empty() {
        let dir = tempdir().unwrap();
        let shared = WalShared::open(dir.path().join("db-wal"), 4096).unwrap();
        let header = shared.header();
        assert_eq!(header.max_frame, 0);
        assert_eq!(header.page_size, 4096);
        assert_eq!(shared.read_mark(0), 0);
        assert_eq!(shared.read_mark(1), READMARK_NOT_USED);
    }

    #[test]
    fn test_recovery_stops_at_last_commit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db-wal");
        // Frames 1-2 form a commit, frame 3 is an uncommitted tail.
        write_log(&path, &[(1, 0, 0xa1), (2, 2, 0xa2), (1, 0, 0xa3)], (9, 10));

        let shared = WalShared::open(&path, 4096).unwrap();
        let header = shared.header();
        assert_eq!(header.page_size, 512);
        assert_eq!(header.max_frame, 2);
        assert_eq!(header.n_page, 2);
        assert_eq!(header.salt, (9, 10));

        let index = shared.index.read();
        assert_eq!(index.find_frame(1, 1, 2).unwrap(), Some(1));
        assert_eq!(index.page_at(3), None);

        let mut buf = vec![0u8; 512];
        shared.read_frame(2, 512, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xa2));
    }

    #[test]
    fn test_recovery_rejects_corrupt_frame() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db-wal");
        write_log(&path, &[(1, 1, 1), (2, 2, 2)], (1, 2));

        // Flip a byte in frame 2's page image.
        let mut bytes = std::fs::read(&path).unwrap();
        let off = FrameNo::new(2).file_offset(512) as usize + FRAME_HEADER_SIZE + 10;
        bytes[off] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let shared = WalShared::open(&path, 512).unwrap();
        assert_eq!(shared.header().max_frame, 1);
    }

    #[test]
    fn test_invalid_header_is_an_empty_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db-wal");
        std::fs::write(&path, vec![0x55u8; 600]).unwrap();

        let shared = WalShared::open(&path, 1024).unwrap();
        assert_eq!(shared.header().max_frame, 0);
        assert_eq!(shared.header().page_size, 1024);
    }
}
