//! The pager: page access and transactions over one database.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{MappedRwLockWriteGuard, Mutex};

use crate::cache::{Page, PageCache, Stress};
use crate::common::{Error, PageNo, Result};
use crate::storage::{DbFile, FileHeader};
use crate::wal::{CheckpointResult, Wal};

use super::handle::PageHandle;
use super::stats::PagerStats;

/// Transaction state of a pager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    None,
    Read,
    Write,
}

#[derive(Debug)]
struct PagerState {
    txn: TxnState,
    /// Database size when the write transaction began.
    orig_db_size: u32,
}

/// Writes a dirty page to the log as a non-commit frame.
struct Spill<'a> {
    wal: &'a Mutex<Wal>,
    stats: &'a PagerStats,
    spilled: &'a AtomicBool,
}

impl Stress for Spill<'_> {
    fn stress(&mut self, page: &Page) -> Result<()> {
        let mut wal = self.wal.lock();
        if !wal.in_write_transaction() {
            return Err(Error::Busy);
        }
        let data = page.data();
        wal.write_frames(&[(page.no(), &data[..])], None)?;
        self.spilled.store(true, Ordering::Relaxed);
        PagerStats::bump(&self.stats.spills, 1);
        PagerStats::bump(&self.stats.pages_written, 1);
        Ok(())
    }
}

/// Page access for one database connection.
///
/// ```text
/// get_page(n)
///   │
///   ├─ page cache ──── loaded? ──────────────► hit
///   │      │ (full: spill a dirty page to the WAL, retry)
///   │      ▼
///   ├─ n > db size ──► zero-filled page
///   ├─ WAL snapshot ─► newest frame for n
///   └─ database file ► offset (n-1) × page_size
/// ```
///
/// # Locking
/// Internal locks are taken in the order cache, WAL, database file and are
/// never held across calls. Page content is protected by each frame's own
/// lock, so a [`PageHandle`] can be read while other pages are fetched.
pub struct Pager {
    page_size: usize,
    state: Mutex<PagerState>,
    db_size: AtomicU32,
    spilled: AtomicBool,
    cache: Mutex<PageCache>,
    wal: Mutex<Wal>,
    db: Mutex<DbFile>,
    stats: PagerStats,
}

impl Pager {
    pub(crate) fn new(db: DbFile, wal: Wal, cache: PageCache) -> Self {
        Self {
            page_size: db.page_size(),
            state: Mutex::new(PagerState {
                txn: TxnState::None,
                orig_db_size: 0,
            }),
            db_size: AtomicU32::new(0),
            spilled: AtomicBool::new(false),
            cache: Mutex::new(cache),
            wal: Mutex::new(wal),
            db: Mutex::new(db),
            stats: PagerStats::new(),
        }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Database size in pages as seen by the current transaction.
    #[inline]
    pub fn page_count(&self) -> u32 {
        self.db_size.load(Ordering::Acquire)
    }

    #[inline]
    pub fn stats(&self) -> &PagerStats {
        &self.stats
    }

    pub fn txn_state(&self) -> TxnState {
        self.state.lock().txn
    }

    pub fn set_cache_size(&self, pages: u32) {
        self.cache.lock().set_cache_size(pages);
    }

    /// Pages currently held by this pager's cache.
    pub fn cached_pages(&self) -> usize {
        self.cache.lock().page_count()
    }

    /// Release every unpinned page buffer.
    pub fn shrink(&self) {
        self.cache.lock().shrink();
    }

    // ========================================================================
    // Public API: page access
    // ========================================================================

    /// Fetch page `no`, loading it if the cache does not hold it.
    ///
    /// # Errors
    /// - `Error::Misuse` outside a transaction
    /// - `Error::OutOfMemory` if no buffer is available even after spilling
    /// - I/O errors and `Error::Corrupt` from the WAL or database file
    pub fn get_page(&self, no: PageNo) -> Result<PageHandle<'_>> {
        if !no.is_valid() {
            return Err(Error::corrupt("reference to page 0"));
        }
        if self.txn_state() == TxnState::None {
            return Err(Error::Misuse("page access outside a transaction"));
        }
        let db_size = self.page_count();

        let mut cache = self.cache.lock();
        let item = match cache.fetch(no, true) {
            Some(item) => item,
            None => {
                let mut spill = Spill {
                    wal: &self.wal,
                    stats: &self.stats,
                    spilled: &self.spilled,
                };
                cache.fetch_stress(no, &mut spill)?
            }
        };
        let page = cache.fetch_finish(no, item);

        if page.is_loaded() {
            PagerStats::bump(&self.stats.cache_hits, 1);
            drop(cache);
            return Ok(PageHandle::new(self, page));
        }

        PagerStats::bump(&self.stats.cache_misses, 1);
        tracing::trace!(page = no.0, "page cache miss");
        if let Err(e) = self.load(&page, db_size) {
            cache.drop_page(&page);
            return Err(e);
        }
        page.frame().set_loaded(true);
        drop(cache);
        Ok(PageHandle::new(self, page))
    }

    fn load(&self, page: &Page, db_size: u32) -> Result<()> {
        let mut data = page.data_mut();
        if page.no().0 > db_size {
            data.fill(0);
            return Ok(());
        }

        let wal = self.wal.lock();
        if let Some(frame) = wal.find_frame(page.no())? {
            wal.read_frame(frame, &mut data)?;
        } else {
            drop(wal);
            self.db.lock().read_page(page.no(), &mut data)?;
        }
        PagerStats::bump(&self.stats.pages_read, 1);
        Ok(())
    }

    pub(crate) fn release(&self, page: &Page) {
        self.cache.lock().release(page);
    }

    /// Mark the page dirty and return exclusive access to its content.
    ///
    /// # Errors
    /// Returns `Error::Misuse` outside a write transaction.
    pub fn write<'h>(&self, handle: &'h PageHandle<'_>) -> Result<MappedRwLockWriteGuard<'h, [u8]>> {
        if self.txn_state() != TxnState::Write {
            return Err(Error::Misuse("page write outside a write transaction"));
        }
        self.cache.lock().mark_dirty(handle.page());
        Ok(handle.page().data_mut())
    }

    /// Append a zero-filled page to the database.
    ///
    /// # Errors
    /// Returns `Error::Misuse` outside a write transaction.
    pub fn allocate_page(&self) -> Result<PageHandle<'_>> {
        if self.txn_state() != TxnState::Write {
            return Err(Error::Misuse("page allocation outside a write transaction"));
        }
        let no = PageNo::new(self.page_count() + 1);
        let handle = self.get_page(no)?;
        self.db_size.store(no.0, Ordering::Release);
        self.cache.lock().mark_dirty(handle.page());
        Ok(handle)
    }

    // ========================================================================
    // Public API: transactions
    // ========================================================================

    /// Start a read transaction on the latest committed state.
    ///
    /// # Errors
    /// `Error::Protocol` from the WAL, or an I/O error reading the header.
    pub fn begin_read(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.txn != TxnState::None {
            return Err(Error::Misuse("transaction already open"));
        }

        let mut cache = self.cache.lock();
        let mut wal = self.wal.lock();
        if wal.begin_read_transaction()? {
            cache.clear();
        }
        let db_size = match wal.db_size() {
            Some(n) => n,
            None => match self.read_file_header() {
                Ok(header) => header.map_or(0, |h| h.database_size),
                Err(e) => {
                    wal.end_read_transaction();
                    return Err(e);
                }
            },
        };
        self.db_size.store(db_size, Ordering::Release);
        state.txn = TxnState::Read;
        Ok(())
    }

    fn read_file_header(&self) -> Result<Option<FileHeader>> {
        let mut buf = [0u8; FileHeader::SIZE];
        let mut db = self.db.lock();
        if !db.read_prefix(&mut buf)? || !FileHeader::has_magic(&buf) {
            return Ok(None);
        }
        FileHeader::from_bytes(&buf).map(Some)
    }

    pub fn end_read(&self) {
        let mut state = self.state.lock();
        if state.txn == TxnState::Write {
            drop(state);
            if let Err(e) = self.rollback() {
                tracing::warn!(error = %e, "rollback at end of read failed");
            }
            state = self.state.lock();
        }
        self.wal.lock().end_read_transaction();
        state.txn = TxnState::None;
    }

    /// Upgrade the read transaction to a write transaction.
    ///
    /// Returns `true` if the database was empty and page 1 has just been
    /// created with a fresh file header.
    ///
    /// # Errors
    /// `Error::Busy` if another connection holds the write lock or has
    /// committed since this transaction's snapshot.
    pub fn begin_write(&self) -> Result<bool> {
        {
            let mut state = self.state.lock();
            match state.txn {
                TxnState::Write => return Ok(false),
                TxnState::None => return Err(Error::Misuse("write transaction requires a read transaction")),
                TxnState::Read => {}
            }
            self.wal.lock().begin_write_transaction()?;
            state.txn = TxnState::Write;
            state.orig_db_size = self.page_count();
        }
        self.spilled.store(false, Ordering::Relaxed);

        if self.page_count() > 0 {
            return Ok(false);
        }
        let page1 = self.allocate_page()?;
        let mut data = self.write(&page1)?;
        FileHeader::new(self.page_size).write_to(&mut data);
        Ok(true)
    }

    /// Write every dirty page to the WAL and publish the commit.
    ///
    /// Page 1's file header records the new size and change counter. All
    /// page handles with write access must have been dropped.
    pub fn commit(&self) -> Result<()> {
        if self.txn_state() != TxnState::Write {
            return Err(Error::Misuse("commit outside a write transaction"));
        }

        let has_changes = self.cache.lock().dirty_count() > 0 || self.spilled.load(Ordering::Relaxed);
        if has_changes {
            self.stamp_header()?;
            self.write_dirty_pages()?;
        }

        self.wal.lock().end_write_transaction();
        self.state.lock().txn = TxnState::Read;
        Ok(())
    }

    fn stamp_header(&self) -> Result<()> {
        let page1 = self.get_page(PageNo::FIRST)?;
        let mut data = self.write(&page1)?;
        let mut header = FileHeader::from_bytes(&data[..FileHeader::SIZE])?;
        header.change_counter = header.change_counter.wrapping_add(1);
        header.database_size = self.page_count();
        header.write_to(&mut data);
        Ok(())
    }

    fn write_dirty_pages(&self) -> Result<()> {
        let mut cache = self.cache.lock();
        let dirty = cache.dirty_pages();
        let images: Vec<_> = dirty.iter().map(|p| p.data()).collect();
        let frames: Vec<(PageNo, &[u8])> = dirty
            .iter()
            .zip(&images)
            .map(|(p, data)| (p.no(), &data[..]))
            .collect();

        self.wal.lock().write_frames(&frames, Some(self.page_count()))?;
        PagerStats::bump(&self.stats.pages_written, frames.len() as u64);

        drop(frames);
        drop(images);
        cache.clean_all();
        Ok(())
    }

    /// Abandon the write transaction. Dirty pages are discarded and the
    /// database size reverts.
    pub fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.txn != TxnState::Write {
            return Err(Error::Misuse("rollback outside a write transaction"));
        }
        let mut cache = self.cache.lock();
        cache.discard_dirty();
        if self.spilled.swap(false, Ordering::Relaxed) {
            // Spilled pages were marked clean but hold uncommitted content.
            cache.clear();
        }
        let mut wal = self.wal.lock();
        wal.undo();
        wal.end_write_transaction();

        self.db_size.store(state.orig_db_size, Ordering::Release);
        state.txn = TxnState::Read;
        Ok(())
    }

    /// Copy committed WAL frames into the database file.
    ///
    /// # Errors
    /// `Error::Misuse` inside a transaction; `Error::Busy` if another
    /// checkpoint is running or a reader blocks backfilling.
    pub fn checkpoint(&self) -> Result<CheckpointResult> {
        if self.txn_state() != TxnState::None {
            return Err(Error::Misuse("checkpoint inside a transaction"));
        }
        let mut wal = self.wal.lock();
        let mut db = self.db.lock();
        wal.checkpoint(&mut db)
    }
}

impl std::fmt::Debug for Pager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager")
            .field("page_size", &self.page_size)
            .field("db_size", &self.page_count())
            .field("txn", &self.txn_state())
            .finish()
    }
}
