//! A connection to a shared WAL.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::common::{Error, PageNo, Result};
use crate::storage::DbFile;

use super::format::FrameHeader;
use super::shared::{WalIndexHeader, WalShared};
use super::{READMARK_NOT_USED, WAL_NREADER};

/// Attempts without any delay before backing off.
const RETRY_FREE_ATTEMPTS: u32 = 5;

/// Attempts after which a read transaction gives up.
const RETRY_LIMIT: u32 = 100;

/// Outcome of one attempt to start a read transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadAttempt {
    Acquired,
    /// Lost a race with a writer or checkpointer. Never leaves this module.
    Retry,
}

/// Progress reported by [`Wal::checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckpointResult {
    /// Committed frames in the log.
    pub log_frames: u32,
    /// Frames copied into the database file so far.
    pub backfilled: u32,
}

/// Sleep before retry attempt `attempt`, or `None` for an immediate retry.
fn retry_delay(attempt: u32) -> Option<Duration> {
    if attempt <= RETRY_FREE_ATTEMPTS {
        return None;
    }
    let micros = if attempt >= 10 {
        let n = (attempt - 9) as u64;
        n * n * 39
    } else {
        1
    };
    Some(Duration::from_micros(micros))
}

/// One connection's view of the log.
///
/// # Snapshot
/// A read transaction pins a copy of the index header. Every lookup is
/// bounded by that copy's `max_frame`, so frames committed later stay
/// invisible until the next read transaction.
///
/// # Read marks
/// The reader also holds a shared lock on one read-mark slot whose mark
/// does not exceed its snapshot. Slot 0 means "the database file alone is
/// current" and the log is not consulted at all.
pub struct Wal {
    shared: Arc<WalShared>,
    read_lock: Option<usize>,
    hdr: WalIndexHeader,
    min_frame: u32,
    write_lock: bool,
    max_wal_size: Option<u64>,
}

impl Wal {
    pub fn new(shared: Arc<WalShared>, max_wal_size: Option<u64>) -> Self {
        Self {
            shared,
            read_lock: None,
            hdr: WalIndexHeader::default(),
            min_frame: 0,
            write_lock: false,
            max_wal_size,
        }
    }

    #[inline]
    pub fn shared(&self) -> &Arc<WalShared> {
        &self.shared
    }

    /// Read-mark slot held by the current read transaction.
    #[inline]
    pub fn read_lock(&self) -> Option<usize> {
        self.read_lock
    }

    /// Upper frame bound of the current snapshot.
    #[inline]
    pub fn max_frame(&self) -> u32 {
        self.hdr.max_frame
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.hdr.page_size as usize
    }

    #[inline]
    pub fn in_write_transaction(&self) -> bool {
        self.write_lock
    }

    // ========================================================================
    // Read transactions
    // ========================================================================

    /// Take a snapshot of the log.
    ///
    /// Returns `true` if the snapshot differs from the previous one, in
    /// which case cached pages may be stale.
    ///
    /// # Errors
    /// Returns `Error::Protocol` if the snapshot could not be pinned after
    /// repeated retries.
    pub fn begin_read_transaction(&mut self) -> Result<bool> {
        if self.read_lock.is_some() {
            return Err(Error::Misuse("read transaction already open"));
        }
        let before = self.hdr;
        self.acquire_read(false)?;
        Ok(self.hdr != before)
    }

    pub fn end_read_transaction(&mut self) {
        self.end_write_transaction();
        if let Some(slot) = self.read_lock.take() {
            self.shared.locks.read[slot].unlock_shared();
        }
    }

    fn acquire_read(&mut self, use_wal: bool) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.try_begin_read(attempt, use_wal)? {
                ReadAttempt::Acquired => return Ok(()),
                ReadAttempt::Retry => attempt += 1,
            }
        }
    }

    fn try_begin_read(&mut self, attempt: u32, use_wal: bool) -> Result<ReadAttempt> {
        if attempt > RETRY_LIMIT {
            tracing::warn!(attempt, "giving up on wal read transaction");
            return Err(Error::Protocol(format!(
                "read transaction not established after {} attempts",
                RETRY_LIMIT
            )));
        }
        if let Some(delay) = retry_delay(attempt) {
            thread::sleep(delay);
        }

        let shared = Arc::clone(&self.shared);
        let hdr = shared.header();

        if !use_wal && hdr.max_frame == shared.backfill() {
            // Everything committed is already in the database file.
            if shared.locks.read[0].try_lock_shared().is_err() {
                return Ok(ReadAttempt::Retry);
            }
            if shared.header() != hdr || shared.backfill() != hdr.max_frame {
                shared.locks.read[0].unlock_shared();
                return Ok(ReadAttempt::Retry);
            }
            self.hdr = hdr;
            self.min_frame = hdr.max_frame + 1;
            self.read_lock = Some(0);
            return Ok(ReadAttempt::Acquired);
        }

        let mut best_mark = 0;
        let mut best_slot = None;
        for slot in 1..WAL_NREADER {
            let mark = shared.read_mark(slot);
            if mark != READMARK_NOT_USED && mark <= hdr.max_frame && mark >= best_mark {
                best_mark = mark;
                best_slot = Some(slot);
            }
        }

        if best_slot.is_none() || best_mark < hdr.max_frame {
            // Publish a mark equal to the snapshot in any slot nobody reads.
            for slot in 1..WAL_NREADER {
                if shared.locks.read[slot].try_lock_exclusive().is_ok() {
                    shared.read_marks[slot].store(hdr.max_frame, Ordering::Release);
                    shared.locks.read[slot].unlock_exclusive();
                    best_mark = hdr.max_frame;
                    best_slot = Some(slot);
                    break;
                }
            }
        }

        let Some(slot) = best_slot else {
            return Ok(ReadAttempt::Retry);
        };

        if shared.locks.read[slot].try_lock_shared().is_err() {
            return Ok(ReadAttempt::Retry);
        }
        // A writer may have committed, or a checkpointer recycled the mark,
        // between choosing the slot and locking it.
        if shared.read_mark(slot) != best_mark || shared.header() != hdr {
            shared.locks.read[slot].unlock_shared();
            return Ok(ReadAttempt::Retry);
        }

        self.hdr = hdr;
        self.min_frame = shared.backfill() + 1;
        self.read_lock = Some(slot);
        Ok(ReadAttempt::Acquired)
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Newest frame holding `page_no` within the current snapshot.
    ///
    /// # Errors
    /// Returns `Error::Corrupt` if the index is damaged.
    pub fn find_frame(&self, page_no: PageNo) -> Result<Option<u32>> {
        match self.read_lock {
            None | Some(0) => Ok(None),
            Some(_) if self.hdr.max_frame == 0 => Ok(None),
            Some(_) => self
                .shared
                .index
                .read()
                .find_frame(page_no.0, self.min_frame, self.hdr.max_frame),
        }
    }

    /// Copy the page image of `frame` into `buf`.
    pub fn read_frame(&self, frame: u32, buf: &mut [u8]) -> Result<()> {
        self.shared.read_frame(frame, self.page_size(), buf)
    }

    /// Database size recorded by the snapshot's last commit, if the log
    /// holds any.
    pub fn db_size(&self) -> Option<u32> {
        (self.read_lock.is_some() && self.hdr.max_frame > 0).then_some(self.hdr.n_page)
    }

    // ========================================================================
    // Write transactions
    // ========================================================================

    /// # Errors
    /// Returns `Error::Busy` if another connection is writing or has
    /// committed since this connection's snapshot was taken.
    pub fn begin_write_transaction(&mut self) -> Result<()> {
        if self.read_lock.is_none() {
            return Err(Error::Misuse("write transaction requires a read transaction"));
        }
        if self.write_lock {
            return Ok(());
        }
        self.shared.locks.writer.try_lock_exclusive()?;
        if self.shared.header() != self.hdr {
            self.shared.locks.writer.unlock_exclusive();
            return Err(Error::Busy);
        }
        self.write_lock = true;
        Ok(())
    }

    pub fn end_write_transaction(&mut self) {
        if self.write_lock {
            self.shared.locks.writer.unlock_exclusive();
            self.write_lock = false;
        }
    }

    /// Append page images to the log.
    ///
    /// With `commit = Some(n)` the last frame becomes a commit frame for a
    /// database of `n` pages, the log is synced and the new header is
    /// published to other connections.
    pub fn write_frames(&mut self, pages: &[(PageNo, &[u8])], commit: Option<u32>) -> Result<()> {
        if !self.write_lock {
            return Err(Error::Misuse("write_frames outside a write transaction"));
        }
        if pages.is_empty() {
            return Ok(());
        }
        self.restart_log()?;

        if self.hdr.max_frame == 0 {
            let header = self.hdr.wal_header();
            self.shared.write_header(&header)?;
            self.hdr.frame_cksum = header.checksum();
            self.hdr.big_end = header.big_endian_checksum();
        }

        let last = pages.len() - 1;
        for (i, (page_no, data)) in pages.iter().enumerate() {
            debug_assert_eq!(data.len(), self.page_size());
            let frame = self.hdr.max_frame + 1;
            let db_size = if i == last { commit.unwrap_or(0) } else { 0 };
            let header = FrameHeader::encode(
                page_no.0,
                db_size,
                self.hdr.salt,
                data,
                self.hdr.frame_cksum,
                self.hdr.big_end,
            );
            self.shared.write_frame(frame, &header, data)?;
            self.shared.index.write().append(frame, page_no.0)?;
            self.hdr.max_frame = frame;
            self.hdr.frame_cksum = (header.checksum1, header.checksum2);
        }

        if let Some(n_page) = commit {
            self.shared.sync()?;
            self.hdr.n_page = n_page;
            self.hdr.change = self.hdr.change.wrapping_add(1);
            *self.shared.header.lock() = self.hdr;
            tracing::debug!(max_frame = self.hdr.max_frame, n_page, "wal commit");
        }
        Ok(())
    }

    /// Forget frames written by the open write transaction.
    pub fn undo(&mut self) {
        if !self.write_lock {
            return;
        }
        let committed = self.shared.header();
        self.shared.index.write().truncate(committed.max_frame);
        self.hdr = committed;
    }

    /// Start the log over from frame 1 if every frame has been backfilled
    /// and no reader can still be using it.
    ///
    /// Only applies while this connection reads through slot 0. Afterwards
    /// the connection holds a mark on a non-zero slot so that it can find
    /// the frames it is about to write.
    fn restart_log(&mut self) -> Result<()> {
        if self.read_lock != Some(0) {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);

        if shared.backfill() > 0 {
            let mut locked = Vec::with_capacity(WAL_NREADER - 1);
            for slot in 1..WAL_NREADER {
                if shared.locks.read[slot].try_lock_exclusive().is_err() {
                    break;
                }
                locked.push(slot);
            }
            let all_locked = locked.len() == WAL_NREADER - 1;
            let restarted = if all_locked {
                self.restart_header()
            } else {
                Ok(())
            };
            for slot in locked {
                shared.locks.read[slot].unlock_exclusive();
            }
            restarted?;
        }

        shared.locks.read[0].unlock_shared();
        self.read_lock = None;
        self.acquire_read(true)
    }

    fn restart_header(&mut self) -> Result<()> {
        let shared = &self.shared;
        {
            let mut header = shared.header.lock();
            header.checkpoint_seq = header.checkpoint_seq.wrapping_add(1);
            header.salt = (header.salt.0.wrapping_add(1), rand::random());
            header.max_frame = 0;
            header.frame_cksum = (0, 0);
            header.change = header.change.wrapping_add(1);
            self.hdr = *header;
        }
        shared.backfill.store(0, Ordering::Release);
        shared.read_marks[1].store(0, Ordering::Release);
        for mark in &shared.read_marks[2..] {
            mark.store(READMARK_NOT_USED, Ordering::Release);
        }
        shared.index.write().clear();

        if let Some(limit) = self.max_wal_size {
            shared.truncate_file(limit)?;
        }
        tracing::debug!(
            checkpoint_seq = self.hdr.checkpoint_seq,
            "wal restarted"
        );
        Ok(())
    }

    // ========================================================================
    // Checkpoint
    // ========================================================================

    /// Copy committed frames into the database file.
    ///
    /// Frames that a live reader may still need from the log are left in
    /// place; the result reports how far backfilling got.
    ///
    /// # Errors
    /// Returns `Error::Busy` if another checkpoint is running or a reader
    /// is using the database file directly.
    pub fn checkpoint(&mut self, db: &mut DbFile) -> Result<CheckpointResult> {
        let shared = Arc::clone(&self.shared);
        shared.locks.checkpointer.try_lock_exclusive()?;
        let result = self.checkpoint_locked(db);
        shared.locks.checkpointer.unlock_exclusive();
        result
    }

    fn checkpoint_locked(&mut self, db: &mut DbFile) -> Result<CheckpointResult> {
        let shared = &self.shared;
        let hdr = shared.header();
        let page_size = hdr.page_size as usize;

        let mut safe = hdr.max_frame;
        for slot in 1..WAL_NREADER {
            let mark = shared.read_mark(slot);
            if mark == READMARK_NOT_USED || safe <= mark {
                continue;
            }
            if shared.locks.read[slot].try_lock_exclusive().is_ok() {
                let bumped = if slot == 1 { safe } else { READMARK_NOT_USED };
                shared.read_marks[slot].store(bumped, Ordering::Release);
                shared.locks.read[slot].unlock_exclusive();
            } else {
                safe = mark;
            }
        }

        let backfill = shared.backfill();
        if backfill < safe {
            self.backfill_snapshot(db, &hdr, backfill, safe, page_size)?;
            tracing::debug!(from = backfill, to = safe, "checkpoint backfilled");
        }

        Ok(CheckpointResult {
            log_frames: hdr.max_frame,
            backfilled: shared.backfill(),
        })
    }

    /// Backfill `from..=to` of the log described by `hdr`.
    ///
    /// A writer may restart the log between taking `hdr` and locking slot
    /// 0. Frames of that snapshot then belong to an older generation and
    /// must not be copied.
    fn backfill_snapshot(
        &self,
        db: &mut DbFile,
        hdr: &WalIndexHeader,
        from: u32,
        to: u32,
        page_size: usize,
    ) -> Result<()> {
        let shared = &self.shared;
        shared.locks.read[0].try_lock_exclusive()?;
        let current = shared.header();
        let result = if current.checkpoint_seq != hdr.checkpoint_seq
            || current.salt != hdr.salt
            || shared.backfill() != from
        {
            tracing::debug!(
                checkpoint_seq = current.checkpoint_seq,
                "log restarted under checkpoint"
            );
            Err(Error::Busy)
        } else {
            self.backfill(db, hdr, from, to, page_size)
        };
        shared.locks.read[0].unlock_exclusive();
        result
    }

    fn backfill(
        &self,
        db: &mut DbFile,
        hdr: &WalIndexHeader,
        from: u32,
        to: u32,
        page_size: usize,
    ) -> Result<()> {
        let shared = &self.shared;

        let latest: BTreeMap<u32, u32> = {
            let index = shared.index.read();
            (from + 1..=to)
                .filter_map(|frame| index.page_at(frame).map(|page| (page, frame)))
                .collect()
        };

        let mut buf = vec![0u8; page_size];
        for (&page, &frame) in &latest {
            if page > hdr.n_page {
                continue;
            }
            shared.read_frame(frame, page_size, &mut buf)?;
            db.write_page(PageNo::new(page), &buf)?;
        }
        db.sync()?;

        if to == hdr.max_frame {
            db.truncate(hdr.n_page)?;
            db.sync()?;
        }
        shared.backfill.store(to, Ordering::Release);
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        self.end_read_transaction();
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("read_lock", &self.read_lock)
            .field("max_frame", &self.hdr.max_frame)
            .field("min_frame", &self.min_frame)
            .field("write_lock", &self.write_lock)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
