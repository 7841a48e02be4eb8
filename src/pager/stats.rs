//! Pager statistics tracking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by a pager.
///
/// All fields are atomic so that page handles on any thread can update them
/// without taking a lock. `Ordering::Relaxed` is enough: the counters are
/// independent and only read for reporting.
///
/// # Example
/// ```
/// use udb::PagerStats;
/// use std::sync::atomic::Ordering;
///
/// let stats = PagerStats::new();
/// stats.cache_hits.fetch_add(1, Ordering::Relaxed);
/// assert_eq!(stats.cache_hits.load(Ordering::Relaxed), 1);
/// ```
#[derive(Debug)]
pub struct PagerStats {
    /// Fetches served by a page already loaded in the cache.
    pub cache_hits: AtomicU64,

    /// Fetches that had to populate a fresh buffer.
    pub cache_misses: AtomicU64,

    /// Page images read from the WAL or the database file.
    pub pages_read: AtomicU64,

    /// Page images appended to the WAL.
    pub pages_written: AtomicU64,

    /// Dirty pages written early to make room in the cache.
    pub spills: AtomicU64,
}

impl PagerStats {
    pub fn new() -> Self {
        Self {
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            pages_read: AtomicU64::new(0),
            pages_written: AtomicU64::new(0),
            spills: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Cache hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        self.snapshot().hit_rate()
    }

    /// Non-atomic copy for display and comparison.
    pub fn snapshot(&self) -> PagerStatsSnapshot {
        PagerStatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            pages_read: self.pages_read.load(Ordering::Relaxed),
            pages_written: self.pages_written.load(Ordering::Relaxed),
            spills: self.spills.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.pages_read.store(0, Ordering::Relaxed);
        self.pages_written.store(0, Ordering::Relaxed);
        self.spills.store(0, Ordering::Relaxed);
    }
}

impl Default for PagerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time copy of [`PagerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PagerStatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub pages_read: u64,
    pub pages_written: u64,
    pub spills: u64,
}

impl PagerStatsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

impl fmt::Display for PagerStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stats {{ hits: {}, misses: {}, read: {}, written: {}, spills: {}, hit_rate: {:.2}% }}",
            self.cache_hits,
            self.cache_misses,
            self.pages_read,
            self.pages_written,
            self.spills,
            self.hit_rate() * 100.0
        )
    }
}
