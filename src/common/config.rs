//! Engine configuration and hard limits.
//!
//! A [`Config`] is built once when the engine starts and handed by reference
//! to every component constructor. Nothing in the crate reads ambient global
//! state.

use crate::common::{Error, Result};

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest page size a database may use.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest page size a database may use.
pub const MAX_PAGE_SIZE: usize = 65536;

/// Default number of pages a single cache may hold.
pub const DEFAULT_CACHE_SIZE: u32 = 2000;

/// Maximum number of page descents a cursor performs before it reports the
/// tree as corrupt.
///
/// A well-formed tree of 4KB pages holding billions of keys is far shallower
/// than this, so hitting the bound means the child-pointer graph loops.
pub const TREE_MAX_DEPTH: usize = 20;

/// How caches of different files share their memory budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Every cache owns a private group and only recycles its own pages.
    #[default]
    Separate,
    /// All caches created by one backend join a single group and may recycle
    /// each other's unpinned pages.
    Shared,
}

/// A pool of preallocated page buffers.
///
/// When the pool runs low the page cache considers itself under memory
/// pressure and prefers recycling over fresh allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePoolConfig {
    /// Size of each slot in bytes.
    pub slot_size: usize,
    /// Number of slots in the pool.
    pub slot_count: usize,
}

/// Configuration for an engine instance.
///
/// # Example
/// ```
/// use udb::common::config::{CacheMode, Config};
///
/// let config = Config::default()
///     .with_page_size(8192)
///     .with_cache_size(500)
///     .with_cache_mode(CacheMode::Shared);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Page size used when creating a database. Existing databases keep the
    /// page size recorded in their file header.
    pub page_size: usize,
    /// Maximum number of pages kept by each pager's cache.
    pub cache_size: u32,
    /// Separate or shared cache groups.
    pub cache_mode: CacheMode,
    /// Buffers preallocated by each cache on its first allocation.
    pub bulk_items: u32,
    /// Optional preallocated buffer pool.
    pub page_pool: Option<PagePoolConfig>,
    /// Minimum number of cached pages before dirty pages may be spilled to
    /// the WAL to make room.
    pub spill_size: usize,
    /// WAL file size, in bytes, to truncate to when the log restarts.
    pub max_wal_size: Option<u64>,
}

impl Config {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            cache_mode: CacheMode::Separate,
            bulk_items: 0,
            page_pool: None,
            spill_size: 1,
            max_wal_size: None,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_cache_size(mut self, cache_size: u32) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn with_cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    pub fn with_bulk_items(mut self, bulk_items: u32) -> Self {
        self.bulk_items = bulk_items;
        self
    }

    pub fn with_page_pool(mut self, slot_size: usize, slot_count: usize) -> Self {
        self.page_pool = Some(PagePoolConfig {
            slot_size,
            slot_count,
        });
        self
    }

    pub fn with_spill_size(mut self, spill_size: usize) -> Self {
        self.spill_size = spill_size;
        self
    }

    pub fn with_max_wal_size(mut self, bytes: u64) -> Self {
        self.max_wal_size = Some(bytes);
        self
    }

    /// Check that every field is within its legal range.
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)?;
        if self.cache_size == 0 {
            return Err(Error::InvalidConfig("cache_size must be at least 1".into()));
        }
        if let Some(pool) = self.page_pool {
            if pool.slot_size == 0 && pool.slot_count > 0 {
                return Err(Error::InvalidConfig(
                    "page_pool slot_size must be non-zero".into(),
                ));
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Check that `page_size` is a power of two between 512 and 65536.
pub fn validate_page_size(page_size: usize) -> Result<()> {
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(Error::InvalidConfig(format!(
            "page size {} is not a power of two between {} and {}",
            page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
        )));
    }
    Ok(())
}
