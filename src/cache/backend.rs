//! The pluggable cache backend interface.
//!
//! A [`CacheBackend`] creates [`CacheModule`]s, one per pager. The engine
//! ships [`DefaultCacheBackend`](super::DefaultCacheBackend); anything else
//! implementing these traits can be handed to
//! [`Engine::with_cache_backend`](crate::pager::Engine::with_cache_backend).

use std::sync::Arc;

use super::frame::PageFrame;
use crate::common::{PageNo, Result};

/// How hard `fetch` should try when the key is not cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateFlag {
    /// Only look up; never allocate.
    DoNotCreate,
    /// Allocate only if that is cheap: fail when the cache is nearly full.
    EasyAllocate,
    /// Allocate unless memory is truly exhausted.
    HardAllocate,
}

/// Generation-checked handle to a slot of a cache's item arena.
///
/// A handle to an item that has since been freed (and possibly reused for a
/// different key) is detected by its stale generation and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ItemId {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

/// A pinned cache item: its handle plus the page buffer.
#[derive(Clone, Debug)]
pub struct CacheItem {
    id: ItemId,
    frame: Arc<PageFrame>,
}

impl CacheItem {
    pub fn new(id: ItemId, frame: Arc<PageFrame>) -> Self {
        Self { id, frame }
    }

    #[inline]
    pub fn id(&self) -> ItemId {
        self.id
    }

    #[inline]
    pub fn frame(&self) -> &Arc<PageFrame> {
        &self.frame
    }

    #[inline]
    pub fn key(&self) -> PageNo {
        self.frame.page_no()
    }
}

/// Factory for per-pager caches.
pub trait CacheBackend: Send + Sync {
    /// Create a cache for pages of `page_size` bytes, each carrying
    /// `extra_size` bytes of per-page bookkeeping.
    ///
    /// # Errors
    /// Returns `Error::OutOfMemory` if the cache cannot be set up.
    fn create(&self, page_size: usize, extra_size: usize) -> Result<Box<dyn CacheModule>>;
}

/// One logical cache of page buffers keyed by page number.
///
/// Dropping the module destroys the cache and gives its budget back to its
/// group.
pub trait CacheModule: Send + Sync {
    /// Set the maximum number of items this cache should hold.
    fn set_cache_size(&self, max_items: u32);

    /// Number of items currently in the cache, pinned or not.
    fn page_count(&self) -> usize;

    /// Look up `key`, allocating according to `flag` on a miss. A returned
    /// item is pinned.
    fn fetch(&self, key: PageNo, flag: CreateFlag) -> Option<CacheItem>;

    /// Unpin an item. With `reuse_unlikely` the item is discarded at once.
    fn unpin(&self, item: &CacheItem, reuse_unlikely: bool);

    /// Discard every item whose key is `>= limit`, pinned or not.
    fn truncate(&self, limit: PageNo);

    /// Release as much unpinned memory as possible.
    fn shrink(&self);
}
