//! Page cache - the pager's view of its cache module.
//!
//! Wraps a [`CacheModule`] with per-page reference counts and the dirty list.
//! A page stays pinned in the module while it is referenced or dirty; once
//! both drop to zero it is handed back to the module's LRU.

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard};

use super::backend::{CacheBackend, CacheItem, CacheModule, CreateFlag};
use super::frame::PageFrame;
use crate::common::{Error, PageNo, Result};

/// A page attached to a pager's cache.
///
/// Cloning a `Page` does not take a reference; references are counted by
/// [`PageCache::fetch_finish`] and [`PageCache::release`].
#[derive(Clone, Debug)]
pub struct Page {
    no: PageNo,
    item: CacheItem,
}

impl Page {
    #[inline]
    pub fn no(&self) -> PageNo {
        self.no
    }

    #[inline]
    pub fn frame(&self) -> &PageFrame {
        self.item.frame()
    }

    #[inline]
    pub fn data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        self.item.frame().data()
    }

    #[inline]
    pub fn data_mut(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        self.item.frame().data_mut()
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.frame().is_dirty()
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.frame().ref_count()
    }

    /// Whether a pager has already read this page's content.
    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.frame().is_loaded()
    }
}

/// Called when the cache is full of dirty pages.
///
/// The implementation writes `page` somewhere durable. On `Ok` the page
/// cache marks the page clean; `Err(Busy)` skips the spill, any other error
/// aborts the fetch.
pub trait Stress {
    fn stress(&mut self, page: &Page) -> Result<()>;
}

// ============================================================================
// Dirty list
// ============================================================================

#[derive(Debug)]
struct DirtyNode {
    page: Page,
    /// Toward the head (more recently dirtied).
    prev: Option<usize>,
    /// Toward the tail (less recently dirtied).
    next: Option<usize>,
}

/// Doubly linked list of dirty pages in an index arena, newest first.
#[derive(Debug, Default)]
struct DirtyList {
    nodes: Vec<Option<DirtyNode>>,
    vacant: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl DirtyList {
    fn push_front(&mut self, page: Page) -> usize {
        let node = DirtyNode {
            page,
            prev: None,
            next: self.head,
        };
        let slot = match self.vacant.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        match self.head {
            Some(old) => {
                if let Some(n) = self.nodes[old].as_mut() {
                    n.prev = Some(slot);
                }
            }
            None => self.tail = Some(slot),
        }
        self.head = Some(slot);
        self.len += 1;
        slot
    }

    fn remove(&mut self, slot: usize) -> Option<Page> {
        let node = self.nodes.get_mut(slot)?.take()?;
        match node.prev {
            Some(p) => {
                if let Some(n) = self.nodes[p].as_mut() {
                    n.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(nx) => {
                if let Some(n) = self.nodes[nx].as_mut() {
                    n.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }
        self.vacant.push(slot);
        self.len -= 1;
        Some(node.page)
    }

    /// Pages from newest to oldest.
    fn iter(&self) -> impl Iterator<Item = &Page> + '_ {
        let mut cur = self.head;
        std::iter::from_fn(move || {
            let node = self.nodes[cur?].as_ref()?;
            cur = node.next;
            Some(&node.page)
        })
    }

    /// Least recently dirtied page nobody holds a reference to.
    fn oldest_unreferenced(&self) -> Option<Page> {
        let mut cur = self.tail;
        while let Some(slot) = cur {
            let node = self.nodes[slot].as_ref()?;
            if node.page.ref_count() == 0 {
                return Some(node.page.clone());
            }
            cur = node.prev;
        }
        None
    }
}

// ============================================================================
// PageCache
// ============================================================================

/// Reference-counted page cache with a dirty list.
pub struct PageCache {
    module: Box<dyn CacheModule>,
    dirty: DirtyList,
    ref_sum: u64,
    page_size: usize,
    cache_size: u32,
    spill_size: usize,
}

impl PageCache {
    /// Create a cache through `backend`.
    ///
    /// # Errors
    /// Whatever the backend reports, typically `Error::OutOfMemory`.
    pub fn open(
        backend: &dyn CacheBackend,
        page_size: usize,
        extra_size: usize,
        cache_size: u32,
        spill_size: usize,
    ) -> Result<Self> {
        let module = backend.create(page_size, extra_size)?;
        module.set_cache_size(cache_size);
        Ok(Self {
            module,
            dirty: DirtyList::default(),
            ref_sum: 0,
            page_size,
            cache_size,
            spill_size,
        })
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn set_cache_size(&mut self, max_items: u32) {
        self.cache_size = max_items;
        self.module.set_cache_size(max_items);
    }

    pub fn cache_size(&self) -> u32 {
        self.cache_size
    }

    /// Allocation effort for a create-intent fetch: while dirty pages exist a
    /// failed allocation can be retried after spilling one of them.
    fn create_flag(&self) -> CreateFlag {
        if self.dirty.len == 0 {
            CreateFlag::HardAllocate
        } else {
            CreateFlag::EasyAllocate
        }
    }

    // ========================================================================
    // Public API: fetch and release
    // ========================================================================

    /// Look up `no`, allocating a buffer if `create` is set and that is cheap.
    pub fn fetch(&mut self, no: PageNo, create: bool) -> Option<CacheItem> {
        let flag = if create {
            self.create_flag()
        } else {
            CreateFlag::DoNotCreate
        };
        self.module.fetch(no, flag)
    }

    /// Allocate a buffer for `no` after a failed [`fetch`](Self::fetch),
    /// spilling a dirty page through `stress` first if one is available.
    ///
    /// # Errors
    /// - Any error from `stress` other than `Busy`
    /// - `Error::OutOfMemory` if no buffer can be allocated
    pub fn fetch_stress(&mut self, no: PageNo, stress: &mut dyn Stress) -> Result<CacheItem> {
        if self.dirty.len > 0 && self.module.page_count() >= self.spill_size {
            if let Some(victim) = self.dirty.oldest_unreferenced() {
                match stress.stress(&victim) {
                    Ok(()) => {
                        tracing::debug!(page = victim.no().0, "spilled dirty page");
                        self.mark_clean(&victim);
                    }
                    Err(Error::Busy) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        self.module
            .fetch(no, CreateFlag::HardAllocate)
            .ok_or(Error::OutOfMemory)
    }

    /// Turn a fetched item into a referenced page.
    pub fn fetch_finish(&mut self, no: PageNo, item: CacheItem) -> Page {
        let frame = item.frame();
        if !frame.is_initialized() {
            frame.initialize();
        }
        frame.add_ref();
        self.ref_sum += 1;
        Page { no, item }
    }

    /// Drop one reference. An unreferenced clean page goes back to the
    /// module's LRU; an unreferenced dirty page moves to the head of the
    /// dirty list.
    pub fn release(&mut self, page: &Page) {
        self.ref_sum -= 1;
        if page.frame().release_ref() > 0 {
            return;
        }
        if page.is_dirty() {
            if let Some(slot) = page.frame().dirty_slot() {
                if let Some(p) = self.dirty.remove(slot) {
                    let slot = self.dirty.push_front(p);
                    page.frame().set_dirty_slot(Some(slot));
                }
            }
        } else {
            self.module.unpin(&page.item, false);
        }
    }

    /// Discard a page whose content could not be loaded. The cache ends up
    /// as if the page had never been fetched.
    pub fn drop_page(&mut self, page: &Page) {
        if page.is_dirty() {
            self.unlink_dirty(page);
        }
        self.ref_sum -= page.ref_count() as u64;
        page.frame().reset_for_key(page.no());
        self.module.unpin(&page.item, true);
    }

    // ========================================================================
    // Public API: dirty tracking
    // ========================================================================

    /// Mark a clean page dirty and link it at the head of the dirty list.
    pub fn mark_dirty(&mut self, page: &Page) {
        if page.is_dirty() {
            return;
        }
        page.frame().set_dirty();
        let slot = self.dirty.push_front(page.clone());
        page.frame().set_dirty_slot(Some(slot));
    }

    /// Mark a dirty page clean; unpin it if nobody references it.
    pub fn mark_clean(&mut self, page: &Page) {
        if !page.is_dirty() {
            return;
        }
        self.unlink_dirty(page);
        page.frame().set_clean();
        if page.ref_count() == 0 {
            self.module.unpin(&page.item, false);
        }
    }

    fn unlink_dirty(&mut self, page: &Page) {
        if let Some(slot) = page.frame().dirty_slot() {
            self.dirty.remove(slot);
            page.frame().set_dirty_slot(None);
        }
    }

    /// Mark every dirty page clean.
    pub fn clean_all(&mut self) {
        for page in self.dirty_pages() {
            self.mark_clean(&page);
        }
    }

    /// Throw away every dirty page's content. Unreferenced ones leave the
    /// cache; referenced ones are reloaded on their next fetch.
    pub fn discard_dirty(&mut self) {
        for page in self.dirty_pages() {
            self.unlink_dirty(&page);
            page.frame().set_clean();
            page.frame().set_loaded(false);
            if page.ref_count() == 0 {
                self.module.unpin(&page.item, true);
            }
        }
    }

    /// Dirty pages sorted by page number.
    pub fn dirty_pages(&self) -> Vec<Page> {
        let mut pages: Vec<Page> = self.dirty.iter().cloned().collect();
        pages.sort_by_key(|p| p.no());
        pages
    }

    /// Dirty pages, most recently dirtied first.
    pub fn dirty_pages_by_recency(&self) -> Vec<PageNo> {
        self.dirty.iter().map(|p| p.no()).collect()
    }

    #[inline]
    pub fn dirty_count(&self) -> usize {
        self.dirty.len
    }

    // ========================================================================
    // Public API: bulk maintenance
    // ========================================================================

    /// Forget every page numbered `limit` or above.
    pub fn truncate(&mut self, limit: PageNo) {
        for page in self.dirty_pages() {
            if page.no() >= limit {
                self.unlink_dirty(&page);
                page.frame().set_clean();
            }
        }
        self.module.truncate(limit);
    }

    /// Forget every page.
    pub fn clear(&mut self) {
        self.truncate(PageNo::NONE);
    }

    pub fn shrink(&mut self) {
        self.module.shrink();
    }

    #[inline]
    pub fn total_refs(&self) -> u64 {
        self.ref_sum
    }

    pub fn page_count(&self) -> usize {
        self.module.page_count()
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("page_size", &self.page_size)
            .field("cache_size", &self.cache_size)
            .field("pages", &self.module.page_count())
            .field("dirty", &self.dirty.len)
            .field("refs", &self.ref_sum)
            .finish()
    }
}
