//! Default in-process cache backend.
//!
//! Caches belong to a [`CacheGroup`]. In separate mode every cache gets a
//! private group; in shared mode all caches of one backend join a single
//! group and recycle each other's unpinned buffers.
//!
//! # Layout
//! All items of a group live in one arena (`GroupState::slots`). Links are
//! arena indices:
//! ```text
//!   hash chains (per cache)     LRU list (per group, slot 0 is the anchor)
//!   bucket ─▶ item ─▶ item      anchor ⇄ newest ⇄ ... ⇄ oldest ⇄ anchor
//! ```
//! An item is always in its cache's hash table while live, and on the LRU
//! list exactly when unpinned (`lru_next == lru_prev == NIL` ⇔ pinned).

use std::sync::Arc;

use parking_lot::Mutex;

use super::backend::{CacheBackend, CacheItem, CacheModule, CreateFlag, ItemId};
use super::frame::PageFrame;
use super::pool::PagePool;
use crate::common::config::{CacheMode, Config};
use crate::common::{Error, PageNo, Result};

const NIL: u32 = u32::MAX;
const ANCHOR: u32 = 0;

/// Minimum items every cache reserves in its group.
const MIN_ITEMS_PER_CACHE: u32 = 10;

/// Smallest hash table a cache grows to.
const MIN_HASH_SLOTS: usize = 256;

// ============================================================================
// Arena
// ============================================================================

#[derive(Debug)]
struct Slot {
    key: PageNo,
    cache: u32,
    generation: u32,
    bulk_local: bool,
    hash_next: u32,
    lru_next: u32,
    lru_prev: u32,
    frame: Option<Arc<PageFrame>>,
}

impl Slot {
    fn vacant() -> Self {
        Self {
            key: PageNo::NONE,
            cache: NIL,
            generation: 0,
            bulk_local: false,
            hash_next: NIL,
            lru_next: NIL,
            lru_prev: NIL,
            frame: None,
        }
    }

    fn anchor() -> Self {
        Self {
            lru_next: ANCHOR,
            lru_prev: ANCHOR,
            ..Self::vacant()
        }
    }

    #[inline]
    fn is_pinned(&self) -> bool {
        self.lru_next == NIL
    }
}

#[derive(Debug, Default)]
struct CacheState {
    live: bool,
    page_size: usize,
    item_size: usize,
    min_items: u32,
    max_items: u32,
    max90: u32,
    max_key: u32,
    item_num: u32,
    recyclable: u32,
    hash: Vec<u32>,
    /// Bulk-allocated buffers not currently holding a page.
    free: Vec<Arc<PageFrame>>,
    bulk_items: u32,
    bulk_tried: bool,
}

impl CacheState {
    fn bucket(&self, key: PageNo) -> usize {
        key.0 as usize % self.hash.len()
    }

    /// Preallocate the bulk free list on first use.
    fn init_bulk(&mut self) {
        self.bulk_tried = true;
        if self.bulk_items == 0 || self.max_items < 3 {
            return;
        }
        let n = self.bulk_items.min(self.max_items);
        for _ in 0..n {
            match PageFrame::allocate(self.page_size) {
                Some(frame) => self.free.push(Arc::new(frame)),
                None => break,
            }
        }
    }
}

/// Point-in-time view of a cache group's accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupStats {
    pub max_items: u32,
    pub min_items: u32,
    pub max_pinned: u32,
    pub purgeable: u32,
    pub lru_len: usize,
    pub recycled: u64,
    pub evicted: u64,
}

#[derive(Debug)]
struct GroupState {
    max_items: u32,
    min_items: u32,
    max_pinned: u32,
    purgeable: u32,
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    caches: Vec<CacheState>,
    vacant_caches: Vec<u32>,
    recycled: u64,
    evicted: u64,
}

impl GroupState {
    fn new() -> Self {
        Self {
            max_items: 0,
            min_items: 0,
            max_pinned: 0,
            purgeable: 0,
            slots: vec![Slot::anchor()],
            vacant: Vec::new(),
            caches: Vec::new(),
            vacant_caches: Vec::new(),
            recycled: 0,
            evicted: 0,
        }
    }

    fn recompute_max_pinned(&mut self) {
        self.max_pinned = self
            .max_items
            .saturating_add(MIN_ITEMS_PER_CACHE)
            .saturating_sub(self.min_items);
    }

    fn item(&self, idx: u32) -> Option<CacheItem> {
        let slot = &self.slots[idx as usize];
        slot.frame
            .as_ref()
            .map(|frame| CacheItem::new(ItemId::new(idx, slot.generation), Arc::clone(frame)))
    }

    fn is_live(&self, id: ItemId) -> bool {
        id.index != ANCHOR
            && self
                .slots
                .get(id.index as usize)
                .is_some_and(|s| s.generation == id.generation && s.frame.is_some())
    }

    // ========================================================================
    // Cache lifecycle
    // ========================================================================

    fn add_cache(&mut self, page_size: usize, item_size: usize, bulk_items: u32) -> u32 {
        let state = CacheState {
            live: true,
            page_size,
            item_size,
            min_items: MIN_ITEMS_PER_CACHE,
            bulk_items,
            ..CacheState::default()
        };
        self.min_items += MIN_ITEMS_PER_CACHE;
        self.recompute_max_pinned();

        match self.vacant_caches.pop() {
            Some(cid) => {
                self.caches[cid as usize] = state;
                cid
            }
            None => {
                self.caches.push(state);
                (self.caches.len() - 1) as u32
            }
        }
    }

    fn set_cache_size(&mut self, cid: u32, max: u32, pool: &PagePool) {
        let cache = &mut self.caches[cid as usize];
        self.max_items = self.max_items.saturating_sub(cache.max_items).saturating_add(max);
        cache.max_items = max;
        cache.max90 = (u64::from(max) * 9).div_ceil(10) as u32;
        self.recompute_max_pinned();
        self.enforce_max(cid, pool);
    }

    fn destroy_cache(&mut self, cid: u32, pool: &PagePool) {
        self.truncate(cid, PageNo::NONE, pool);
        let cache = &mut self.caches[cid as usize];
        self.max_items = self.max_items.saturating_sub(cache.max_items);
        self.min_items -= cache.min_items;
        cache.max_items = 0;
        self.recompute_max_pinned();
        self.enforce_max(cid, pool);

        self.caches[cid as usize] = CacheState::default();
        self.vacant_caches.push(cid);
    }

    // ========================================================================
    // Fetch
    // ========================================================================

    fn lookup(&self, cid: u32, key: PageNo) -> Option<u32> {
        let cache = &self.caches[cid as usize];
        if cache.hash.is_empty() {
            return None;
        }
        let mut cur = cache.hash[cache.bucket(key)];
        while cur != NIL {
            let slot = &self.slots[cur as usize];
            if slot.key == key {
                return Some(cur);
            }
            cur = slot.hash_next;
        }
        None
    }

    fn fetch(&mut self, cid: u32, key: PageNo, flag: CreateFlag, pool: &PagePool) -> Option<CacheItem> {
        if let Some(idx) = self.lookup(cid, key) {
            if !self.slots[idx as usize].is_pinned() {
                self.pin(idx);
            }
            return self.item(idx);
        }
        match flag {
            CreateFlag::DoNotCreate => None,
            _ => self.fetch_stage2(cid, key, flag, pool),
        }
    }

    fn fetch_stage2(&mut self, cid: u32, key: PageNo, flag: CreateFlag, pool: &PagePool) -> Option<CacheItem> {
        let under_pressure = pool.under_pressure();
        if flag == CreateFlag::EasyAllocate && self.is_nearly_full(cid, under_pressure) {
            return None;
        }

        let cache = &self.caches[cid as usize];
        if cache.item_num as usize >= cache.hash.len() {
            self.resize_hash(cid);
            if self.caches[cid as usize].hash.is_empty() {
                return None;
            }
        }

        let idx = match self.try_recycle(cid, under_pressure, pool) {
            Some(idx) => idx,
            None => self.alloc_item(cid, pool)?,
        };
        self.init_item_with_key(cid, idx, key);
        self.item(idx)
    }

    fn is_nearly_full(&self, cid: u32, under_pressure: bool) -> bool {
        let cache = &self.caches[cid as usize];
        let pinned = cache.item_num - cache.recyclable;
        pinned >= self.max_pinned
            || pinned >= cache.max90
            || (under_pressure && cache.recyclable < pinned)
    }

    fn resize_hash(&mut self, cid: u32) {
        let GroupState { slots, caches, .. } = self;
        let cache = &mut caches[cid as usize];
        let new_len = (cache.hash.len() * 2).max(MIN_HASH_SLOTS);

        let mut new_hash = Vec::new();
        if new_hash.try_reserve_exact(new_len).is_err() {
            return;
        }
        new_hash.resize(new_len, NIL);

        for &head in &cache.hash {
            let mut cur = head;
            while cur != NIL {
                let slot = &mut slots[cur as usize];
                let next = slot.hash_next;
                let bucket = slot.key.0 as usize % new_len;
                slot.hash_next = new_hash[bucket];
                new_hash[bucket] = cur;
                cur = next;
            }
        }
        cache.hash = new_hash;
    }

    /// Take the group's least recently unpinned item for `cid`, if policy
    /// says recycling beats allocating.
    fn try_recycle(&mut self, cid: u32, under_pressure: bool, pool: &PagePool) -> Option<u32> {
        let tail = self.slots[ANCHOR as usize].lru_prev;
        if tail == ANCHOR {
            return None;
        }
        let cache = &self.caches[cid as usize];
        let wants_recycle = cache.item_num + 1 >= cache.max_items
            || self.purgeable >= self.max_items
            || under_pressure;
        if !wants_recycle {
            return None;
        }

        self.pin(tail);
        self.remove_from_hash(tail);

        let owner = self.slots[tail as usize].cache;
        let fits = self.caches[owner as usize].item_size == self.caches[cid as usize].item_size
            && self.slots[tail as usize]
                .frame
                .as_ref()
                .is_some_and(|f| f.page_size() == self.caches[cid as usize].page_size);
        if !fits {
            self.free_item(tail, pool);
            self.evicted += 1;
            return None;
        }

        self.slots[tail as usize].cache = cid;
        self.recycled += 1;
        tracing::trace!(cache = cid, victim = tail, "recycled page buffer");
        Some(tail)
    }

    fn alloc_slot(&mut self) -> Option<u32> {
        if let Some(idx) = self.vacant.pop() {
            return Some(idx);
        }
        self.slots.try_reserve(1).ok()?;
        self.slots.push(Slot::vacant());
        Some((self.slots.len() - 1) as u32)
    }

    fn alloc_item(&mut self, cid: u32, pool: &PagePool) -> Option<u32> {
        let idx = self.alloc_slot()?;

        let cache = &mut self.caches[cid as usize];
        if cache.free.is_empty() && !cache.bulk_tried {
            cache.init_bulk();
        }
        let (frame, bulk_local) = match cache.free.pop() {
            Some(frame) => (frame, true),
            None => match pool.allocate(cache.item_size, cache.page_size) {
                Some(frame) => (Arc::new(frame), false),
                None => {
                    self.vacant.push(idx);
                    return None;
                }
            },
        };

        let slot = &mut self.slots[idx as usize];
        slot.frame = Some(frame);
        slot.bulk_local = bulk_local;
        slot.cache = cid;
        slot.lru_next = NIL;
        slot.lru_prev = NIL;
        self.purgeable += 1;
        Some(idx)
    }

    fn init_item_with_key(&mut self, cid: u32, idx: u32, key: PageNo) {
        let GroupState { slots, caches, .. } = self;
        let cache = &mut caches[cid as usize];
        let bucket = cache.bucket(key);
        let slot = &mut slots[idx as usize];

        slot.key = key;
        slot.cache = cid;
        slot.hash_next = cache.hash[bucket];
        slot.lru_next = NIL;
        slot.lru_prev = NIL;
        cache.hash[bucket] = idx;
        cache.item_num += 1;
        cache.max_key = cache.max_key.max(key.0);

        if let Some(frame) = &slot.frame {
            frame.reset_for_key(key);
        }
    }

    // ========================================================================
    // LRU and hash maintenance
    // ========================================================================

    /// Remove an unpinned item from the LRU list.
    fn pin(&mut self, idx: u32) {
        let (prev, next, cid) = {
            let slot = &self.slots[idx as usize];
            debug_assert!(!slot.is_pinned(), "pinning an already pinned item");
            (slot.lru_prev, slot.lru_next, slot.cache)
        };
        self.slots[prev as usize].lru_next = next;
        self.slots[next as usize].lru_prev = prev;
        let slot = &mut self.slots[idx as usize];
        slot.lru_next = NIL;
        slot.lru_prev = NIL;
        self.caches[cid as usize].recyclable -= 1;
    }

    /// Push a pinned item to the front (most recent end) of the LRU list.
    fn push_lru_front(&mut self, idx: u32) {
        let first = self.slots[ANCHOR as usize].lru_next;
        let slot = &mut self.slots[idx as usize];
        slot.lru_prev = ANCHOR;
        slot.lru_next = first;
        let cid = slot.cache;
        self.slots[first as usize].lru_prev = idx;
        self.slots[ANCHOR as usize].lru_next = idx;
        self.caches[cid as usize].recyclable += 1;
    }

    fn remove_from_hash(&mut self, idx: u32) {
        let GroupState { slots, caches, .. } = self;
        let (key, cid) = (slots[idx as usize].key, slots[idx as usize].cache);
        let cache = &mut caches[cid as usize];
        let bucket = cache.bucket(key);

        let mut prev = NIL;
        let mut cur = cache.hash[bucket];
        while cur != idx {
            if cur == NIL {
                debug_assert!(false, "item {} missing from its hash chain", idx);
                return;
            }
            prev = cur;
            cur = slots[cur as usize].hash_next;
        }
        let next = slots[idx as usize].hash_next;
        if prev == NIL {
            cache.hash[bucket] = next;
        } else {
            slots[prev as usize].hash_next = next;
        }
        slots[idx as usize].hash_next = NIL;
        cache.item_num -= 1;
    }

    /// Release a pinned, unhashed item's buffer and vacate its slot.
    fn free_item(&mut self, idx: u32, pool: &PagePool) {
        let slot = &mut self.slots[idx as usize];
        let frame = slot.frame.take();
        let (bulk_local, cid) = (slot.bulk_local, slot.cache);
        slot.generation = slot.generation.wrapping_add(1);
        slot.key = PageNo::NONE;
        slot.cache = NIL;
        self.vacant.push(idx);
        self.purgeable -= 1;

        // A handle may still hold the buffer; it is only reused once
        // nobody else can see it.
        if let Some(frame) = frame {
            let cache = &mut self.caches[cid as usize];
            if bulk_local && cache.live && Arc::strong_count(&frame) == 1 {
                cache.free.push(frame);
            } else if let Ok(frame) = Arc::try_unwrap(frame) {
                pool.release(frame);
            }
        }
    }

    fn evict_lru_tail(&mut self, pool: &PagePool) -> bool {
        let tail = self.slots[ANCHOR as usize].lru_prev;
        if tail == ANCHOR {
            return false;
        }
        self.pin(tail);
        self.remove_from_hash(tail);
        self.free_item(tail, pool);
        self.evicted += 1;
        true
    }

    /// Evict LRU items until the group is back within budget.
    fn enforce_max(&mut self, cid: u32, pool: &PagePool) {
        while self.purgeable > self.max_items {
            if !self.evict_lru_tail(pool) {
                break;
            }
        }
        let cache = &mut self.caches[cid as usize];
        if cache.item_num == 0 && !cache.free.is_empty() {
            cache.free.clear();
            cache.bulk_tried = false;
        }
    }

    fn unpin(&mut self, id: ItemId, reuse_unlikely: bool, pool: &PagePool) {
        if !self.is_live(id) || !self.slots[id.index as usize].is_pinned() {
            return;
        }
        if reuse_unlikely || self.purgeable > self.max_items {
            self.remove_from_hash(id.index);
            self.free_item(id.index, pool);
            self.evicted += 1;
        } else {
            self.push_lru_front(id.index);
        }
    }

    fn truncate(&mut self, cid: u32, limit: PageNo, pool: &PagePool) {
        let cache = &self.caches[cid as usize];
        if limit.0 > cache.max_key && limit.is_valid() {
            return;
        }

        let mut doomed = Vec::new();
        for &head in &cache.hash {
            let mut cur = head;
            while cur != NIL {
                let slot = &self.slots[cur as usize];
                if slot.key >= limit {
                    doomed.push(cur);
                }
                cur = slot.hash_next;
            }
        }
        for idx in doomed {
            self.remove_from_hash(idx);
            if !self.slots[idx as usize].is_pinned() {
                self.pin(idx);
            }
            self.free_item(idx, pool);
        }
        self.caches[cid as usize].max_key = limit.0.saturating_sub(1);
    }

    fn shrink(&mut self, cid: u32, pool: &PagePool) {
        let saved = self.max_items;
        self.max_items = 0;
        self.enforce_max(cid, pool);
        self.max_items = saved;
    }

    fn lru_keys(&self, cid: u32) -> Vec<PageNo> {
        let mut keys = Vec::new();
        let mut cur = self.slots[ANCHOR as usize].lru_next;
        while cur != ANCHOR {
            let slot = &self.slots[cur as usize];
            if slot.cache == cid {
                keys.push(slot.key);
            }
            cur = slot.lru_next;
        }
        keys
    }

    fn lru_len(&self) -> usize {
        let mut len = 0;
        let mut cur = self.slots[ANCHOR as usize].lru_next;
        while cur != ANCHOR {
            len += 1;
            cur = self.slots[cur as usize].lru_next;
        }
        len
    }
}

// ============================================================================
// Public API: groups, backend and cache handles
// ============================================================================

/// A set of caches sharing one memory budget and one LRU list.
#[derive(Debug)]
pub struct CacheGroup {
    state: Mutex<GroupState>,
    pool: Arc<PagePool>,
}

impl CacheGroup {
    pub fn new(pool: Arc<PagePool>) -> Self {
        Self {
            state: Mutex::new(GroupState::new()),
            pool,
        }
    }

    pub fn stats(&self) -> GroupStats {
        let state = self.state.lock();
        GroupStats {
            max_items: state.max_items,
            min_items: state.min_items,
            max_pinned: state.max_pinned,
            purgeable: state.purgeable,
            lru_len: state.lru_len(),
            recycled: state.recycled,
            evicted: state.evicted,
        }
    }
}

/// The built-in backend: separate or shared groups, optional bulk
/// preallocation, optional page pool.
#[derive(Debug)]
pub struct DefaultCacheBackend {
    bulk_items: u32,
    pool: Arc<PagePool>,
    shared: Option<Arc<CacheGroup>>,
}

impl DefaultCacheBackend {
    pub fn new(config: &Config) -> Self {
        let pool = Arc::new(PagePool::new(config.page_pool));
        let shared = match config.cache_mode {
            CacheMode::Shared => Some(Arc::new(CacheGroup::new(Arc::clone(&pool)))),
            CacheMode::Separate => None,
        };
        // Bulk buffers are private to a cache, which only pays off when the
        // cache does not share its group.
        let bulk_items = match config.cache_mode {
            CacheMode::Separate => config.bulk_items,
            CacheMode::Shared => 0,
        };
        Self {
            bulk_items,
            pool,
            shared,
        }
    }

    /// Create a cache and return it as the concrete type.
    pub fn create_cache(&self, page_size: usize, extra_size: usize) -> DefaultCache {
        let group = match &self.shared {
            Some(group) => Arc::clone(group),
            None => Arc::new(CacheGroup::new(Arc::clone(&self.pool))),
        };
        let item_size = page_size + extra_size + std::mem::size_of::<Slot>().next_multiple_of(8);
        let id = group
            .state
            .lock()
            .add_cache(page_size, item_size, self.bulk_items);
        DefaultCache { group, id }
    }

    pub fn pool(&self) -> &Arc<PagePool> {
        &self.pool
    }
}

impl CacheBackend for DefaultCacheBackend {
    fn create(&self, page_size: usize, extra_size: usize) -> Result<Box<dyn CacheModule>> {
        if page_size == 0 {
            return Err(Error::InvalidConfig("page size must be non-zero".into()));
        }
        Ok(Box::new(self.create_cache(page_size, extra_size)))
    }
}

/// Handle to one cache of a [`CacheGroup`]. Dropping it destroys the cache.
#[derive(Debug)]
pub struct DefaultCache {
    group: Arc<CacheGroup>,
    id: u32,
}

impl DefaultCache {
    pub fn group(&self) -> &Arc<CacheGroup> {
        &self.group
    }

    /// Keys of this cache's unpinned items, most recently unpinned first.
    pub fn lru_keys(&self) -> Vec<PageNo> {
        self.group.state.lock().lru_keys(self.id)
    }

    /// Number of unpinned items of this cache.
    pub fn recyclable(&self) -> u32 {
        self.group.state.lock().caches[self.id as usize].recyclable
    }

    /// Whether `item` still refers to a live, pinned entry.
    pub fn is_pinned(&self, item: &CacheItem) -> bool {
        let state = self.group.state.lock();
        state.is_live(item.id()) && state.slots[item.id().index as usize].is_pinned()
    }
}

impl CacheModule for DefaultCache {
    fn set_cache_size(&self, max_items: u32) {
        let mut state = self.group.state.lock();
        state.set_cache_size(self.id, max_items, &self.group.pool);
    }

    fn page_count(&self) -> usize {
        self.group.state.lock().caches[self.id as usize].item_num as usize
    }

    fn fetch(&self, key: PageNo, flag: CreateFlag) -> Option<CacheItem> {
        debug_assert!(key.is_valid());
        let mut state = self.group.state.lock();
        state.fetch(self.id, key, flag, &self.group.pool)
    }

    fn unpin(&self, item: &CacheItem, reuse_unlikely: bool) {
        let mut state = self.group.state.lock();
        state.unpin(item.id(), reuse_unlikely, &self.group.pool);
    }

    fn truncate(&self, limit: PageNo) {
        let mut state = self.group.state.lock();
        state.truncate(self.id, limit, &self.group.pool);
    }

    fn shrink(&self) {
        let mut state = self.group.state.lock();
        state.shrink(self.id, &self.group.pool);
    }
}

impl Drop for DefaultCache {
    fn drop(&mut self) {
        let mut state = self.group.state.lock();
        state.destroy_cache(self.id, &self.group.pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(mode: CacheMode) -> DefaultCacheBackend {
        DefaultCacheBackend::new(&Config::new().with_cache_mode(mode))
    }

    fn cache_with_max(max: u32) -> DefaultCache {
        let cache = backend(CacheMode::Separate).create_cache(512, 0);
        cache.set_cache_size(max);
        cache
    }

    fn pg(n: u32) -> PageNo {
        PageNo::new(n)
    }

    // ========================================================================
    // Fetch / unpin
    // ========================================================================

    #[test]
    fn test_fetch_miss_without_create() {
        let cache = cache_with_max(10);
        assert!(cache.fetch(pg(1), CreateFlag::DoNotCreate).is_none());
        assert_eq!(cache.page_count(), 0);
    }

    #[test]
    fn test_fetch_hit_returns_same_buffer() {
        let cache = cache_with_max(10);
        let item = cache.fetch(pg(7), CreateFlag::HardAllocate).unwrap();
        item.frame().data_mut()[0] = 0xAA;
        cache.unpin(&item, false);

        let again = cache.fetch(pg(7), CreateFlag::DoNotCreate).unwrap();
        assert_eq!(again.id(), item.id());
        assert_eq!(again.frame().data()[0], 0xAA);
        assert!(cache.is_pinned(&again));
        assert!(cache.lru_keys().is_empty());
    }

    #[test]
    fn test_unpin_pushes_lru_front() {
        let cache = cache_with_max(10);
        let items: Vec<_> = (1..=3)
            .map(|n| cache.fetch(pg(n), CreateFlag::HardAllocate).unwrap())
            .collect();
        for item in &items {
            cache.unpin(item, false);
        }
        assert_eq!(cache.lru_keys(), vec![pg(3), pg(2), pg(1)]);
        assert_eq!(cache.recyclable(), 3);
    }

    #[test]
    fn test_reuse_unlikely_discards() {
        let cache = cache_with_max(10);
        let item = cache.fetch(pg(1), CreateFlag::HardAllocate).unwrap();
        cache.unpin(&item, true);

        assert_eq!(cache.page_count(), 0);
        assert!(cache.fetch(pg(1), CreateFlag::DoNotCreate).is_none());
        assert_eq!(cache.group().stats().purgeable, 0);
    }

    #[test]
    fn test_stale_handle_unpin_is_ignored() {
        let cache = cache_with_max(10);
        let item = cache.fetch(pg(1), CreateFlag::HardAllocate).unwrap();
        cache.unpin(&item, true);

        let other = cache.fetch(pg(2), CreateFlag::HardAllocate).unwrap();
        // Same slot, newer generation.
        assert_eq!(other.id().index, item.id().index);
        cache.unpin(&item, false);
        assert!(cache.is_pinned(&other));
    }

    // ========================================================================
    // Recycling and budget
    // ========================================================================

    #[test]
    fn test_easy_allocate_recycles_lru() {
        let cache = cache_with_max(3);
        let p1 = cache.fetch(pg(1), CreateFlag::HardAllocate).unwrap();
        let _p2 = cache.fetch(pg(2), CreateFlag::HardAllocate).unwrap();
        let _p3 = cache.fetch(pg(3), CreateFlag::HardAllocate).unwrap();
        cache.unpin(&p1, false);

        let p4 = cache.fetch(pg(4), CreateFlag::EasyAllocate).unwrap();
        assert!(Arc::ptr_eq(p1.frame(), p4.frame()));
        assert_eq!(p4.key(), pg(4));
        assert!(cache.fetch(pg(1), CreateFlag::DoNotCreate).is_none());
        assert_eq!(cache.group().stats().recycled, 1);
    }

    #[test]
    fn test_easy_allocate_fails_when_nearly_full() {
        let cache = cache_with_max(3);
        let _items: Vec<_> = (1..=3)
            .map(|n| cache.fetch(pg(n), CreateFlag::HardAllocate).unwrap())
            .collect();

        assert!(cache.fetch(pg(4), CreateFlag::EasyAllocate).is_none());
        // Hard allocation overshoots rather than fail.
        assert!(cache.fetch(pg(4), CreateFlag::HardAllocate).is_some());
    }

    #[test]
    fn test_huge_cache_size() {
        let cache = cache_with_max(u32::MAX);
        assert_eq!(cache.group().stats().max_items, u32::MAX);
        let item = cache.fetch(pg(1), CreateFlag::EasyAllocate).unwrap();
        cache.unpin(&item, false);
        assert_eq!(cache.lru_keys(), vec![pg(1)]);

        cache.set_cache_size(2);
        assert_eq!(cache.group().stats().max_items, 2);
        assert!(cache.fetch(pg(1), CreateFlag::DoNotCreate).is_some());
    }

    #[test]
    fn test_overshoot_reclaimed_on_unpin() {
        let cache = cache_with_max(2);
        let items: Vec<_> = (1..=4)
            .map(|n| cache.fetch(pg(n), CreateFlag::HardAllocate).unwrap())
            .collect();
        assert_eq!(cache.group().stats().purgeable, 4);

        for item in &items {
            cache.unpin(item, false);
        }
        let stats = cache.group().stats();
        assert!(stats.purgeable <= stats.max_items);
    }

    #[test]
    fn test_set_cache_size_enforces_budget() {
        let cache = cache_with_max(8);
        for n in 1..=8 {
            let item = cache.fetch(pg(n), CreateFlag::HardAllocate).unwrap();
            cache.unpin(&item, false);
        }
        cache.set_cache_size(3);

        let stats = cache.group().stats();
        assert_eq!(stats.max_items, 3);
        assert!(stats.purgeable <= 3);
        // Oldest went first.
        assert!(cache.fetch(pg(1), CreateFlag::DoNotCreate).is_none());
    }

    #[test]
    fn test_group_accounting() {
        let cache = cache_with_max(100);
        let stats = cache.group().stats();
        assert_eq!(stats.min_items, 10);
        assert_eq!(stats.max_pinned, 100);
    }

    #[test]
    fn test_recycle_rejects_mismatched_item_size() {
        let backend = backend(CacheMode::Shared);
        let small = backend.create_cache(512, 0);
        let big = backend.create_cache(1024, 0);
        small.set_cache_size(20);
        big.set_cache_size(1);

        let a = small.fetch(pg(1), CreateFlag::HardAllocate).unwrap();
        small.unpin(&a, false);

        let b = big.fetch(pg(1), CreateFlag::HardAllocate).unwrap();
        assert_eq!(b.frame().data().len(), 1024);
        // The 512-byte buffer was freed instead of reused.
        assert!(small.fetch(pg(1), CreateFlag::DoNotCreate).is_none());
        assert_eq!(small.page_count(), 0);
    }

    #[test]
    fn test_shared_group_recycles_across_caches() {
        let backend = backend(CacheMode::Shared);
        let c1 = backend.create_cache(512, 0);
        let c2 = backend.create_cache(512, 0);
        c1.set_cache_size(2);
        c2.set_cache_size(2);

        for n in 1..=2 {
            let item = c1.fetch(pg(n), CreateFlag::HardAllocate).unwrap();
            c1.unpin(&item, false);
        }
        let a = c2.fetch(pg(10), CreateFlag::HardAllocate).unwrap();
        let b = c2.fetch(pg(11), CreateFlag::HardAllocate).unwrap();
        assert_eq!(a.key(), pg(10));
        assert_eq!(b.key(), pg(11));

        let stats = c1.group().stats();
        assert!(stats.purgeable <= stats.max_items);
        assert!(stats.recycled >= 1);
    }

    // ========================================================================
    // Hash table, truncate, destroy
    // ========================================================================

    #[test]
    fn test_hash_grows_past_initial_size() {
        let cache = cache_with_max(1000);
        for n in 1..=600 {
            let item = cache.fetch(pg(n), CreateFlag::HardAllocate).unwrap();
            cache.unpin(&item, false);
        }
        assert_eq!(cache.page_count(), 600);
        for n in 1..=600 {
            let item = cache.fetch(pg(n), CreateFlag::DoNotCreate).unwrap();
            assert_eq!(item.key(), pg(n));
            cache.unpin(&item, false);
        }
    }

    #[test]
    fn test_truncate_discards_high_keys() {
        let cache = cache_with_max(10);
        let pinned = cache.fetch(pg(5), CreateFlag::HardAllocate).unwrap();
        for n in [1, 2, 6] {
            let item = cache.fetch(pg(n), CreateFlag::HardAllocate).unwrap();
            cache.unpin(&item, false);
        }

        cache.truncate(pg(3));

        assert_eq!(cache.page_count(), 2);
        assert!(cache.fetch(pg(6), CreateFlag::DoNotCreate).is_none());
        assert!(!cache.is_pinned(&pinned));
        assert_eq!(cache.lru_keys(), vec![pg(2), pg(1)]);
    }

    #[test]
    fn test_destroy_returns_budget() {
        let backend = backend(CacheMode::Shared);
        let c1 = backend.create_cache(512, 0);
        c1.set_cache_size(50);
        let group = Arc::clone(c1.group());
        {
            let c2 = backend.create_cache(512, 0);
            c2.set_cache_size(30);
            for n in 1..=5 {
                let item = c2.fetch(pg(n), CreateFlag::HardAllocate).unwrap();
                c2.unpin(&item, false);
            }
            assert_eq!(group.stats().max_items, 80);
        }
        let stats = group.stats();
        assert_eq!(stats.max_items, 50);
        assert_eq!(stats.min_items, 10);
        assert_eq!(stats.purgeable, 0);
        assert_eq!(stats.lru_len, 0);
    }

    #[test]
    fn test_shrink_releases_unpinned() {
        let cache = cache_with_max(10);
        let keep = cache.fetch(pg(1), CreateFlag::HardAllocate).unwrap();
        for n in 2..=5 {
            let item = cache.fetch(pg(n), CreateFlag::HardAllocate).unwrap();
            cache.unpin(&item, false);
        }
        cache.shrink();
        assert_eq!(cache.page_count(), 1);
        assert!(cache.is_pinned(&keep));
        assert_eq!(cache.group().stats().max_items, 10);
    }

    // ========================================================================
    // Bulk allocation and memory pressure
    // ========================================================================

    #[test]
    fn test_bulk_items_feed_free_list() {
        let backend = DefaultCacheBackend::new(&Config::new().with_bulk_items(4));
        let cache = backend.create_cache(512, 0);
        cache.set_cache_size(8);

        let item = cache.fetch(pg(1), CreateFlag::HardAllocate).unwrap();
        {
            let state = cache.group().state.lock();
            assert_eq!(state.caches[cache.id as usize].free.len(), 3);
            assert!(state.slots[item.id().index as usize].bulk_local);
        }
        cache.unpin(&item, false);
        drop(item);
        cache.truncate(pg(1));

        let state = cache.group().state.lock();
        assert_eq!(state.caches[cache.id as usize].free.len(), 4);
    }

    #[test]
    fn test_memory_pressure_prefers_recycling() {
        let config = Config::new().with_page_pool(1024, 5);
        let backend = DefaultCacheBackend::new(&config);
        let cache = backend.create_cache(512, 0);
        cache.set_cache_size(100);

        // reserve = 5/10 + 1 = 1; take all five slots
        for n in 1..=5 {
            let item = cache.fetch(pg(n), CreateFlag::HardAllocate).unwrap();
            cache.unpin(&item, false);
        }
        assert!(backend.pool().under_pressure());

        let before = cache.group().stats().purgeable;
        let item = cache.fetch(pg(6), CreateFlag::HardAllocate).unwrap();
        assert_eq!(cache.group().stats().purgeable, before);
        assert_eq!(item.key(), pg(6));
        assert!(cache.fetch(pg(1), CreateFlag::DoNotCreate).is_none());
    }
}
