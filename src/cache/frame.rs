//! PageFrame - the buffer behind one cache item.
//!
//! A [`PageFrame`] holds the raw bytes of a page plus the metadata the page
//! cache keeps for it while it is attached to a pager:
//! - Which page is loaded
//! - Reference count of the pager's handles
//! - Clean/dirty flags and the slot in the pager's dirty list
//!
//! Frames are recycled between keys (and between caches of one group), so
//! [`PageFrame::reset_for_key`] wipes all of the pager metadata whenever the
//! cache hands the buffer out under a new key.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};

use crate::common::PageNo;

const FLAG_CLEAN: u8 = 0x01;
const FLAG_DIRTY: u8 = 0x02;

/// A page buffer plus per-page bookkeeping.
///
/// # Thread Safety
/// - `data`: `RwLock` so cursors may read while no one writes
/// - `ref_count`, `flags`: atomics, mutated by the owning pager only
/// - `dirty_slot`: `Mutex` for the dirty-list arena index
pub struct PageFrame {
    data: RwLock<Box<[u8]>>,
    page_size: usize,
    from_pool: bool,
    page_no: AtomicU32,
    ref_count: AtomicU32,
    flags: AtomicU8,
    /// Set once the page cache has initialized its metadata for this key.
    initialized: AtomicBool,
    /// Set once a pager has populated the content for this key.
    loaded: AtomicBool,
    dirty_slot: Mutex<Option<usize>>,
}

impl PageFrame {
    /// Wrap an existing buffer. `buf` may be longer than `page_size` when it
    /// comes from a pool slot.
    pub fn from_buffer(buf: Box<[u8]>, page_size: usize, from_pool: bool) -> Self {
        debug_assert!(buf.len() >= page_size);
        Self {
            data: RwLock::new(buf),
            page_size,
            from_pool,
            page_no: AtomicU32::new(0),
            ref_count: AtomicU32::new(0),
            flags: AtomicU8::new(0),
            initialized: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
            dirty_slot: Mutex::new(None),
        }
    }

    /// Allocate a zeroed frame from the heap.
    ///
    /// Returns `None` if the allocation fails.
    pub fn allocate(page_size: usize) -> Option<Self> {
        let buf = try_alloc_zeroed(page_size)?;
        Some(Self::from_buffer(buf, page_size, false))
    }

    // ========================================================================
    // Page access (RwLock)
    // ========================================================================

    /// Acquire a read lock on the page bytes.
    #[inline]
    pub fn data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        let n = self.page_size;
        RwLockReadGuard::map(self.data.read(), |buf| &buf[..n])
    }

    /// Acquire a write lock on the page bytes.
    #[inline]
    pub fn data_mut(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        let n = self.page_size;
        RwLockWriteGuard::map(self.data.write(), |buf| &mut buf[..n])
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub(crate) fn from_pool(&self) -> bool {
        self.from_pool
    }

    /// Give the underlying buffer back, e.g. to return it to a pool.
    pub(crate) fn into_buffer(self) -> Box<[u8]> {
        self.data.into_inner()
    }

    #[inline]
    pub fn page_no(&self) -> PageNo {
        PageNo(self.page_no.load(Ordering::Relaxed))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Forget everything the page cache knew about the previous key.
    pub(crate) fn reset_for_key(&self, key: PageNo) {
        self.page_no.store(key.0, Ordering::Relaxed);
        self.ref_count.store(0, Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        self.initialized.store(false, Ordering::Relaxed);
        self.loaded.store(false, Ordering::Relaxed);
        *self.dirty_slot.lock() = None;
    }

    #[inline]
    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    /// Set up page cache metadata: clean, unreferenced.
    pub(crate) fn initialize(&self) {
        self.flags.store(FLAG_CLEAN, Ordering::Relaxed);
        self.ref_count.store(0, Ordering::Relaxed);
        self.initialized.store(true, Ordering::Relaxed);
    }

    /// Whether a pager has already populated this frame's content.
    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_loaded(&self, loaded: bool) {
        self.loaded.store(loaded, Ordering::Relaxed);
    }

    // ========================================================================
    // Reference count (Atomic)
    // ========================================================================

    /// Increment the reference count. Returns the new count.
    #[inline]
    pub(crate) fn add_ref(&self) -> u32 {
        self.ref_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrement the reference count. Returns the new count.
    ///
    /// # Panics
    /// Panics if the count is already 0.
    #[inline]
    pub(crate) fn release_ref(&self) -> u32 {
        let old = self.ref_count.fetch_sub(1, Ordering::Relaxed);
        assert!(old > 0, "page reference count underflow");
        old - 1
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Dirty tracking
    // ========================================================================

    #[inline]
    pub fn is_dirty(&self) -> bool {
        let flags = self.flags.load(Ordering::Relaxed);
        flags & FLAG_DIRTY != 0 && flags & FLAG_CLEAN == 0
    }

    #[inline]
    pub(crate) fn set_dirty(&self) {
        self.flags.store(FLAG_DIRTY, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn set_clean(&self) {
        self.flags.store(FLAG_CLEAN, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn dirty_slot(&self) -> Option<usize> {
        *self.dirty_slot.lock()
    }

    #[inline]
    pub(crate) fn set_dirty_slot(&self, slot: Option<usize>) {
        *self.dirty_slot.lock() = slot;
    }
}

impl std::fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFrame")
            .field("page_no", &self.page_no())
            .field("ref_count", &self.ref_count())
            .field("dirty", &self.is_dirty())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// Allocate a zeroed buffer, reporting failure instead of aborting.
pub(crate) fn try_alloc_zeroed(len: usize) -> Option<Box<[u8]>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).ok()?;
    buf.resize(len, 0);
    Some(buf.into_boxed_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_new() {
        let frame = PageFrame::allocate(512).unwrap();
        assert_eq!(frame.page_size(), 512);
        assert_eq!(frame.ref_count(), 0);
        assert!(!frame.is_dirty());
        assert!(!frame.is_loaded());
        assert!(!frame.is_initialized());
        assert!(frame.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_frame_refs() {
        let frame = PageFrame::allocate(512).unwrap();
        assert_eq!(frame.add_ref(), 1);
        assert_eq!(frame.add_ref(), 2);
        assert_eq!(frame.release_ref(), 1);
        assert_eq!(frame.release_ref(), 0);
    }

    #[test]
    #[should_panic(expected = "page reference count underflow")]
    fn test_frame_release_underflow() {
        let frame = PageFrame::allocate(512).unwrap();
        frame.release_ref();
    }

    #[test]
    fn test_frame_dirty_flags() {
        let frame = PageFrame::allocate(512).unwrap();
        frame.initialize();
        assert!(!frame.is_dirty());

        frame.set_dirty();
        assert!(frame.is_dirty());

        frame.set_clean();
        assert!(!frame.is_dirty());
    }

    #[test]
    fn test_pool_slot_is_truncated_to_page_size() {
        let buf = vec![7u8; 1024].into_boxed_slice();
        let frame = PageFrame::from_buffer(buf, 512, true);
        assert_eq!(frame.data().len(), 512);
        assert_eq!(frame.data_mut().len(), 512);
        assert!(frame.from_pool());
        assert_eq!(frame.into_buffer().len(), 1024);
    }

    #[test]
    fn test_reset_for_key_clears_metadata() {
        let frame = PageFrame::allocate(512).unwrap();
        frame.initialize();
        frame.add_ref();
        frame.set_dirty();
        frame.set_loaded(true);
        frame.set_dirty_slot(Some(3));

        frame.reset_for_key(PageNo::new(9));

        assert_eq!(frame.page_no(), PageNo::new(9));
        assert_eq!(frame.ref_count(), 0);
        assert!(!frame.is_dirty());
        assert!(!frame.is_loaded());
        assert!(!frame.is_initialized());
        assert_eq!(frame.dirty_slot(), None);
    }

    #[test]
    fn test_frame_concurrent_reads() {
        use std::sync::Arc;
        use std::thread;

        let frame = Arc::new(PageFrame::allocate(512).unwrap());
        frame.data_mut()[0] = 0x42;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let frame = Arc::clone(&frame);
                thread::spawn(move || assert_eq!(frame.data()[0], 0x42))
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
