//! Preallocated page buffer pool.
//!
//! The pool hands out fixed-size slots to caches whose items fit. Its fill
//! level is the engine's memory pressure signal: once fewer than `reserve`
//! slots remain, caches recycle rather than allocate.

use parking_lot::Mutex;

use super::frame::{try_alloc_zeroed, PageFrame};
use crate::common::config::PagePoolConfig;

/// A shared pool of page buffers.
#[derive(Debug)]
pub struct PagePool {
    slot_size: usize,
    slot_count: usize,
    reserve: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

impl PagePool {
    /// Build a pool, preallocating every slot. Slots that cannot be
    /// allocated are simply left out.
    pub fn new(config: Option<PagePoolConfig>) -> Self {
        let (slot_size, wanted) = config
            .map(|c| (c.slot_size, c.slot_count))
            .unwrap_or((0, 0));

        let mut free = Vec::with_capacity(wanted);
        for _ in 0..wanted {
            match try_alloc_zeroed(slot_size) {
                Some(buf) => free.push(buf),
                None => break,
            }
        }
        let slot_count = free.len();
        let reserve = if slot_count > 90 {
            10
        } else {
            slot_count / 10 + 1
        };

        Self {
            slot_size,
            slot_count,
            reserve: if slot_count == 0 { 0 } else { reserve },
            free: Mutex::new(free),
        }
    }

    /// A pool with no slots. Never reports pressure.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Get a frame for an item of `item_size` bytes holding a
    /// `page_size`-byte page. Falls back to the heap when the item does not
    /// fit a slot or the pool is empty.
    pub fn allocate(&self, item_size: usize, page_size: usize) -> Option<PageFrame> {
        if item_size <= self.slot_size {
            if let Some(buf) = self.free.lock().pop() {
                return Some(PageFrame::from_buffer(buf, page_size, true));
            }
        }
        PageFrame::allocate(page_size)
    }

    /// Return a frame's buffer to the pool if it came from there.
    pub fn release(&self, frame: PageFrame) {
        if frame.from_pool() {
            let mut buf = frame.into_buffer();
            buf.fill(0);
            self.free.lock().push(buf);
        }
    }

    /// True when the pool is configured and nearly exhausted.
    pub fn under_pressure(&self) -> bool {
        self.slot_count > 0 && self.free.lock().len() < self.reserve
    }

    pub fn free_slots(&self) -> usize {
        self.free.lock().len()
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }
}
