//! Page cache.
//!
//! A bounded, reference-counted cache of fixed-size page buffers keyed by
//! page number. Several caches can share one eviction budget through a
//! cache group.
//!
//! # Components
//! - [`CacheBackend`] / [`CacheModule`] - the pluggable backend interface
//! - [`DefaultCacheBackend`] - the built-in group cache with an LRU arena
//! - [`PageFrame`] - one page buffer plus its bookkeeping
//! - [`PagePool`] - optional preallocated buffers, the memory pressure signal
//! - [`PageCache`] - the pager-facing layer: references and the dirty list

mod backend;
mod default_cache;
mod frame;
mod page_cache;
mod pool;

pub use backend::{CacheBackend, CacheItem, CacheModule, CreateFlag, ItemId};
pub use default_cache::{CacheGroup, DefaultCache, DefaultCacheBackend, GroupStats};
pub use frame::PageFrame;
pub use page_cache::{Page, PageCache, Stress};
pub use pool::PagePool;
