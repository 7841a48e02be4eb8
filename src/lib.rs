//! udb - an embedded single-file B-tree storage engine with a write-ahead log.
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                              udb                                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │                B-tree (btree/)                          │    │
//! │  │     Txn + catalog → Cursor → MemPage → cells/varints    │    │
//! │  └─────────────────────────────────────────────────────────┘    │
//! │                              ↓                                  │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │                  Pager (pager/)                         │    │
//! │  │   Engine + Pager + PageHandle + Statistics              │    │
//! │  │   get_page: cache → WAL frame → database file           │    │
//! │  └─────────────────────────────────────────────────────────┘    │
//! │            ↓                                  ↓                 │
//! │  ┌──────────────────────────┐   ┌─────────────────────────┐     │
//! │  │    Page Cache (cache/)   │   │       WAL (wal/)        │     │
//! │  │  group LRU arena, pool,  │   │ frames + checksums,     │     │
//! │  │  refcounts, dirty list   │   │ hash index, read marks, │     │
//! │  │                          │   │ checkpoint              │     │
//! │  └──────────────────────────┘   └─────────────────────────┘     │
//! │                              ↓                                  │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │              Storage Layer (storage/)                   │    │
//! │  │            DbFile + FileHeader (page 1)                 │    │
//! │  └─────────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//! - [`common`] - Shared primitives (PageNo, FrameNo, Error, Config)
//! - [`cache`] - Page cache backends and the pager-facing cache
//! - [`storage`] - Database file I/O and the file header
//! - [`wal`] - Write-ahead log, WAL index and checkpointing
//! - [`pager`] - Page access and transactions
//! - [`btree`] - Page layout, cursor and named trees
//!
//! # Quick Start
//! ```no_run
//! use udb::{Config, Engine, Txn};
//!
//! let engine = Engine::new(Config::default().with_cache_size(500))?;
//! let pager = engine.open_pager("my_database.db")?;
//!
//! let txn = Txn::begin_write(&pager)?;
//! let tree = txn.open_tree("accounts", true)?.expect("created in a write txn");
//! txn.write(&tree, b"alice", b"100")?;
//! txn.commit()?;
//!
//! pager.checkpoint()?;
//! # Ok::<(), udb::Error>(())
//! ```

// Core modules
pub mod btree;
pub mod cache;
pub mod common;
pub mod pager;
pub mod storage;
pub mod wal;

// Re-export commonly used items at crate root for convenience
pub use common::config::{CacheMode, Config, DEFAULT_PAGE_SIZE, TREE_MAX_DEPTH};
pub use common::{Error, FrameNo, PageNo, Result};

pub use btree::{BTree, Cursor, Location, MemPage, Txn};
pub use cache::{CacheBackend, DefaultCacheBackend, PageCache};
pub use pager::{Engine, PageHandle, Pager, PagerStats, PagerStatsSnapshot, TxnState};
pub use wal::{CheckpointResult, Wal, WalShared};
