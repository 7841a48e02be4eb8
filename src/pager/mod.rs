//! Pager - page access and transactions.
//!
//! The pager sits between the B-tree and storage. It resolves page numbers
//! to buffers through the page cache, loads missing pages from the WAL or
//! the database file, and turns a write transaction's dirty pages into WAL
//! frames on commit.
//!
//! # Components
//! - [`Engine`] - configuration, cache backend, shared WAL registry
//! - [`Pager`] - one connection to one database
//! - [`PageHandle`] - RAII reference to a page
//! - [`PagerStats`] - hit/miss and I/O counters

mod engine;
mod handle;
#[allow(clippy::module_inception)]
mod pager;
mod stats;

pub use engine::{wal_path, Engine};
pub use handle::PageHandle;
pub use pager::{Pager, TxnState};
pub use stats::{PagerStats, PagerStatsSnapshot};
