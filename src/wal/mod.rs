//! Write-ahead log.
//!
//! Committed page images are appended to a log file beside the database
//! instead of overwriting pages in place. Readers see a consistent snapshot
//! bounded by the last commit frame that existed when their read
//! transaction began. A checkpoint later copies frames back into the
//! database file.
//!
//! ```text
//!            ┌───────────────────────────────────────────┐
//!            │              WalShared (per file)         │
//!            │  header  index  backfill  read marks  locks│
//!            └──────▲──────────────▲──────────────▲──────┘
//!                   │              │              │
//!              ┌────┴───┐     ┌────┴───┐     ┌────┴───┐
//!              │  Wal   │     │  Wal   │     │  Wal   │   one per pager
//!              └────────┘     └────────┘     └────────┘
//! ```
//!
//! # Components
//! - [`format`] - on-disk header and frame layout, checksums
//! - [`WalIndex`] - hash blocks mapping page numbers to frames
//! - [`WalLocks`] - non-blocking lock table
//! - [`WalShared`] - state shared by every connection to one log
//! - [`Wal`] - a connection: read snapshot, writer, checkpointer

pub mod format;
mod index;
mod locks;
mod shared;
#[allow(clippy::module_inception)]
mod wal;

pub use format::{FRAME_HEADER_SIZE, WAL_HEADER_SIZE};
pub use index::{WalIndex, WAL_NPAGE};
pub use locks::{LockSlot, WalLocks};
pub use shared::{WalIndexHeader, WalShared};
pub use wal::{CheckpointResult, Wal};

/// Number of read-mark slots.
pub const WAL_NREADER: usize = 8;

/// Value of a read mark that no reader has claimed.
pub const READMARK_NOT_USED: u32 = u32::MAX;
