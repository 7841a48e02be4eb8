//! B-tree - page layout, cells and the cursor.
//!
//! ```text
//!                 ┌─────────────────────────┐
//!   page 1        │ file header │ catalog   │  name → root page
//!                 └─────────────────────────┘
//!                              │
//!                 ┌────────────┴────────────┐
//!                 ▼                         ▼
//!           ┌──────────┐              ┌──────────┐
//!           │ internal │  ...         │   leaf   │
//!           └──────────┘              └──────────┘
//!             │      │
//!             ▼      ▼
//!          leaves (key, value) ──► overflow pages
//! ```
//!
//! Keys compare bytewise. Internal cells hold a key and the left child
//! containing keys up to and including it; keys above every cell live under
//! the page's right child.
//!
//! # Components
//! - [`varint`] - variable-length integers
//! - [`PageHeader`] - the on-disk page header
//! - [`cell`] - cell encoding and payload limits
//! - [`MemPage`] - parsed page view: search, insert, drop, defragment
//! - [`Cursor`] - bounded descent and splitting
//! - [`Txn`], [`BTree`] - transactions and named trees

pub mod cell;
mod cursor;
mod mem_page;
mod page_header;
mod tree;
mod txn;
pub mod varint;

pub use cell::{CellInfo, PayloadLimits};
pub use cursor::{Cursor, Location};
pub use mem_page::{MemPage, SearchResult};
pub use page_header::{header_offset, PageHeader, PAGE1_HEADER_OFFSET, PAGE_INTERNAL, PAGE_LEAF};
pub use tree::BTree;
pub use txn::Txn;
