//! Storage layer - the database file and its header.
//!
//! - [`DbFile`] - page-granular file I/O
//! - [`FileHeader`] - the 100-byte header at the start of page 1

mod db_file;
mod file_header;

pub use db_file::DbFile;
pub use file_header::FileHeader;
