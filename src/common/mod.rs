//! Common types shared across the engine.
//!
//! - Configuration ([`Config`](config::Config)) and hard limits
//! - Error types
//! - Identifiers ([`PageNo`], [`FrameNo`])

pub mod config;
pub mod error;
mod frame_no;
mod page_no;

pub use error::{Error, Result};
pub use frame_no::FrameNo;
pub use page_no::PageNo;
