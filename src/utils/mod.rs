//!
//! Utility module for the snapshot sync tool.
//!
//! Re-exports formatting helpers used by the extractor previews and by logging.
/// Formatting helpers for prices and secrets
pub mod format;

pub use format::{format_price, mask_secret};
