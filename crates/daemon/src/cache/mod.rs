//! Versioned on-disk memoization.

mod memoizing;
pub mod versioned_dir;

pub use memoizing::{CacheKey, CacheValue, MemoizingCache};
