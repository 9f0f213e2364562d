//! Tiered response cache for offline support.
//!
//! This module provides:
//! - Named tiers with independent age, entry and byte limits
//! - Deterministic request keys, with AI requests keyed on their semantic parameters
//! - SQLite-backed entry storage shared by every tier
//! - The strategy executor that decides between cache and network per request

mod entry;
mod key;
mod storage;
mod strategy;
mod tier;

pub use entry::{CacheSource, CachedEntry, ResponseMeta};
pub use key::CacheKey;
pub use storage::{EntryStamp, SqliteStorage, TierStorage, TierUsage};
pub use strategy::StrategyExecutor;
pub use tier::{CacheTier, TierName, TierPolicy, TierSet};
