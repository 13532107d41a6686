//! Generation-tagged response cache.
//!
//! - Entries are keyed by (generation, request identity)
//! - A generation is precached all-or-nothing and only served once live
//! - Activating a generation purges every other one

mod generation;
mod storage;
mod types;

pub use generation::GenerationManager;
pub use storage::{CacheStore, SqliteCacheStore};
pub use types::{CacheEntry, CacheKey, GenerationInfo, GenerationState};
