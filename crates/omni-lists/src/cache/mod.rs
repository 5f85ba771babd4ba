//! Derived per-list state: computed items and summary jobs.
//!
//! Both caches are keyed by [`ListId`](crate::model::ListId) and hold only
//! what the registry has registered. Reads for an unregistered list answer
//! empty or absent rather than failing.

pub mod items;
pub mod summary;

pub use items::{CacheStats, ItemCache};
pub use summary::{SummaryJobController, SummaryRecord};
