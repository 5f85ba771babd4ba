//! Convenience re-exports for common `omni-lists` types.
//!
//! ```ignore
//! use omni_lists::prelude::*;
//! ```
//!
//! Cache internals and the raw poll loop types stay in their modules.

pub use std::sync::Arc;

// ── Engine ──────────────────────────────────────────────────────────
pub use crate::config::{EngineConfig, PollConfig};
pub use crate::engine::{Engine, EngineBuilder};
pub use crate::error::EngineError;

// ── Model ───────────────────────────────────────────────────────────
pub use crate::model::{
    Chat, ChatId, DataSourceId, DateRange, FilterPatch, Item, ItemId, ItemPatch, List, ListDraft,
    ListId, ListPatch, SourceBinding, SourceFilters, UserContext,
};

// ── Data sources ────────────────────────────────────────────────────
pub use crate::source::http::{HttpDataSource, HttpSourceConfig};
pub use crate::source::memory::MemoryDataSource;
pub use crate::source::{DataSource, JobHandle, JobStatus};

// ── Observation ─────────────────────────────────────────────────────
pub use crate::cache::SummaryRecord;
pub use crate::events::{
    CompositeEventHandler, EngineEvent, EventHandler, FnEventHandler, LoggingHandler, NoopHandler,
};
pub use crate::presenter::{ActiveItemsView, EngineSnapshot, ItemsView};
pub use crate::selection::{ActiveSelection, ContextConsumer};
