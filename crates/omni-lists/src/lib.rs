//! Smart-list aggregation engine.
//!
//! `omni-lists` manages named, filterable lists of externally sourced items,
//! caches each list's computed items, and drives an asynchronous, polled
//! summarization job per list, while keeping chat context in step with
//! whichever list is active.
//!
//! ```ignore
//! use omni_lists::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EngineError> {
//!     let source = HttpDataSource::new(HttpSourceConfig::from_env())?;
//!     let engine = Engine::builder(Arc::new(source), UserContext::new("me@example.com")).build();
//!
//!     engine.load_lists().await?;
//!     let id = engine.create_list(&ListDraft::new("RAG")).await?;
//!     engine.select_list(id)?;
//!
//!     engine.request_summary(id).await?;
//!     if let Some(text) = engine.wait_summary(id).await?.text() {
//!         println!("{text}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Wire up the engine:** [`Engine`](engine::Engine) and
//!   [`EngineBuilder`](engine::EngineBuilder), configured with
//!   [`EngineConfig`](config::EngineConfig).
//! - **Plug in a backend:** implement [`DataSource`](source::DataSource), or
//!   use [`HttpDataSource`](source::http::HttpDataSource) /
//!   [`MemoryDataSource`](source::memory::MemoryDataSource).
//! - **Observe state changes:** implement
//!   [`EventHandler`](events::EventHandler), and read
//!   [`presenter`] views or an [`EngineSnapshot`](presenter::EngineSnapshot).
//! - **React to list switches:** implement
//!   [`ContextConsumer`](selection::ContextConsumer).
//! - **Understand the caches:** [`cache::items`] (single-flight item fetches)
//!   and [`cache::summary`] (the summary job state machine).

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod model;
pub mod prelude;
pub mod presenter;
pub mod registry;
pub mod selection;
pub mod source;

use std::sync::{Mutex, MutexGuard};

pub use engine::{Engine, EngineBuilder};
pub use error::EngineError;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
