//! Engine events and handlers.
//!
//! Every component reports its state transitions as [`EngineEvent`]
//! variants. A presenter implements [`EventHandler`] to learn when to
//! re-read a view; the stock handlers cover logging and composition.
//! Handlers are always invoked after the emitting component has released
//! its internal locks, so a handler may read engine state.
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or headless runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures |
//! | [`CompositeEventHandler`] | Fan out to several handlers in order |

use tracing::{debug, info, warn};

use crate::cache::summary::SummaryRecord;
use crate::error::EngineError;
use crate::model::{ChatId, List, ListId};

/// State transitions observable by a presenter.
#[derive(Debug)]
pub enum EngineEvent<'a> {
    /// The list collection was (re)loaded from the data source.
    ListsLoaded { count: usize },
    /// Loading the list collection failed; the previous collection is kept.
    ListsLoadFailed { error: &'a EngineError },
    ListCreated { list: &'a List },
    /// Name or source bindings changed.
    ListUpdated { list: &'a List },
    /// The list and every cache entry keyed by it are gone.
    ListDeleted { id: ListId },

    /// A cached item sequence was dropped.
    ItemsInvalidated { id: ListId },
    /// A fetch completed and its result was stored.
    ItemsFetched { id: ListId, count: usize },
    /// A fetch failed; nothing was cached.
    ItemsFetchFailed { id: ListId, error: &'a EngineError },
    /// A cached item sequence was edited in place (live update).
    ItemsPatched { id: ListId },

    /// A summary record changed state.
    SummaryChanged {
        id: ListId,
        record: &'a SummaryRecord,
    },
    /// A summary poll is being issued.
    SummaryPolled {
        id: ListId,
        attempt: u32,
        max_attempts: u32,
    },
    /// The poll loop for a list was stopped before the job finished.
    PollingCancelled { id: ListId },

    /// A different list became active. Fired once per effective `select`.
    ActiveListChanged {
        id: ListId,
        previous: Option<ListId>,
    },
    /// Selection was cleared (explicitly or because the list was deleted).
    SelectionCleared { previous: Option<ListId> },
    /// The chat selection changed. `None` means "new chat".
    ChatSelected { list: ListId, chat: Option<ChatId> },
    /// Items for the active list are in the active view.
    ActiveItemsReady { id: ListId, count: usize },
    /// A warm-up finished for a list that is no longer active.
    StaleWarmupDiscarded { id: ListId },
}

/// Handler for engine events.
///
/// The default implementation ignores everything.
///
/// ```ignore
/// struct Redraw(Sender<()>);
///
/// impl EventHandler for Redraw {
///     fn on_event(&self, event: &EngineEvent<'_>) {
///         if matches!(event, EngineEvent::SummaryChanged { .. }) {
///             let _ = self.0.send(());
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &EngineEvent<'_>) {
        let _ = event;
    }
}

/// Ignores all events.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
pub struct FnEventHandler<F>(F)
where
    F: Fn(&EngineEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&EngineEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&EngineEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &EngineEvent<'_>) {
        (self.0)(event)
    }
}

/// Delegates each event to every inner handler in registration order.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with(presenter_bridge);
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Add a handler only when `condition` holds.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &EngineEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// Logs every event through `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &EngineEvent<'_>) {
        match event {
            EngineEvent::ListsLoaded { count } => info!("Loaded {count} list(s)"),
            EngineEvent::ListsLoadFailed { error } => warn!("Loading lists failed: {error}"),
            EngineEvent::ListCreated { list } => {
                info!(
                    "Created list {} '{}' ({} source(s))",
                    list.id,
                    list.name,
                    list.sources.len()
                );
            }
            EngineEvent::ListUpdated { list } => {
                info!("Updated list {} '{}'", list.id, list.name);
            }
            EngineEvent::ListDeleted { id } => info!("Deleted list {id}"),
            EngineEvent::ItemsInvalidated { id } => debug!("Items for list {id} invalidated"),
            EngineEvent::ItemsFetched { id, count } => {
                debug!("Fetched {count} item(s) for list {id}");
            }
            EngineEvent::ItemsFetchFailed { id, error } => {
                warn!("Item fetch for list {id} failed: {error}");
            }
            EngineEvent::ItemsPatched { id } => debug!("Items for list {id} patched"),
            EngineEvent::SummaryChanged { id, record } => match record {
                SummaryRecord::Error { reason } => {
                    warn!("Summary for list {id} failed: {reason}");
                }
                other => info!("Summary for list {id} is {}", other.status()),
            },
            EngineEvent::SummaryPolled {
                id,
                attempt,
                max_attempts,
            } => debug!("Polling summary job for list {id} ({attempt}/{max_attempts})"),
            EngineEvent::PollingCancelled { id } => {
                debug!("Summary polling for list {id} cancelled");
            }
            EngineEvent::ActiveListChanged { id, previous } => match previous {
                Some(prev) => info!("Active list {prev} -> {id}"),
                None => info!("Active list -> {id}"),
            },
            EngineEvent::SelectionCleared { previous } => {
                if let Some(prev) = previous {
                    info!("Selection cleared (was list {prev})");
                }
            }
            EngineEvent::ChatSelected { list, chat } => match chat {
                Some(chat) => debug!("Chat {chat} selected in list {list}"),
                None => debug!("New chat in list {list}"),
            },
            EngineEvent::ActiveItemsReady { id, count } => {
                debug!("Active view shows {count} item(s) for list {id}");
            }
            EngineEvent::StaleWarmupDiscarded { id } => {
                debug!("Discarded warm-up result for inactive list {id}");
            }
        }
    }
}
