//! Tracks the active list and fans selection changes out.
//!
//! On an effective `select`:
//!
//! 1. the selection pointer moves and the chat selection resets to "new";
//! 2. summary polling for the previous list is suspended and a suspended
//!    job for the new list resumes;
//! 3. a cache warm-up for the new list is spawned, tagged with the
//!    selection epoch it was issued for;
//! 4. every [`ContextConsumer`] is told about the change, without waiting
//!    for the warm-up.
//!
//! A warm-up that finishes after the selection has moved on is discarded.
//! The active items view is always read from the cache slot of the list
//! that is active *now*, so a late result for an old list can never show
//! up in it.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info};

use crate::cache::{ItemCache, SummaryJobController};
use crate::error::EngineError;
use crate::events::{EngineEvent, EventHandler};
use crate::lock;
use crate::model::{ChatId, ListId};
use crate::presenter::ActiveItemsView;

/// Current list and chat selection. `chat == None` means "new chat".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActiveSelection {
    pub list: Option<ListId>,
    pub chat: Option<ChatId>,
}

/// Collaborator that rebuilds its working context when the active list
/// changes. Reads item content through the
/// [`ItemCache`](crate::cache::ItemCache) itself rather than receiving it.
pub trait ContextConsumer: Send + Sync {
    /// Called exactly once per effective selection change.
    fn on_active_list_changed(&self, list: ListId);

    fn on_selection_cleared(&self) {}

    /// The list was deleted; drop anything held for it.
    fn on_list_removed(&self, list: ListId) {
        let _ = list;
    }
}

/// Membership check against the external chat store.
pub trait ChatDirectory: Send + Sync {
    fn contains(&self, list: ListId, chat: ChatId) -> bool;
}

#[derive(Default)]
struct CoordinatorState {
    selection: ActiveSelection,
    /// Bumped on every selection change; warm-ups carry the value they
    /// were issued under.
    epoch: u64,
    /// List whose warm-up landed while it was still active.
    warmed: Option<ListId>,
}

pub struct ActiveListCoordinator {
    items: Arc<ItemCache>,
    summaries: Arc<SummaryJobController>,
    consumers: Vec<Arc<dyn ContextConsumer>>,
    chats: Option<Arc<dyn ChatDirectory>>,
    events: Arc<dyn EventHandler>,
    prefetch: bool,
    state: Arc<Mutex<CoordinatorState>>,
}

impl ActiveListCoordinator {
    pub fn new(
        items: Arc<ItemCache>,
        summaries: Arc<SummaryJobController>,
        events: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            items,
            summaries,
            consumers: Vec::new(),
            chats: None,
            events,
            prefetch: true,
            state: Arc::new(Mutex::new(CoordinatorState::default())),
        }
    }

    pub fn with_consumer(mut self, consumer: Arc<dyn ContextConsumer>) -> Self {
        self.consumers.push(consumer);
        self
    }

    pub fn with_chat_directory(mut self, chats: Arc<dyn ChatDirectory>) -> Self {
        self.chats = Some(chats);
        self
    }

    /// Whether `select` warms the item cache. Default: `true`.
    pub fn with_prefetch(mut self, prefetch: bool) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn selection(&self) -> ActiveSelection {
        lock(&self.state).selection
    }

    pub fn active_list(&self) -> Option<ListId> {
        lock(&self.state).selection.list
    }

    /// Make `id` the active list.
    ///
    /// Returns `Ok(false)` without side effects when `id` is already
    /// active. Fails with `NotFound` for a list the caches do not know.
    pub fn select(&self, id: ListId) -> Result<bool, EngineError> {
        if !self.items.contains(id) {
            return Err(EngineError::NotFound(id));
        }
        let (previous, epoch) = {
            let mut state = lock(&self.state);
            if state.selection.list == Some(id) {
                return Ok(false);
            }
            let previous = state.selection.list.replace(id);
            state.selection.chat = None;
            state.epoch += 1;
            state.warmed = None;
            (previous, state.epoch)
        };
        info!("Selected list {id}");

        if let Some(previous) = previous {
            self.summaries.suspend(previous);
        }
        self.summaries.resume(id);

        if self.prefetch {
            self.spawn_warmup(id, epoch);
        }
        for consumer in &self.consumers {
            consumer.on_active_list_changed(id);
        }
        self.events
            .on_event(&EngineEvent::ActiveListChanged { id, previous });
        Ok(true)
    }

    /// Select a chat of the active list, or `None` for a new chat.
    ///
    /// Membership is checked against the [`ChatDirectory`]; without one,
    /// only `None` is accepted.
    pub fn select_chat(&self, chat: Option<ChatId>) -> Result<(), EngineError> {
        let Some(list) = self.active_list() else {
            return Err(EngineError::invalid_state("no list is selected"));
        };
        if let Some(chat) = chat {
            let Some(directory) = &self.chats else {
                return Err(EngineError::invalid_state(format!(
                    "no chat directory to check chat {chat} against"
                )));
            };
            if !directory.contains(list, chat) {
                return Err(EngineError::invalid_state(format!(
                    "chat {chat} does not belong to list {list}"
                )));
            }
        }
        {
            let mut state = lock(&self.state);
            if state.selection.list != Some(list) {
                return Err(EngineError::invalid_state(
                    "selection changed while selecting a chat",
                ));
            }
            state.selection.chat = chat;
        }
        self.events
            .on_event(&EngineEvent::ChatSelected { list, chat });
        Ok(())
    }

    /// Reset both list and chat selection. Returns whether anything was
    /// selected.
    pub fn clear_selection(&self) -> bool {
        let Some(previous) = self.take_selection() else {
            return false;
        };
        self.summaries.suspend(previous);
        for consumer in &self.consumers {
            consumer.on_selection_cleared();
        }
        self.events.on_event(&EngineEvent::SelectionCleared {
            previous: Some(previous),
        });
        true
    }

    /// Cascade for a deleted list: clear it if active and tell consumers.
    pub fn forget_list(&self, id: ListId) {
        let was_active = {
            let state = lock(&self.state);
            state.selection.list == Some(id)
        };
        if was_active && self.take_selection().is_some() {
            for consumer in &self.consumers {
                consumer.on_selection_cleared();
            }
            self.events
                .on_event(&EngineEvent::SelectionCleared { previous: Some(id) });
        }
        for consumer in &self.consumers {
            consumer.on_list_removed(id);
        }
    }

    /// The chat `chat` of `list` is gone; fall back to "new chat" if it
    /// was selected.
    pub fn chat_removed(&self, list: ListId, chat: ChatId) -> bool {
        let reset = {
            let mut state = lock(&self.state);
            let selected = state.selection.list == Some(list) && state.selection.chat == Some(chat);
            if selected {
                state.selection.chat = None;
            }
            selected
        };
        if reset {
            self.events
                .on_event(&EngineEvent::ChatSelected { list, chat: None });
        }
        reset
    }

    /// Items of the active list as currently cached.
    pub fn active_items(&self) -> ActiveItemsView {
        match self.active_list() {
            Some(list) => ActiveItemsView::new(list, self.items.view(list)),
            None => ActiveItemsView::default(),
        }
    }

    /// Whether the warm-up for the active list has landed.
    pub fn is_warm(&self) -> bool {
        let state = lock(&self.state);
        state.selection.list.is_some() && state.warmed == state.selection.list
    }

    fn take_selection(&self) -> Option<ListId> {
        let mut state = lock(&self.state);
        let previous = state.selection.list.take();
        state.selection.chat = None;
        state.warmed = None;
        if previous.is_some() {
            state.epoch += 1;
        }
        previous
    }

    fn spawn_warmup(&self, id: ListId, epoch: u64) {
        let items = Arc::clone(&self.items);
        let state = Arc::clone(&self.state);
        let events = Arc::clone(&self.events);
        tokio::spawn(async move {
            let fetched = items.get(id).await;
            let current = {
                let mut state = lock(&state);
                let current = state.epoch == epoch;
                if current {
                    state.warmed = Some(id);
                }
                current
            };
            if current {
                events.on_event(&EngineEvent::ActiveItemsReady {
                    id,
                    count: fetched.len(),
                });
            } else {
                debug!("Discarding warm-up for list {id}: selection moved on");
                events.on_event(&EngineEvent::StaleWarmupDiscarded { id });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollConfig;
    use crate::events::NoopHandler;
    use crate::model::{Item, UserContext};
    use crate::source::DataSource;
    use crate::source::memory::MemoryDataSource;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl ContextConsumer for Recorder {
        fn on_active_list_changed(&self, list: ListId) {
            self.calls.lock().unwrap().push(format!("changed {list}"));
        }

        fn on_selection_cleared(&self) {
            self.calls.lock().unwrap().push("cleared".into());
        }

        fn on_list_removed(&self, list: ListId) {
            self.calls.lock().unwrap().push(format!("removed {list}"));
        }
    }

    struct OnlyChatSeven;

    impl ChatDirectory for OnlyChatSeven {
        fn contains(&self, _list: ListId, chat: ChatId) -> bool {
            chat == ChatId(7)
        }
    }

    fn setup(source: MemoryDataSource) -> (Arc<MemoryDataSource>, Arc<ItemCache>, ActiveListCoordinator, Arc<Recorder>) {
        let source = Arc::new(source);
        let dyn_source = Arc::clone(&source) as Arc<dyn DataSource>;
        let ctx = UserContext::new("dev@example.com");
        let events: Arc<dyn EventHandler> = Arc::new(NoopHandler);
        let items = ItemCache::new(Arc::clone(&dyn_source), ctx.clone(), Arc::clone(&events));
        let summaries =
            SummaryJobController::new(dyn_source, ctx, PollConfig::default(), Arc::clone(&events));
        for id in [ListId(1), ListId(2)] {
            items.register(id, vec![]);
            summaries.register(id);
        }
        let recorder = Arc::new(Recorder::default());
        let coordinator = ActiveListCoordinator::new(Arc::clone(&items), summaries, events)
            .with_consumer(Arc::clone(&recorder) as Arc<dyn ContextConsumer>)
            .with_chat_directory(Arc::new(OnlyChatSeven));
        (source, items, coordinator, recorder)
    }

    #[tokio::test]
    async fn reselect_is_a_no_op() {
        let (_, _, coordinator, recorder) = setup(MemoryDataSource::new());
        assert!(coordinator.select(ListId(1)).unwrap());
        assert!(!coordinator.select(ListId(1)).unwrap());
        assert_eq!(*recorder.calls.lock().unwrap(), vec!["changed 1"]);
    }

    #[tokio::test]
    async fn unknown_list_is_not_found() {
        let (_, _, coordinator, recorder) = setup(MemoryDataSource::new());
        assert_eq!(
            coordinator.select(ListId(9)),
            Err(EngineError::NotFound(ListId(9)))
        );
        assert_eq!(coordinator.selection(), ActiveSelection::default());
        assert!(recorder.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn chat_selection_rules() {
        let (_, _, coordinator, _) = setup(MemoryDataSource::new());
        assert!(matches!(
            coordinator.select_chat(Some(ChatId(7))),
            Err(EngineError::InvalidState(_))
        ));

        coordinator.select(ListId(1)).unwrap();
        assert!(matches!(
            coordinator.select_chat(Some(ChatId(8))),
            Err(EngineError::InvalidState(_))
        ));
        coordinator.select_chat(Some(ChatId(7))).unwrap();
        assert_eq!(coordinator.selection().chat, Some(ChatId(7)));

        // Switching lists resets the chat.
        coordinator.select(ListId(2)).unwrap();
        assert_eq!(
            coordinator.selection(),
            ActiveSelection {
                list: Some(ListId(2)),
                chat: None
            }
        );

        coordinator.select_chat(Some(ChatId(7))).unwrap();
        assert!(!coordinator.chat_removed(ListId(1), ChatId(7)));
        assert!(coordinator.chat_removed(ListId(2), ChatId(7)));
        assert_eq!(coordinator.selection().chat, None);
    }

    #[tokio::test]
    async fn chat_selection_needs_a_directory() {
        let (_, items, _, _) = setup(MemoryDataSource::new());
        let source = Arc::new(MemoryDataSource::new()) as Arc<dyn DataSource>;
        let events: Arc<dyn EventHandler> = Arc::new(NoopHandler);
        let summaries = SummaryJobController::new(
            source,
            UserContext::new("dev@example.com"),
            PollConfig::default(),
            Arc::clone(&events),
        );
        let coordinator = ActiveListCoordinator::new(items, summaries, events);

        coordinator.select(ListId(1)).unwrap();
        assert!(matches!(
            coordinator.select_chat(Some(ChatId(7))),
            Err(EngineError::InvalidState(_))
        ));
        assert_eq!(coordinator.selection().chat, None);
        coordinator.select_chat(None).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn late_warmup_for_previous_list_is_discarded() {
        let source = MemoryDataSource::new()
            .with_items(ListId(1), vec![Item::new(1, "from A")])
            .with_items(ListId(2), vec![Item::new(2, "from B")])
            .with_fetch_delay(ListId(1), Duration::from_secs(2));
        let (_, _, coordinator, _) = setup(source);

        coordinator.select(ListId(1)).unwrap();
        coordinator.select(ListId(2)).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        let view = coordinator.active_items();
        assert_eq!(view.list, Some(ListId(2)));
        assert_eq!(view.items[0].content, "from B");
        assert!(coordinator.is_warm());
    }

    #[tokio::test]
    async fn clear_and_forget_notify_consumers() {
        let (_, _, coordinator, recorder) = setup(MemoryDataSource::new());
        assert!(!coordinator.clear_selection());

        coordinator.select(ListId(1)).unwrap();
        assert!(coordinator.clear_selection());
        assert_eq!(coordinator.active_items(), ActiveItemsView::default());

        coordinator.select(ListId(2)).unwrap();
        coordinator.forget_list(ListId(2));
        coordinator.forget_list(ListId(1));
        assert_eq!(coordinator.selection(), ActiveSelection::default());
        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec!["changed 1", "cleared", "changed 2", "cleared", "removed 2", "removed 1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_disabled_leaves_cache_cold() {
        let source = MemoryDataSource::new().with_items(ListId(1), vec![Item::new(1, "a")]);
        let (source, items, coordinator, _) = setup(source);
        let coordinator = coordinator.with_prefetch(false);

        coordinator.select(ListId(1)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.fetch_count(ListId(1)), 0);
        assert!(coordinator.active_items().items.is_empty());

        items.get(ListId(1)).await;
        assert_eq!(coordinator.active_items().items.len(), 1);
    }
}
