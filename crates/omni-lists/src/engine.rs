//! The engine facade: every presenter command and observer in one place.
//!
//! ```ignore
//! let engine = EngineBuilder::new(Arc::new(source), UserContext::new("me@example.com"))
//!     .config(EngineConfig::default().with_poll_interval(Duration::from_secs(2)))
//!     .event_handler(LoggingHandler)
//!     .build();
//!
//! engine.load_lists().await?;
//! engine.select_list(ListId(1))?;
//! engine.request_summary(ListId(1)).await?;
//! let record = engine.wait_summary(ListId(1)).await?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;

use crate::cache::{CacheStats, ItemCache, SummaryJobController, SummaryRecord};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{CompositeEventHandler, EventHandler, LoggingHandler};
use crate::model::{
    Chat, ChatId, DataSourceId, FilterPatch, Item, ItemId, ItemPatch, List, ListDraft, ListId,
    ListPatch, SourceBinding, UserContext,
};
use crate::presenter::{ActiveItemsView, EngineSnapshot, ItemsView, LoadStatus};
use crate::registry::ListRegistry;
use crate::selection::{
    ActiveListCoordinator, ActiveSelection, ChatCatalog, ChatDirectory, ContextConsumer,
};
use crate::source::DataSource;

/// Builder for [`Engine`].
pub struct EngineBuilder {
    source: Arc<dyn DataSource>,
    ctx: UserContext,
    config: EngineConfig,
    handlers: CompositeEventHandler,
    consumers: Vec<Arc<dyn ContextConsumer>>,
}

impl EngineBuilder {
    pub fn new(source: Arc<dyn DataSource>, ctx: UserContext) -> Self {
        Self {
            source,
            ctx,
            config: EngineConfig::default(),
            handlers: CompositeEventHandler::new(),
            consumers: Vec::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Add an event handler. Without any, events go to [`LoggingHandler`].
    pub fn event_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers = self.handlers.with(handler);
        self
    }

    /// Add a consumer notified on every active-list change, after the
    /// built-in chat catalog.
    pub fn context_consumer(mut self, consumer: Arc<dyn ContextConsumer>) -> Self {
        self.consumers.push(consumer);
        self
    }

    pub fn build(self) -> Engine {
        let handlers = if self.handlers.is_empty() {
            self.handlers.with(LoggingHandler)
        } else {
            self.handlers
        };
        let events: Arc<dyn EventHandler> = Arc::new(handlers);

        let items = ItemCache::new(
            Arc::clone(&self.source),
            self.ctx.clone(),
            Arc::clone(&events),
        );
        let summaries = SummaryJobController::new(
            Arc::clone(&self.source),
            self.ctx.clone(),
            self.config.poll,
            Arc::clone(&events),
        );
        let chats = ChatCatalog::new(
            Arc::clone(&self.source),
            self.ctx.clone(),
            Arc::clone(&items),
        );

        let mut coordinator = ActiveListCoordinator::new(
            Arc::clone(&items),
            Arc::clone(&summaries),
            Arc::clone(&events),
        )
        .with_prefetch(self.config.prefetch_on_select)
        .with_chat_directory(Arc::clone(&chats) as Arc<dyn ChatDirectory>)
        .with_consumer(Arc::clone(&chats) as Arc<dyn ContextConsumer>);
        for consumer in self.consumers {
            coordinator = coordinator.with_consumer(consumer);
        }
        let coordinator = Arc::new(coordinator);

        let registry = ListRegistry::new(
            self.source,
            self.ctx.clone(),
            Arc::clone(&items),
            Arc::clone(&summaries),
            Arc::clone(&coordinator),
            events,
        )
        .with_refresh_on_mutation(self.config.refresh_on_mutation);

        Engine {
            registry,
            items,
            summaries,
            coordinator,
            chats,
            config: self.config,
            ctx: self.ctx,
        }
    }
}

/// Smart-list engine: registry, caches and selection wired together.
pub struct Engine {
    registry: ListRegistry,
    items: Arc<ItemCache>,
    summaries: Arc<SummaryJobController>,
    coordinator: Arc<ActiveListCoordinator>,
    chats: Arc<ChatCatalog>,
    config: EngineConfig,
    ctx: UserContext,
}

impl Engine {
    pub fn builder(source: Arc<dyn DataSource>, ctx: UserContext) -> EngineBuilder {
        EngineBuilder::new(source, ctx)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn user(&self) -> &UserContext {
        &self.ctx
    }

    // ── Lists ──────────────────────────────────────────────────────

    pub async fn load_lists(&self) -> Result<usize, EngineError> {
        self.registry.load().await
    }

    pub fn lists(&self) -> Vec<List> {
        self.registry.lists()
    }

    pub fn list(&self, id: ListId) -> Option<List> {
        self.registry.get(id)
    }

    pub fn load_status(&self) -> LoadStatus {
        self.registry.load_status()
    }

    pub async fn create_list(&self, draft: &ListDraft) -> Result<ListId, EngineError> {
        self.registry.create(draft).await
    }

    pub async fn update_list(&self, id: ListId, patch: &ListPatch) -> Result<List, EngineError> {
        self.registry.update(id, patch).await
    }

    pub async fn delete_list(&self, id: ListId) -> Result<bool, EngineError> {
        self.registry.delete(id).await
    }

    pub fn add_source(&self, id: ListId, binding: SourceBinding) -> Result<(), EngineError> {
        self.registry.add_source(id, binding)
    }

    pub fn remove_source(&self, id: ListId, data_source: &DataSourceId) -> Result<bool, EngineError> {
        self.registry.remove_source(id, data_source)
    }

    pub fn update_source_filters(
        &self,
        id: ListId,
        data_source: &DataSourceId,
        patch: &FilterPatch,
    ) -> Result<bool, EngineError> {
        self.registry.update_source_filters(id, data_source, patch)
    }

    // ── Items ──────────────────────────────────────────────────────

    /// Items of `id`, from cache or fetched. Empty on failure or for an
    /// unknown list.
    pub async fn items(&self, id: ListId) -> Vec<Item> {
        self.items.get(id).await
    }

    pub async fn refresh_items(&self, id: ListId) -> Result<Vec<Item>, EngineError> {
        self.items.refresh(id).await
    }

    pub fn invalidate_items(&self, id: ListId) {
        self.items.invalidate(id);
    }

    pub fn item_view(&self, id: ListId) -> ItemsView {
        self.items.view(id)
    }

    pub fn active_items(&self) -> ActiveItemsView {
        self.coordinator.active_items()
    }

    pub fn add_items(&self, id: ListId, items: Vec<Item>) -> bool {
        self.items.add_items(id, items)
    }

    pub fn update_item(&self, id: ListId, item: ItemId, patch: &ItemPatch) -> bool {
        self.items.update_item(id, item, patch)
    }

    pub fn remove_item(&self, id: ListId, item: ItemId) -> bool {
        self.items.remove_item(id, item)
    }

    pub fn stats(&self) -> CacheStats {
        self.items.stats()
    }

    // ── Selection and chats ────────────────────────────────────────

    pub fn select_list(&self, id: ListId) -> Result<bool, EngineError> {
        self.coordinator.select(id)
    }

    pub fn select_chat(&self, chat: Option<ChatId>) -> Result<(), EngineError> {
        self.coordinator.select_chat(chat)
    }

    pub fn clear_selection(&self) -> bool {
        self.coordinator.clear_selection()
    }

    pub fn selection(&self) -> ActiveSelection {
        self.coordinator.selection()
    }

    pub fn chats(&self, list: ListId) -> Vec<Chat> {
        self.chats.chats(list)
    }

    /// Re-fetch the chats of `list`.
    pub async fn load_chats(&self, list: ListId) -> Result<usize, EngineError> {
        if !self.registry.contains(list) {
            return Err(EngineError::NotFound(list));
        }
        self.chats.load(list).await
    }

    pub fn add_chat(&self, list: ListId, chat: Chat) -> Result<(), EngineError> {
        if !self.registry.contains(list) {
            return Err(EngineError::NotFound(list));
        }
        self.chats.insert_chat(list, chat);
        Ok(())
    }

    /// Remove a chat; if it was selected the selection falls back to a
    /// new chat.
    pub fn delete_chat(&self, list: ListId, chat: ChatId) -> bool {
        let removed = self.chats.remove_chat(list, chat);
        self.coordinator.chat_removed(list, chat);
        removed
    }

    /// Context lines for a question about the active list.
    pub async fn chat_context(&self) -> Result<Vec<String>, EngineError> {
        let list = self
            .coordinator
            .active_list()
            .ok_or_else(|| EngineError::invalid_state("no list is selected"))?;
        Ok(self.chats.context(list).await)
    }

    // ── Summaries ──────────────────────────────────────────────────

    pub async fn request_summary(&self, id: ListId) -> Result<SummaryRecord, EngineError> {
        self.summaries.request(id).await
    }

    pub async fn refresh_summary(&self, id: ListId) -> Result<SummaryRecord, EngineError> {
        self.summaries.force_refresh(id).await
    }

    pub async fn wait_summary(&self, id: ListId) -> Result<SummaryRecord, EngineError> {
        self.summaries.wait(id).await
    }

    pub fn summary(&self, id: ListId) -> SummaryRecord {
        self.summaries.get(id)
    }

    pub fn subscribe_summary(&self, id: ListId) -> Option<watch::Receiver<SummaryRecord>> {
        self.summaries.subscribe(id)
    }

    pub fn is_polling(&self, id: ListId) -> bool {
        self.summaries.is_polling(id)
    }

    // ── Snapshot ───────────────────────────────────────────────────

    pub fn snapshot(&self) -> EngineSnapshot {
        let lists = self.registry.lists();
        let selection = self.coordinator.selection();
        let items = lists
            .iter()
            .map(|l| (l.id, self.items.view(l.id)))
            .collect::<BTreeMap<_, _>>();
        let summaries = lists
            .iter()
            .map(|l| (l.id, self.summaries.get(l.id)))
            .collect::<BTreeMap<_, _>>();
        let chats = selection
            .list
            .map(|list| self.chats.chats(list))
            .unwrap_or_default();

        EngineSnapshot {
            status: self.registry.load_status(),
            active: self.coordinator.active_items(),
            stats: self.items.stats(),
            lists,
            selection,
            chats,
            items,
            summaries,
        }
    }
}
