//! The list collection and its cascades.
//!
//! The registry is the only owner of [`List`] values. Every mutation runs
//! its cache side effects before returning:
//!
//! | Operation | Items | Summary | Selection |
//! |-----------|-------|---------|-----------|
//! | `create` | register empty | register absent | none |
//! | `update` | reconfigure + invalidate | invalidate | none |
//! | source edits | reconfigure + invalidate, background re-fetch | invalidate | none |
//! | `delete` | forget | forget (stops polling) | cleared if active |
//!
//! `update` persists through the data source; source edits are local
//! structural changes, as the list editor applies them.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::cache::{ItemCache, SummaryJobController};
use crate::error::EngineError;
use crate::events::{EngineEvent, EventHandler};
use crate::lock;
use crate::model::{
    DataSourceId, FilterPatch, List, ListDraft, ListId, ListPatch, SourceBinding, UserContext,
};
use crate::presenter::LoadStatus;
use crate::selection::ActiveListCoordinator;
use crate::source::DataSource;

pub struct ListRegistry {
    source: Arc<dyn DataSource>,
    ctx: UserContext,
    items: Arc<ItemCache>,
    summaries: Arc<SummaryJobController>,
    coordinator: Arc<ActiveListCoordinator>,
    events: Arc<dyn EventHandler>,
    refresh_on_mutation: bool,
    lists: Mutex<Vec<List>>,
    status: Mutex<LoadStatus>,
}

impl ListRegistry {
    pub fn new(
        source: Arc<dyn DataSource>,
        ctx: UserContext,
        items: Arc<ItemCache>,
        summaries: Arc<SummaryJobController>,
        coordinator: Arc<ActiveListCoordinator>,
        events: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            source,
            ctx,
            items,
            summaries,
            coordinator,
            events,
            refresh_on_mutation: true,
            lists: Mutex::new(Vec::new()),
            status: Mutex::new(LoadStatus::default()),
        }
    }

    /// Whether source edits spawn a background re-fetch. Default: `true`.
    pub fn with_refresh_on_mutation(mut self, enabled: bool) -> Self {
        self.refresh_on_mutation = enabled;
        self
    }

    pub fn lists(&self) -> Vec<List> {
        lock(&self.lists).clone()
    }

    pub fn get(&self, id: ListId) -> Option<List> {
        lock(&self.lists).iter().find(|l| l.id == id).cloned()
    }

    pub fn contains(&self, id: ListId) -> bool {
        lock(&self.lists).iter().any(|l| l.id == id)
    }

    pub fn load_status(&self) -> LoadStatus {
        lock(&self.status).clone()
    }

    /// Replace the collection with the data source's and reconcile caches.
    ///
    /// New lists are registered, lists whose bindings changed are
    /// invalidated, and lists that disappeared are cascaded away. On
    /// failure the current collection is kept.
    pub async fn load(&self) -> Result<usize, EngineError> {
        *lock(&self.status) = LoadStatus {
            loading: true,
            error: None,
        };
        let fetched = match self.source.fetch_lists(&self.ctx).await {
            Ok(lists) => lists,
            Err(error) => {
                warn!("Loading lists failed: {error}");
                *lock(&self.status) = LoadStatus {
                    loading: false,
                    error: Some(error.clone()),
                };
                self.events
                    .on_event(&EngineEvent::ListsLoadFailed { error: &error });
                return Err(error);
            }
        };

        let (added, changed, removed) = {
            let mut lists = lock(&self.lists);
            let mut added = Vec::new();
            let mut changed = Vec::new();
            for list in &fetched {
                match lists.iter().find(|l| l.id == list.id) {
                    None => added.push((list.id, list.sources.clone())),
                    Some(old) if old.sources != list.sources => {
                        changed.push((list.id, list.sources.clone()));
                    }
                    Some(_) => {}
                }
            }
            let removed: Vec<ListId> = lists
                .iter()
                .filter(|old| fetched.iter().all(|l| l.id != old.id))
                .map(|old| old.id)
                .collect();
            *lists = fetched;
            (added, changed, removed)
        };

        for (id, bindings) in added {
            self.items.register(id, bindings);
            self.summaries.register(id);
        }
        for (id, bindings) in changed {
            self.items.reconfigure(id, bindings);
            self.summaries.invalidate(id);
        }
        for id in removed {
            self.cascade_delete(id);
        }

        let count = lock(&self.lists).len();
        *lock(&self.status) = LoadStatus::default();
        self.events.on_event(&EngineEvent::ListsLoaded { count });
        Ok(count)
    }

    /// Persist a new list and register empty cache entries for it.
    pub async fn create(&self, draft: &ListDraft) -> Result<ListId, EngineError> {
        draft.validate()?;
        let list = self.source.create_list(&self.ctx, draft).await?;
        let id = list.id;

        self.items.register(id, list.sources.clone());
        self.summaries.register(id);
        {
            let mut lists = lock(&self.lists);
            lists.retain(|l| l.id != id);
            lists.push(list.clone());
        }
        info!("Created list {id} '{}'", list.name);
        self.events.on_event(&EngineEvent::ListCreated { list: &list });
        Ok(id)
    }

    /// Merge `patch` into list `id` through the data source.
    ///
    /// An empty patch changes nothing and returns the list as is.
    pub async fn update(&self, id: ListId, patch: &ListPatch) -> Result<List, EngineError> {
        let current = self.get(id).ok_or(EngineError::NotFound(id))?;
        patch.validate()?;
        if patch.is_empty() {
            debug!("Empty patch for list {id}");
            return Ok(current);
        }

        let updated = self.source.update_list(&self.ctx, id, patch).await?;
        {
            let mut lists = lock(&self.lists);
            let slot = lists
                .iter_mut()
                .find(|l| l.id == id)
                .ok_or(EngineError::NotFound(id))?;
            *slot = updated.clone();
        }

        self.items.reconfigure(id, updated.sources.clone());
        self.summaries.invalidate(id);
        if self.refresh_on_mutation {
            self.items.spawn_fetch(id);
        }
        info!("Updated list {id}");
        self.events
            .on_event(&EngineEvent::ListUpdated { list: &updated });
        Ok(updated)
    }

    /// Delete list `id`. Unknown ids are a no-op; returns whether a list
    /// was removed.
    pub async fn delete(&self, id: ListId) -> Result<bool, EngineError> {
        if !self.contains(id) {
            return Ok(false);
        }
        match self.source.delete_list(&self.ctx, id).await {
            Ok(()) | Err(EngineError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let removed = {
            let mut lists = lock(&self.lists);
            let before = lists.len();
            lists.retain(|l| l.id != id);
            lists.len() != before
        };
        if removed {
            self.cascade_delete(id);
        }
        Ok(removed)
    }

    /// Attach `binding`, replacing any binding for the same data source.
    pub fn add_source(&self, id: ListId, binding: SourceBinding) -> Result<(), EngineError> {
        binding.filters.validate()?;
        self.edit_sources(id, |list| {
            list.upsert_binding(binding);
            true
        })
        .map(|_| ())
    }

    /// Detach the binding for `data_source`. Returns whether one existed.
    pub fn remove_source(&self, id: ListId, data_source: &DataSourceId) -> Result<bool, EngineError> {
        self.edit_sources(id, |list| list.remove_binding(data_source))
    }

    /// Shallow-merge `patch` into the filters of one binding. Returns
    /// whether the filters changed; an unknown binding is left alone.
    pub fn update_source_filters(
        &self,
        id: ListId,
        data_source: &DataSourceId,
        patch: &FilterPatch,
    ) -> Result<bool, EngineError> {
        let mut filters = self
            .get(id)
            .ok_or(EngineError::NotFound(id))?
            .binding(data_source)
            .map(|b| b.filters.clone())
            .unwrap_or_default();
        patch.apply(&mut filters);
        filters.validate()?;

        self.edit_sources(id, |list| {
            match list
                .sources
                .iter_mut()
                .find(|b| &b.data_source_id == data_source)
            {
                Some(binding) => patch.apply(&mut binding.filters),
                None => false,
            }
        })
    }

    /// Apply `edit` to list `id`; when it reports a change, run the
    /// invalidation cascade and schedule a re-fetch.
    fn edit_sources(
        &self,
        id: ListId,
        edit: impl FnOnce(&mut List) -> bool,
    ) -> Result<bool, EngineError> {
        let updated = {
            let mut lists = lock(&self.lists);
            let list = lists
                .iter_mut()
                .find(|l| l.id == id)
                .ok_or(EngineError::NotFound(id))?;
            if !edit(list) {
                return Ok(false);
            }
            list.clone()
        };

        self.items.reconfigure(id, updated.sources.clone());
        self.summaries.invalidate(id);
        if self.refresh_on_mutation {
            self.items.spawn_fetch(id);
        }
        debug!(
            "Sources of list {id} changed ({} binding(s))",
            updated.sources.len()
        );
        self.events
            .on_event(&EngineEvent::ListUpdated { list: &updated });
        Ok(true)
    }

    fn cascade_delete(&self, id: ListId) {
        self.items.forget(id);
        self.summaries.forget(id);
        self.coordinator.forget_list(id);
        info!("Deleted list {id}");
        self.events.on_event(&EngineEvent::ListDeleted { id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SummaryRecord;
    use crate::config::PollConfig;
    use crate::events::NoopHandler;
    use crate::model::{DateRange, Item, SourceFilters};
    use crate::source::memory::MemoryDataSource;
    use chrono::NaiveDate;

    struct Fixture {
        source: Arc<MemoryDataSource>,
        items: Arc<ItemCache>,
        summaries: Arc<SummaryJobController>,
        registry: ListRegistry,
    }

    fn fixture(source: MemoryDataSource) -> Fixture {
        let source = Arc::new(source);
        let dyn_source = Arc::clone(&source) as Arc<dyn DataSource>;
        let ctx = UserContext::new("dev@example.com");
        let events: Arc<dyn EventHandler> = Arc::new(NoopHandler);
        let items = ItemCache::new(Arc::clone(&dyn_source), ctx.clone(), Arc::clone(&events));
        let summaries = SummaryJobController::new(
            Arc::clone(&dyn_source),
            ctx.clone(),
            PollConfig::default(),
            Arc::clone(&events),
        );
        let coordinator = Arc::new(ActiveListCoordinator::new(
            Arc::clone(&items),
            Arc::clone(&summaries),
            Arc::clone(&events),
        ));
        let registry = ListRegistry::new(
            dyn_source,
            ctx,
            Arc::clone(&items),
            Arc::clone(&summaries),
            coordinator,
            events,
        )
        .with_refresh_on_mutation(false);
        Fixture {
            source,
            items,
            summaries,
            registry,
        }
    }

    fn twitter() -> SourceBinding {
        SourceBinding::new("twitter", SourceFilters::default())
    }

    #[tokio::test]
    async fn create_registers_caches() {
        let f = fixture(MemoryDataSource::new());
        let id = f.registry.create(&ListDraft::new("RAG")).await.unwrap();
        assert_eq!(id, ListId(1));
        assert!(f.items.contains(id));
        assert_eq!(f.summaries.get(id), SummaryRecord::Absent);
        assert_eq!(f.registry.lists().len(), 1);
    }

    #[tokio::test]
    async fn create_requires_a_name() {
        let f = fixture(MemoryDataSource::new());
        let err = f.registry.create(&ListDraft::new(" ")).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
        assert!(f.source.stored_lists().is_empty());
    }

    #[tokio::test]
    async fn update_unknown_is_not_found() {
        let f = fixture(MemoryDataSource::new());
        let err = f
            .registry
            .update(ListId(5), &ListPatch::rename("x"))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::NotFound(ListId(5)));
    }

    #[tokio::test]
    async fn update_persists_and_invalidates() {
        let f = fixture(MemoryDataSource::new().with_items(ListId(1), vec![Item::new(1, "a")]));
        let id = f.registry.create(&ListDraft::new("RAG")).await.unwrap();
        f.items.get(id).await;
        assert!(f.items.peek(id).is_some());

        let updated = f
            .registry
            .update(id, &ListPatch::default().with_sources(vec![twitter()]))
            .await
            .unwrap();
        assert_eq!(updated.sources.len(), 1);
        assert!(f.items.peek(id).is_none());
        assert_eq!(f.source.stored_lists()[0].sources.len(), 1);

        f.items.get(id).await;
        assert_eq!(f.source.last_bindings(id), Some(vec![twitter()]));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let f = fixture(MemoryDataSource::new());
        let id = f.registry.create(&ListDraft::new("RAG")).await.unwrap();
        assert!(f.registry.delete(id).await.unwrap());
        assert!(!f.registry.delete(id).await.unwrap());
        assert!(!f.items.contains(id));
        assert!(f.summaries.subscribe(id).is_none());
    }

    #[tokio::test]
    async fn source_edits_invalidate() {
        let f = fixture(MemoryDataSource::new().with_items(ListId(1), vec![Item::new(1, "a")]));
        let id = f.registry.create(&ListDraft::new("RAG")).await.unwrap();

        f.items.get(id).await;
        f.registry.add_source(id, twitter()).unwrap();
        assert!(f.items.peek(id).is_none());

        f.items.get(id).await;
        let patch = FilterPatch {
            rag_query: Some("retrieval".into()),
            ..Default::default()
        };
        assert!(f.registry.update_source_filters(id, &"twitter".into(), &patch).unwrap());
        assert!(f.items.peek(id).is_none());
        let list = f.registry.get(id).unwrap();
        assert_eq!(
            list.binding(&"twitter".into()).unwrap().filters.rag_query.as_deref(),
            Some("retrieval")
        );

        // Same values again: nothing changes, the cache stays.
        f.items.get(id).await;
        assert!(!f.registry.update_source_filters(id, &"twitter".into(), &patch).unwrap());
        assert!(f.items.peek(id).is_some());

        assert!(!f.registry.remove_source(id, &"discord".into()).unwrap());
        assert!(f.registry.remove_source(id, &"twitter".into()).unwrap());
        assert!(f.items.peek(id).is_none());
        assert!(f.registry.get(id).unwrap().sources.is_empty());
    }

    #[tokio::test]
    async fn inverted_date_range_rejected() {
        let f = fixture(MemoryDataSource::new());
        let id = f.registry.create(&ListDraft::new("RAG")).await.unwrap();
        f.registry.add_source(id, twitter()).unwrap();

        let day = |s| NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap();
        let patch = FilterPatch {
            date_range: Some(DateRange {
                from: day("2025-10-01"),
                to: day("2025-07-01"),
            }),
            ..Default::default()
        };
        let err = f
            .registry
            .update_source_filters(id, &"twitter".into(), &patch)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
        assert_eq!(f.registry.get(id).unwrap().binding(&"twitter".into()).unwrap().filters.date_range, None);
    }

    #[tokio::test]
    async fn load_reconciles_caches() {
        let seeded = |id: u64, sources| List {
            id: ListId(id),
            name: format!("list {id}"),
            sources,
            item_count: 0,
        };
        let f = fixture(
            MemoryDataSource::new()
                .with_list(seeded(1, vec![]))
                .with_list(seeded(2, vec![])),
        );
        assert_eq!(f.registry.load().await.unwrap(), 2);
        assert!(f.items.contains(ListId(1)));
        assert!(f.items.contains(ListId(2)));

        f.items.get(ListId(1)).await;
        f.source.delete_list(&UserContext::new("x"), ListId(2)).await.unwrap();
        f.source
            .update_list(
                &UserContext::new("x"),
                ListId(1),
                &ListPatch::default().with_sources(vec![twitter()]),
            )
            .await
            .unwrap();

        assert_eq!(f.registry.load().await.unwrap(), 1);
        assert!(!f.items.contains(ListId(2)));
        assert!(f.items.peek(ListId(1)).is_none());
        assert_eq!(f.registry.load_status(), LoadStatus::default());
    }
}
