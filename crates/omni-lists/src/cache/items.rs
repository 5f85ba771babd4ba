//! Per-list item cache with single-flight fetches.
//!
//! Each registered list owns one slot: its current source bindings, a
//! generation counter, and a state that is empty, fetching, or ready.
//! Concurrent readers of a fetching slot share one [`Shared`] future, so
//! the data source sees at most one outstanding fetch per list.
//!
//! Invalidation bumps the generation. A fetch that completes under an
//! older generation hands its result to the callers that were waiting on
//! it but is never stored, so a read issued after a mutation can only see
//! data fetched with the post-mutation bindings.
//!
//! Failed fetches store nothing. The error is kept for observability and
//! cleared by the next successful fetch or invalidation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::error::EngineError;
use crate::events::{EngineEvent, EventHandler};
use crate::lock;
use crate::model::{Item, ItemId, ItemPatch, ListId, SourceBinding, UserContext};
use crate::presenter::ItemsView;
use crate::source::DataSource;

type FetchResult = Result<Vec<Item>, EngineError>;
type FetchFuture = Shared<BoxFuture<'static, FetchResult>>;

/// Hit/miss counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Reads answered from a ready slot.
    pub hits: u64,
    /// Reads that found nothing cached.
    pub misses: u64,
    /// Reads that joined a fetch already in flight.
    pub joins: u64,
    /// Fetches issued to the data source.
    pub fetches: u64,
}

impl CacheStats {
    /// Fraction of reads served without waiting on the data source.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.joins;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

enum SlotState {
    Empty,
    Fetching(FetchFuture),
    Ready(Vec<Item>),
}

struct ItemSlot {
    bindings: Vec<SourceBinding>,
    generation: u64,
    state: SlotState,
    last_error: Option<EngineError>,
}

impl ItemSlot {
    fn new(bindings: Vec<SourceBinding>) -> Self {
        Self {
            bindings,
            generation: 0,
            state: SlotState::Empty,
            last_error: None,
        }
    }
}

#[derive(Default)]
struct CacheInner {
    slots: HashMap<ListId, ItemSlot>,
    stats: CacheStats,
}

/// How a read is going to be answered.
enum Lookup {
    Hit(Vec<Item>),
    Wait(FetchFuture, u64),
    Unknown,
}

/// Item cache keyed by list identifier.
pub struct ItemCache {
    this: Weak<ItemCache>,
    source: Arc<dyn DataSource>,
    ctx: UserContext,
    events: Arc<dyn EventHandler>,
    inner: Mutex<CacheInner>,
}

impl ItemCache {
    pub fn new(
        source: Arc<dyn DataSource>,
        ctx: UserContext,
        events: Arc<dyn EventHandler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            source,
            ctx,
            events,
            inner: Mutex::new(CacheInner::default()),
        })
    }

    /// Create an empty slot for `id`. An existing slot is reconfigured.
    pub fn register(&self, id: ListId, bindings: Vec<SourceBinding>) {
        let existed = {
            let mut inner = lock(&self.inner);
            if inner.slots.contains_key(&id) {
                true
            } else {
                inner.slots.insert(id, ItemSlot::new(bindings.clone()));
                false
            }
        };
        if existed {
            self.reconfigure(id, bindings);
        }
    }

    /// Replace the bindings of `id` and drop whatever was cached for it.
    pub fn reconfigure(&self, id: ListId, bindings: Vec<SourceBinding>) {
        {
            let mut inner = lock(&self.inner);
            let Some(slot) = inner.slots.get_mut(&id) else {
                return;
            };
            slot.bindings = bindings;
        }
        self.invalidate(id);
    }

    /// Drop the cached entry for `id` without fetching.
    pub fn invalidate(&self, id: ListId) {
        let invalidated = {
            let mut inner = lock(&self.inner);
            match inner.slots.get_mut(&id) {
                Some(slot) => {
                    slot.generation += 1;
                    slot.state = SlotState::Empty;
                    slot.last_error = None;
                    true
                }
                None => false,
            }
        };
        if invalidated {
            debug!("Invalidated items for list {id}");
            self.events.on_event(&EngineEvent::ItemsInvalidated { id });
        }
    }

    /// Remove the slot for `id` entirely. In-flight fetches for it are
    /// discarded when they complete.
    pub fn forget(&self, id: ListId) {
        if lock(&self.inner).slots.remove(&id).is_some() {
            debug!("Forgot item cache for list {id}");
        }
    }

    pub fn contains(&self, id: ListId) -> bool {
        lock(&self.inner).slots.contains_key(&id)
    }

    /// Items for `id`, fetching through the data source on a miss.
    ///
    /// Unknown lists yield an empty sequence. Concurrent callers for the
    /// same list share a single fetch.
    pub async fn fetch(&self, id: ListId) -> FetchResult {
        let (fut, generation) = match self.lookup(id) {
            Lookup::Hit(items) => return Ok(items),
            Lookup::Unknown => return Ok(Vec::new()),
            Lookup::Wait(fut, generation) => (fut, generation),
        };
        let result = fut.await;
        self.complete(id, generation, &result);
        result
    }

    /// Like [`fetch`](Self::fetch), but a failure yields an empty sequence.
    /// The error stays observable through [`view`](Self::view).
    pub async fn get(&self, id: ListId) -> Vec<Item> {
        self.fetch(id).await.unwrap_or_default()
    }

    /// Invalidate, then eagerly re-fetch.
    pub async fn refresh(&self, id: ListId) -> FetchResult {
        self.invalidate(id);
        self.fetch(id).await
    }

    /// Start a background fetch for `id` if nothing is cached or in flight.
    pub fn spawn_fetch(&self, id: ListId) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let pending = {
            let mut inner = lock(&self.inner);
            let Some(slot) = inner.slots.get_mut(&id) else {
                return;
            };
            if !matches!(slot.state, SlotState::Empty) {
                return;
            }
            let generation = slot.generation;
            let fut = self.start_fetch(id, slot);
            inner.stats.fetches += 1;
            (fut, generation)
        };
        tokio::spawn(async move {
            let (fut, generation) = pending;
            let result = fut.await;
            this.complete(id, generation, &result);
        });
    }

    /// Invalidate, then re-fetch in the background.
    pub fn spawn_refresh(&self, id: ListId) {
        self.invalidate(id);
        self.spawn_fetch(id);
    }

    /// Prepend `items` to a ready entry. No-op when nothing is cached.
    pub fn add_items(&self, id: ListId, items: Vec<Item>) -> bool {
        self.patch(id, |cached| {
            let mut merged = items;
            merged.append(cached);
            *cached = merged;
            true
        })
    }

    /// Merge `patch` into the cached item `item`.
    pub fn update_item(&self, id: ListId, item: ItemId, patch: &ItemPatch) -> bool {
        self.patch(id, |cached| match cached.iter_mut().find(|i| i.id == item) {
            Some(existing) => {
                patch.apply(existing);
                true
            }
            None => false,
        })
    }

    pub fn remove_item(&self, id: ListId, item: ItemId) -> bool {
        self.patch(id, |cached| {
            let before = cached.len();
            cached.retain(|i| i.id != item);
            cached.len() != before
        })
    }

    /// Cached items without triggering a fetch.
    pub fn peek(&self, id: ListId) -> Option<Vec<Item>> {
        match lock(&self.inner).slots.get(&id).map(|s| &s.state) {
            Some(SlotState::Ready(items)) => Some(items.clone()),
            _ => None,
        }
    }

    /// Presenter view of the slot for `id`.
    pub fn view(&self, id: ListId) -> ItemsView {
        let inner = lock(&self.inner);
        let Some(slot) = inner.slots.get(&id) else {
            return ItemsView::default();
        };
        let (items, loading) = match &slot.state {
            SlotState::Empty => (Vec::new(), false),
            SlotState::Fetching(_) => (Vec::new(), true),
            SlotState::Ready(items) => (items.clone(), false),
        };
        ItemsView {
            items,
            loading,
            error: slot.last_error.clone(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        lock(&self.inner).stats
    }

    fn lookup(&self, id: ListId) -> Lookup {
        let mut inner = lock(&self.inner);
        let CacheInner { slots, stats } = &mut *inner;
        let Some(slot) = slots.get_mut(&id) else {
            return Lookup::Unknown;
        };
        match &slot.state {
            SlotState::Ready(items) => {
                stats.hits += 1;
                trace!("Item cache hit for list {id}");
                Lookup::Hit(items.clone())
            }
            SlotState::Fetching(fut) => {
                stats.joins += 1;
                trace!("Joining in-flight fetch for list {id}");
                Lookup::Wait(fut.clone(), slot.generation)
            }
            SlotState::Empty => {
                stats.misses += 1;
                stats.fetches += 1;
                let generation = slot.generation;
                let fut = self.start_fetch(id, slot);
                Lookup::Wait(fut, generation)
            }
        }
    }

    /// Build the shared fetch future for `slot` and mark it fetching.
    fn start_fetch(&self, id: ListId, slot: &mut ItemSlot) -> FetchFuture {
        debug!(
            "Fetching items for list {id} ({} binding(s))",
            slot.bindings.len()
        );
        let source = Arc::clone(&self.source);
        let ctx = self.ctx.clone();
        let bindings = slot.bindings.clone();
        let fut = async move { source.fetch_items(&ctx, id, &bindings).await }
            .boxed()
            .shared();
        slot.state = SlotState::Fetching(fut.clone());
        fut
    }

    /// Store a finished fetch if its slot is still waiting on that
    /// generation. Only the first waiter to arrive stores and reports.
    fn complete(&self, id: ListId, generation: u64, result: &FetchResult) {
        let stored = {
            let mut inner = lock(&self.inner);
            match inner.slots.get_mut(&id) {
                Some(slot)
                    if slot.generation == generation
                        && matches!(slot.state, SlotState::Fetching(_)) =>
                {
                    match result {
                        Ok(items) => {
                            slot.state = SlotState::Ready(items.clone());
                            slot.last_error = None;
                        }
                        Err(e) => {
                            slot.state = SlotState::Empty;
                            slot.last_error = Some(e.clone());
                        }
                    }
                    true
                }
                Some(slot) if slot.generation != generation => {
                    debug!("Discarding items fetched for list {id} under stale bindings");
                    false
                }
                _ => false,
            }
        };
        if !stored {
            return;
        }
        match result {
            Ok(items) => self.events.on_event(&EngineEvent::ItemsFetched {
                id,
                count: items.len(),
            }),
            Err(error) => {
                warn!("Item fetch for list {id} failed: {error}");
                self.events
                    .on_event(&EngineEvent::ItemsFetchFailed { id, error });
            }
        }
    }

    fn patch(&self, id: ListId, f: impl FnOnce(&mut Vec<Item>) -> bool) -> bool {
        let changed = {
            let mut inner = lock(&self.inner);
            match inner.slots.get_mut(&id).map(|s| &mut s.state) {
                Some(SlotState::Ready(items)) => f(items),
                _ => false,
            }
        };
        if changed {
            self.events.on_event(&EngineEvent::ItemsPatched { id });
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopHandler;
    use crate::source::memory::MemoryDataSource;
    use std::time::Duration;

    fn cache(source: &Arc<MemoryDataSource>) -> Arc<ItemCache> {
        ItemCache::new(
            Arc::clone(source) as Arc<dyn DataSource>,
            UserContext::new("dev@example.com"),
            Arc::new(NoopHandler),
        )
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let list = ListId(1);
        let source = Arc::new(MemoryDataSource::new().with_items(list, vec![Item::new(1, "a")]));
        let cache = cache(&source);
        cache.register(list, vec![]);

        assert_eq!(cache.get(list).await.len(), 1);
        assert_eq!(cache.get(list).await.len(), 1);
        assert_eq!(source.fetch_count(list), 1);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn unknown_list_is_empty_without_fetching() {
        let source = Arc::new(MemoryDataSource::new());
        let cache = cache(&source);
        assert!(cache.get(ListId(9)).await.is_empty());
        assert_eq!(source.fetch_count(ListId(9)), 0);
        assert_eq!(cache.view(ListId(9)), ItemsView::default());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_reads_share_one_fetch() {
        let list = ListId(1);
        let source = Arc::new(
            MemoryDataSource::new()
                .with_items(list, vec![Item::new(1, "a"), Item::new(2, "b")])
                .with_fetch_delay(list, Duration::from_millis(200)),
        );
        let cache = cache(&source);
        cache.register(list, vec![]);

        let (a, b, c) = tokio::join!(cache.get(list), cache.get(list), cache.get(list));
        assert_eq!(a.len(), 2);
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(source.fetch_count(list), 1);
        assert_eq!(cache.stats().joins, 2);
    }

    #[tokio::test]
    async fn failure_is_not_cached() {
        let list = ListId(2);
        let source = Arc::new(MemoryDataSource::new().with_items(list, vec![Item::new(1, "a")]));
        source.fail_fetches(list, true);
        let cache = cache(&source);
        cache.register(list, vec![]);

        assert!(cache.get(list).await.is_empty());
        let view = cache.view(list);
        assert!(matches!(view.error, Some(EngineError::Unavailable(_))));
        assert!(view.items.is_empty());

        source.fail_fetches(list, false);
        assert_eq!(cache.get(list).await.len(), 1);
        assert_eq!(cache.view(list).error, None);
        assert_eq!(source.fetch_count(list), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_under_stale_bindings_is_not_stored() {
        let list = ListId(3);
        let source = Arc::new(
            MemoryDataSource::new()
                .with_items(list, vec![Item::new(1, "old")])
                .with_fetch_delay(list, Duration::from_millis(100)),
        );
        let cache = cache(&source);
        cache.register(list, vec![]);

        let pending = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get(list).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        source.set_items(list, vec![Item::new(2, "new")]);
        cache.invalidate(list);

        let stale = pending.await.unwrap();
        assert_eq!(stale[0].content, "old");
        assert!(cache.peek(list).is_none());
        assert_eq!(cache.get(list).await[0].content, "new");
    }

    #[tokio::test]
    async fn live_mutators_apply_only_to_ready_entries() {
        let list = ListId(4);
        let source = Arc::new(MemoryDataSource::new().with_items(list, vec![Item::new(1, "a")]));
        let cache = cache(&source);
        cache.register(list, vec![]);

        assert!(!cache.add_items(list, vec![Item::new(2, "b")]));
        cache.get(list).await;

        assert!(cache.add_items(list, vec![Item::new(2, "b")]));
        let ids: Vec<u64> = cache.peek(list).unwrap().iter().map(|i| i.id.0).collect();
        assert_eq!(ids, vec![2, 1]);

        let patch = ItemPatch {
            likes: Some(5),
            ..Default::default()
        };
        assert!(cache.update_item(list, ItemId(1), &patch));
        assert!(!cache.update_item(list, ItemId(42), &patch));
        assert!(cache.remove_item(list, ItemId(2)));
        assert!(!cache.remove_item(list, ItemId(2)));

        let items = cache.peek(list).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].likes, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_refresh_is_joined_by_readers() {
        let list = ListId(5);
        let source = Arc::new(
            MemoryDataSource::new()
                .with_items(list, vec![Item::new(1, "a")])
                .with_fetch_delay(list, Duration::from_millis(50)),
        );
        let cache = cache(&source);
        cache.register(list, vec![]);

        cache.spawn_refresh(list);
        assert!(cache.view(list).loading);
        assert_eq!(cache.get(list).await.len(), 1);
        assert_eq!(source.fetch_count(list), 1);
    }

    #[tokio::test]
    async fn forget_removes_slot() {
        let list = ListId(6);
        let source = Arc::new(MemoryDataSource::new().with_items(list, vec![Item::new(1, "a")]));
        let cache = cache(&source);
        cache.register(list, vec![]);
        cache.get(list).await;

        cache.forget(list);
        assert!(!cache.contains(list));
        assert!(cache.get(list).await.is_empty());
        assert_eq!(source.fetch_count(list), 1);
    }
}
