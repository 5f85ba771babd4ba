//! Per-list chat collections.
//!
//! [`ChatCatalog`] is the engine's stand-in for the external chat store: it
//! answers chat membership for the coordinator and, as a
//! [`ContextConsumer`], reloads a list's conversations whenever that list
//! becomes active. The conversational context for a question is built from
//! the list's items as they sit in the [`ItemCache`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use super::coordinator::{ChatDirectory, ContextConsumer};
use crate::cache::ItemCache;
use crate::error::EngineError;
use crate::lock;
use crate::model::{Chat, ChatId, ListId, UserContext};
use crate::source::DataSource;

pub struct ChatCatalog {
    this: Weak<ChatCatalog>,
    source: Arc<dyn DataSource>,
    ctx: UserContext,
    items: Arc<ItemCache>,
    chats: Mutex<HashMap<ListId, Vec<Chat>>>,
}

impl ChatCatalog {
    pub fn new(source: Arc<dyn DataSource>, ctx: UserContext, items: Arc<ItemCache>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            source,
            ctx,
            items,
            chats: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch the chats of `list` and replace the cached collection.
    /// On failure the collection becomes empty.
    pub async fn load(&self, list: ListId) -> Result<usize, EngineError> {
        match self.source.fetch_chats(&self.ctx, list).await {
            Ok(chats) => {
                let count = chats.len();
                debug!("Loaded {count} chat(s) for list {list}");
                lock(&self.chats).insert(list, chats);
                Ok(count)
            }
            Err(e) => {
                lock(&self.chats).insert(list, Vec::new());
                Err(e)
            }
        }
    }

    pub fn chats(&self, list: ListId) -> Vec<Chat> {
        lock(&self.chats).get(&list).cloned().unwrap_or_default()
    }

    /// Add a conversation to `list`, replacing one with the same id.
    pub fn insert_chat(&self, list: ListId, chat: Chat) {
        let mut chats = lock(&self.chats);
        let entry = chats.entry(list).or_default();
        match entry.iter_mut().find(|c| c.id == chat.id) {
            Some(existing) => *existing = chat,
            None => entry.push(chat),
        }
    }

    pub fn remove_chat(&self, list: ListId, chat: ChatId) -> bool {
        let mut chats = lock(&self.chats);
        let Some(entry) = chats.get_mut(&list) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|c| c.id != chat);
        entry.len() != before
    }

    /// One line per item of `list`, for a question's context.
    pub async fn context(&self, list: ListId) -> Vec<String> {
        self.items
            .get(list)
            .await
            .iter()
            .map(|item| item.context_line())
            .collect()
    }
}

impl ChatDirectory for ChatCatalog {
    fn contains(&self, list: ListId, chat: ChatId) -> bool {
        lock(&self.chats)
            .get(&list)
            .is_some_and(|chats| chats.iter().any(|c| c.id == chat))
    }
}

impl ContextConsumer for ChatCatalog {
    fn on_active_list_changed(&self, list: ListId) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = this.load(list).await {
                warn!("Loading chats for list {list} failed: {e}");
            }
        });
    }

    fn on_list_removed(&self, list: ListId) {
        lock(&self.chats).remove(&list);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopHandler;
    use crate::model::Item;
    use crate::source::memory::MemoryDataSource;

    fn catalog(source: MemoryDataSource) -> Arc<ChatCatalog> {
        let source: Arc<dyn DataSource> = Arc::new(source);
        let ctx = UserContext::new("dev@example.com");
        let items = ItemCache::new(Arc::clone(&source), ctx.clone(), Arc::new(NoopHandler));
        items.register(ListId(1), vec![]);
        ChatCatalog::new(source, ctx, items)
    }

    #[tokio::test]
    async fn load_and_membership() {
        let catalog = catalog(
            MemoryDataSource::new().with_chats(ListId(1), vec![Chat::new(1), Chat::new(2)]),
        );
        assert!(!catalog.contains(ListId(1), ChatId(1)));
        assert_eq!(catalog.load(ListId(1)).await.unwrap(), 2);
        assert!(catalog.contains(ListId(1), ChatId(2)));
        assert!(!catalog.contains(ListId(2), ChatId(2)));

        catalog.insert_chat(ListId(1), Chat::new(3));
        catalog.insert_chat(ListId(1), Chat::new(3));
        assert_eq!(catalog.chats(ListId(1)).len(), 3);
        assert!(catalog.remove_chat(ListId(1), ChatId(1)));
        assert!(!catalog.remove_chat(ListId(1), ChatId(1)));

        catalog.on_list_removed(ListId(1));
        assert!(catalog.chats(ListId(1)).is_empty());
    }

    #[tokio::test]
    async fn activation_loads_in_background() {
        let catalog = catalog(MemoryDataSource::new().with_chats(ListId(1), vec![Chat::new(4)]));
        catalog.on_active_list_changed(ListId(1));
        for _ in 0..10 {
            if catalog.contains(ListId(1), ChatId(4)) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(catalog.contains(ListId(1), ChatId(4)));
    }

    #[tokio::test]
    async fn context_uses_cached_items() {
        let catalog = catalog(MemoryDataSource::new().with_items(
            ListId(1),
            vec![
                Item::new(1, "agents everywhere").with_author("Ann", "@ann"),
                Item::new(2, "no author"),
            ],
        ));
        assert_eq!(
            catalog.context(ListId(1)).await,
            vec!["@ann: agents everywhere", "no author"]
        );
    }
}
