//! In-process, scriptable [`DataSource`].
//!
//! Seeded with lists, items and chats; individual lists can be given a
//! fetch or job-creation delay, made to fail, or handed a scripted sequence of job poll
//! results. Every call is counted so tests can assert exactly how often the
//! engine reached the source.
//!
//! ```ignore
//! let source = MemoryDataSource::new()
//!     .with_items(ListId(1), vec![Item::new(1, "hello")])
//!     .with_poll_script(ListId(1), vec![JobStatus::Running, JobStatus::Done {
//!         result: "text".into(),
//!         model: None,
//!     }]);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tracing::trace;

use super::{DataSource, JobHandle, JobStatus, SourceFuture};
use crate::error::EngineError;
use crate::lock;
use crate::model::{Chat, Item, List, ListDraft, ListId, ListPatch, SourceBinding, UserContext};

/// Model name reported for summaries produced without a poll script.
pub const MEMORY_MODEL: &str = "memory";

#[derive(Default)]
struct MemoryState {
    lists: Vec<List>,
    next_list_id: u64,
    items: HashMap<ListId, Vec<Item>>,
    chats: HashMap<ListId, Vec<Chat>>,
    fetch_delays: HashMap<ListId, Duration>,
    job_delays: HashMap<ListId, Duration>,
    failing_fetches: HashSet<ListId>,
    failing_jobs: HashSet<ListId>,
    poll_scripts: HashMap<ListId, VecDeque<JobStatus>>,
    next_job: u64,
    fetches: HashMap<ListId, u32>,
    job_requests: HashMap<ListId, u32>,
    regenerations: HashMap<ListId, u32>,
    polls: HashMap<ListId, u32>,
    last_bindings: HashMap<ListId, Vec<SourceBinding>>,
}

/// Scripted in-memory data source.
pub struct MemoryDataSource {
    state: Mutex<MemoryState>,
}

impl Default for MemoryDataSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                next_list_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Seed a persisted list. Later `create_list` ids continue after it.
    pub fn with_list(self, list: List) -> Self {
        {
            let mut state = lock(&self.state);
            state.next_list_id = state.next_list_id.max(list.id.0 + 1);
            state.lists.retain(|l| l.id != list.id);
            state.lists.push(list);
        }
        self
    }

    pub fn with_items(self, list: ListId, items: Vec<Item>) -> Self {
        self.set_items(list, items);
        self
    }

    pub fn with_chats(self, list: ListId, chats: Vec<Chat>) -> Self {
        lock(&self.state).chats.insert(list, chats);
        self
    }

    /// Delay every item fetch for `list` by `delay`.
    pub fn with_fetch_delay(self, list: ListId, delay: Duration) -> Self {
        lock(&self.state).fetch_delays.insert(list, delay);
        self
    }

    /// Delay summary job creation for `list` by `delay`.
    pub fn with_job_delay(self, list: ListId, delay: Duration) -> Self {
        lock(&self.state).job_delays.insert(list, delay);
        self
    }

    /// Statuses returned by successive polls for `list`. The last status
    /// repeats once the script runs out.
    pub fn with_poll_script(self, list: ListId, script: Vec<JobStatus>) -> Self {
        self.set_poll_script(list, script);
        self
    }

    pub fn set_items(&self, list: ListId, items: Vec<Item>) {
        lock(&self.state).items.insert(list, items);
    }

    pub fn set_poll_script(&self, list: ListId, script: Vec<JobStatus>) {
        lock(&self.state).poll_scripts.insert(list, script.into());
    }

    /// Make item fetches for `list` fail with `Unavailable`.
    pub fn fail_fetches(&self, list: ListId, fail: bool) {
        let mut state = lock(&self.state);
        if fail {
            state.failing_fetches.insert(list);
        } else {
            state.failing_fetches.remove(&list);
        }
    }

    /// Make summary job creation for `list` fail with `Unavailable`.
    pub fn fail_jobs(&self, list: ListId, fail: bool) {
        let mut state = lock(&self.state);
        if fail {
            state.failing_jobs.insert(list);
        } else {
            state.failing_jobs.remove(&list);
        }
    }

    pub fn fetch_count(&self, list: ListId) -> u32 {
        lock(&self.state).fetches.get(&list).copied().unwrap_or(0)
    }

    pub fn job_requests(&self, list: ListId) -> u32 {
        lock(&self.state).job_requests.get(&list).copied().unwrap_or(0)
    }

    /// Job requests for `list` that asked for the cached summary to be dropped.
    pub fn regenerations(&self, list: ListId) -> u32 {
        lock(&self.state).regenerations.get(&list).copied().unwrap_or(0)
    }

    pub fn poll_count(&self, list: ListId) -> u32 {
        lock(&self.state).polls.get(&list).copied().unwrap_or(0)
    }

    /// Bindings passed with the most recent item fetch for `list`.
    pub fn last_bindings(&self, list: ListId) -> Option<Vec<SourceBinding>> {
        lock(&self.state).last_bindings.get(&list).cloned()
    }

    /// Lists as currently persisted.
    pub fn stored_lists(&self) -> Vec<List> {
        lock(&self.state).lists.clone()
    }
}

impl DataSource for MemoryDataSource {
    fn fetch_lists<'a>(&'a self, _ctx: &'a UserContext) -> SourceFuture<'a, Vec<List>> {
        Box::pin(async move { Ok(lock(&self.state).lists.clone()) })
    }

    fn fetch_items<'a>(
        &'a self,
        _ctx: &'a UserContext,
        list: ListId,
        bindings: &'a [SourceBinding],
    ) -> SourceFuture<'a, Vec<Item>> {
        Box::pin(async move {
            // The answer reflects the state at request time, like a server
            // that takes a while to respond.
            let (result, delay) = {
                let mut state = lock(&self.state);
                *state.fetches.entry(list).or_default() += 1;
                state.last_bindings.insert(list, bindings.to_vec());
                let result = if state.failing_fetches.contains(&list) {
                    Err(EngineError::unavailable(format!(
                        "item fetch for list {list} refused"
                    )))
                } else {
                    Ok(state.items.get(&list).cloned().unwrap_or_default())
                };
                (result, state.fetch_delays.get(&list).copied())
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Ok(items) = &result {
                trace!("memory source: {} item(s) for list {list}", items.len());
            }
            result
        })
    }

    fn request_summary_job<'a>(
        &'a self,
        _ctx: &'a UserContext,
        list: ListId,
        regenerate: bool,
    ) -> SourceFuture<'a, JobHandle> {
        Box::pin(async move {
            let delay = lock(&self.state).job_delays.get(&list).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut state = lock(&self.state);
            *state.job_requests.entry(list).or_default() += 1;
            if regenerate {
                *state.regenerations.entry(list).or_default() += 1;
            }
            if state.failing_jobs.contains(&list) {
                return Err(EngineError::unavailable(format!(
                    "summary job for list {list} refused"
                )));
            }
            state.next_job += 1;
            Ok(JobHandle {
                list_id: list,
                job_id: format!("job-{}", state.next_job),
            })
        })
    }

    fn poll_summary_job<'a>(
        &'a self,
        _ctx: &'a UserContext,
        handle: &'a JobHandle,
    ) -> SourceFuture<'a, JobStatus> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            let list = handle.list_id;
            *state.polls.entry(list).or_default() += 1;
            let status = match state.poll_scripts.get_mut(&list) {
                Some(script) if script.len() > 1 => script.pop_front(),
                Some(script) => script.front().cloned(),
                None => None,
            };
            Ok(status.unwrap_or_else(|| JobStatus::Done {
                result: format!("Summary of list {list}"),
                model: Some(MEMORY_MODEL.to_string()),
            }))
        })
    }

    fn create_list<'a>(
        &'a self,
        _ctx: &'a UserContext,
        draft: &'a ListDraft,
    ) -> SourceFuture<'a, List> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            let id = ListId(state.next_list_id);
            state.next_list_id += 1;
            let list = List {
                id,
                name: draft.name.clone(),
                sources: draft.sources.clone(),
                item_count: 0,
            };
            state.lists.push(list.clone());
            Ok(list)
        })
    }

    fn update_list<'a>(
        &'a self,
        _ctx: &'a UserContext,
        id: ListId,
        patch: &'a ListPatch,
    ) -> SourceFuture<'a, List> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            let list = state
                .lists
                .iter_mut()
                .find(|l| l.id == id)
                .ok_or(EngineError::NotFound(id))?;
            patch.apply(list);
            Ok(list.clone())
        })
    }

    fn delete_list<'a>(&'a self, _ctx: &'a UserContext, id: ListId) -> SourceFuture<'a, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.lists.retain(|l| l.id != id);
            state.items.remove(&id);
            state.chats.remove(&id);
            Ok(())
        })
    }

    fn fetch_chats<'a>(
        &'a self,
        _ctx: &'a UserContext,
        list: ListId,
    ) -> SourceFuture<'a, Vec<Chat>> {
        Box::pin(async move { Ok(lock(&self.state).chats.get(&list).cloned().unwrap_or_default()) })
    }
}
