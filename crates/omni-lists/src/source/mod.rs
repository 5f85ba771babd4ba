//! The data source contract the engine calls into.
//!
//! A [`DataSource`] owns persistence, item selection and the remote
//! summarization job. The engine never interprets filters or builds
//! requests itself; it only decides *when* to call the source.
//!
//! Methods return boxed futures so the trait stays object-safe and can be
//! shared as `Arc<dyn DataSource>` across spawned tasks.
//!
//! Two implementations ship with the crate:
//! - [`MemoryDataSource`](memory::MemoryDataSource): scripted, in-process;
//!   used by tests and the `demo` command.
//! - [`HttpDataSource`](http::HttpDataSource): REST adapter for the Omni
//!   backend.

pub mod http;
pub mod memory;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::model::{Chat, Item, List, ListDraft, ListId, ListPatch, SourceBinding, UserContext};

/// Boxed future returned by every [`DataSource`] method.
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EngineError>> + Send + 'a>>;

/// Handle to a remote summarization job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub list_id: ListId,
    /// Source-assigned job identifier. Opaque to the engine.
    pub job_id: String,
}

/// Outcome of one poll of a summarization job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Done {
        result: String,
        /// Model that produced the summary, when the source reports it.
        model: Option<String>,
    },
    Failed {
        reason: String,
    },
}

/// Persistence, item and summarization backend.
///
/// Every call carries the [`UserContext`] it is made on behalf of.
/// Transport failures are reported as [`EngineError::Unavailable`]; an
/// identifier the backend does not know is [`EngineError::NotFound`].
pub trait DataSource: Send + Sync {
    /// All lists visible to the user.
    fn fetch_lists<'a>(&'a self, ctx: &'a UserContext) -> SourceFuture<'a, Vec<List>>;

    /// Items selected by `bindings` for `list`.
    fn fetch_items<'a>(
        &'a self,
        ctx: &'a UserContext,
        list: ListId,
        bindings: &'a [SourceBinding],
    ) -> SourceFuture<'a, Vec<Item>>;

    /// Start (or attach to) a summarization job for `list`. With
    /// `regenerate` set, any summary the source has cached for the list is
    /// discarded first.
    fn request_summary_job<'a>(
        &'a self,
        ctx: &'a UserContext,
        list: ListId,
        regenerate: bool,
    ) -> SourceFuture<'a, JobHandle>;

    fn poll_summary_job<'a>(
        &'a self,
        ctx: &'a UserContext,
        handle: &'a JobHandle,
    ) -> SourceFuture<'a, JobStatus>;

    /// Persist a new list. The returned list carries the assigned identifier.
    fn create_list<'a>(&'a self, ctx: &'a UserContext, draft: &'a ListDraft)
    -> SourceFuture<'a, List>;

    fn update_list<'a>(
        &'a self,
        ctx: &'a UserContext,
        id: ListId,
        patch: &'a ListPatch,
    ) -> SourceFuture<'a, List>;

    fn delete_list<'a>(&'a self, ctx: &'a UserContext, id: ListId) -> SourceFuture<'a, ()>;

    /// Conversations attached to `list`.
    fn fetch_chats<'a>(&'a self, ctx: &'a UserContext, list: ListId)
    -> SourceFuture<'a, Vec<Chat>>;
}
