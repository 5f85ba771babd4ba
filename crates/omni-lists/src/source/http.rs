//! REST adapter for the Omni backend.
//!
//! | Contract call | Endpoint |
//! |---------------|----------|
//! | `fetch_lists` | `GET /smart-lists` |
//! | `create_list` | `POST /smart-lists`, then `GET /smart-lists` |
//! | `update_list` | none; fails with `InvalidState` |
//! | `delete_list` | `DELETE /smart-lists/{id}` |
//! | `fetch_items` | `GET /smart-lists/{id}/items` |
//! | `request_summary_job` | `DELETE /smart-lists/{id}/summary/cache` when regenerating, then `GET /smart-lists/{id}/summary` |
//! | `poll_summary_job` | `GET /smart-lists/{id}/summary` |
//! | `fetch_chats` | `GET /chats/{id}` |
//!
//! Every request carries the user as the `user_email` query parameter.
//!
//! The summary endpoint starts generation on first read and reports
//! `{summary, status, model}` with status `generating`, `completed` or
//! `error`, so the job handle is simply the list's summary resource.
//! The backend resolves item bindings from the list it has stored.
//!
//! `POST /smart-lists` answers `{message, list_id}` only, so the created
//! list is read back from the collection. `DELETE` answers 403 both for a
//! missing list and for one the user does not own; it is reported as
//! `NotFound`.

use std::time::{Duration, Instant};

use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};

use super::{DataSource, JobHandle, JobStatus, SourceFuture};
use crate::error::EngineError;
use crate::model::{Chat, Item, List, ListDraft, ListId, ListPatch, SourceBinding, UserContext};

/// Base URL of the Omni development server.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Environment variable overriding [`DEFAULT_BASE_URL`].
pub const BASE_URL_ENV: &str = "OMNI_API_BASE_URL";

/// Query parameter carrying the user on whose behalf a request is made.
pub const USER_QUERY: &str = "user_email";

/// Connection settings for [`HttpDataSource`].
#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            user_agent: concat!("omni-lists/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpSourceConfig {
    /// Defaults, with the base URL taken from `OMNI_API_BASE_URL` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var(BASE_URL_ENV)
            && !url.trim().is_empty()
        {
            config.base_url = url;
        }
        config
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Wire shape of `GET /smart-lists/{id}/summary`.
#[derive(Debug, Deserialize)]
struct SummaryResponse {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

/// Wire shape of `POST /smart-lists`.
#[derive(Debug, Deserialize)]
struct CreatedList {
    list_id: ListId,
}

/// [`DataSource`] backed by the Omni REST API.
pub struct HttpDataSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDataSource {
    pub fn new(config: HttpSourceConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent)
            .timeout(config.timeout)
            .build()
            .map_err(|e| EngineError::unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send<T, B>(
        &self,
        ctx: &UserContext,
        method: Method,
        path: &str,
        list: Option<ListId>,
        body: Option<&B>,
    ) -> Result<T, EngineError>
    where
        T: DeserializeOwned,
        B: serde::Serialize + ?Sized,
    {
        let url = request_url(&self.base_url, path, ctx)?;
        debug!("{method} {url}");
        let start = Instant::now();

        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| EngineError::unavailable(format!("request failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| EngineError::unavailable(format!("failed to read response: {e}")))?;
        debug!(
            "HTTP {} from {} in {:.2}s ({} bytes)",
            status,
            path,
            start.elapsed().as_secs_f64(),
            text.len()
        );
        trace!("response body: {text}");

        check_status(status, list, &text)?;
        // DELETE answers with an empty body.
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text)
            .map_err(|e| EngineError::unavailable(format!("failed to parse response: {e}")))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        ctx: &UserContext,
        path: &str,
        list: Option<ListId>,
    ) -> Result<T, EngineError> {
        self.send::<T, ()>(ctx, Method::GET, path, list, None).await
    }

    async fn summary(&self, ctx: &UserContext, list: ListId) -> Result<JobStatus, EngineError> {
        let resp: SummaryResponse = self
            .get(ctx, &format!("/smart-lists/{list}/summary"), Some(list))
            .await?;
        Ok(summary_status(resp))
    }
}

impl DataSource for HttpDataSource {
    fn fetch_lists<'a>(&'a self, ctx: &'a UserContext) -> SourceFuture<'a, Vec<List>> {
        Box::pin(self.get::<Vec<List>>(ctx, "/smart-lists", None))
    }

    fn fetch_items<'a>(
        &'a self,
        ctx: &'a UserContext,
        list: ListId,
        _bindings: &'a [SourceBinding],
    ) -> SourceFuture<'a, Vec<Item>> {
        Box::pin(async move {
            self.get::<Vec<Item>>(ctx, &format!("/smart-lists/{list}/items"), Some(list))
                .await
        })
    }

    fn request_summary_job<'a>(
        &'a self,
        ctx: &'a UserContext,
        list: ListId,
        regenerate: bool,
    ) -> SourceFuture<'a, JobHandle> {
        Box::pin(async move {
            if regenerate {
                let path = format!("/smart-lists/{list}/summary/cache");
                match self
                    .send::<serde_json::Value, ()>(ctx, Method::DELETE, &path, Some(list), None)
                    .await
                {
                    Ok(_) => debug!("Cleared cached summary for list {list}"),
                    // The summary read below reports a list that is really gone.
                    Err(EngineError::NotFound(_)) => {
                        debug!("No cached summary to clear for list {list}");
                    }
                    Err(e) => return Err(e),
                }
            }
            // The first read kicks off generation server-side.
            if let JobStatus::Failed { reason } = self.summary(ctx, list).await? {
                return Err(EngineError::unavailable(reason));
            }
            Ok(JobHandle {
                list_id: list,
                job_id: format!("smart-lists/{list}/summary"),
            })
        })
    }

    fn poll_summary_job<'a>(
        &'a self,
        ctx: &'a UserContext,
        handle: &'a JobHandle,
    ) -> SourceFuture<'a, JobStatus> {
        Box::pin(self.summary(ctx, handle.list_id))
    }

    fn create_list<'a>(
        &'a self,
        ctx: &'a UserContext,
        draft: &'a ListDraft,
    ) -> SourceFuture<'a, List> {
        Box::pin(async move {
            let created = self
                .send::<CreatedList, ListDraft>(ctx, Method::POST, "/smart-lists", None, Some(draft))
                .await?;
            let lists = match self.get::<Vec<List>>(ctx, "/smart-lists", None).await {
                Ok(lists) => lists,
                Err(e) => {
                    warn!("Could not read back list {}: {e}", created.list_id);
                    Vec::new()
                }
            };
            Ok(created_list(created, draft, lists))
        })
    }

    fn update_list<'a>(
        &'a self,
        _ctx: &'a UserContext,
        id: ListId,
        _patch: &'a ListPatch,
    ) -> SourceFuture<'a, List> {
        Box::pin(async move {
            Err(EngineError::invalid_state(format!(
                "the Omni backend has no route to update list {id}"
            )))
        })
    }

    fn delete_list<'a>(&'a self, ctx: &'a UserContext, id: ListId) -> SourceFuture<'a, ()> {
        Box::pin(async move {
            let _: serde_json::Value = self
                .send::<_, ()>(ctx, Method::DELETE, &format!("/smart-lists/{id}"), Some(id), None)
                .await?;
            Ok(())
        })
    }

    fn fetch_chats<'a>(
        &'a self,
        ctx: &'a UserContext,
        list: ListId,
    ) -> SourceFuture<'a, Vec<Chat>> {
        Box::pin(async move {
            self.get::<Vec<Chat>>(ctx, &format!("/chats/{list}"), Some(list))
                .await
        })
    }
}

/// Join `base` and `path` with exactly one slash between them.
fn endpoint(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Endpoint URL for `path`, scoped to the user in `ctx`.
fn request_url(base: &str, path: &str, ctx: &UserContext) -> Result<Url, EngineError> {
    let mut url = Url::parse(&endpoint(base, path))
        .map_err(|e| EngineError::unavailable(format!("invalid URL for {path}: {e}")))?;
    url.query_pairs_mut().append_pair(USER_QUERY, &ctx.email);
    Ok(url)
}

/// Map an HTTP status to the engine's error taxonomy.
fn check_status(status: StatusCode, list: Option<ListId>, body: &str) -> Result<(), EngineError> {
    if status.is_success() {
        return Ok(());
    }
    match (status, list) {
        (StatusCode::NOT_FOUND | StatusCode::FORBIDDEN, Some(list)) => {
            Err(EngineError::NotFound(list))
        }
        _ => Err(EngineError::unavailable(format!("HTTP {status}: {body}"))),
    }
}

/// The stored list named by `created`, or one built from the draft when the
/// read-back did not include it.
fn created_list(created: CreatedList, draft: &ListDraft, lists: Vec<List>) -> List {
    lists
        .into_iter()
        .find(|list| list.id == created.list_id)
        .unwrap_or_else(|| List {
            id: created.list_id,
            name: draft.name.clone(),
            sources: draft.sources.clone(),
            item_count: 0,
        })
}

fn summary_status(resp: SummaryResponse) -> JobStatus {
    match resp.status.as_deref() {
        Some("generating") => JobStatus::Running,
        Some("error") => JobStatus::Failed {
            reason: if resp.summary.is_empty() {
                "summary generation failed".to_string()
            } else {
                resp.summary
            },
        },
        // Older backends answer `{summary}` with no status once text exists.
        _ => JobStatus::Done {
            result: resp.summary,
            model: resp.model,
        },
    }
}
