//! Per-list summarization job state machine.
//!
//! ```text
//! absent ──request──▶ generating ──done──▶ completed
//!                       │   ▲                  │
//!            failed or  │   └─────running──┐   │ force_refresh
//!            exhausted  ▼                  │   │
//!                     error ──request──────┴───┘
//! ```
//!
//! Each slot publishes its [`SummaryRecord`] through a `watch` channel.
//! At most one record per list is `generating`, and at most one poll loop
//! runs per list: a `request` that finds a job in flight returns the
//! current record instead of creating another job.
//!
//! Every slot carries an epoch. Invalidation, forced refresh and deletion
//! bump it, and any job or poll result tagged with an older epoch is
//! dropped on arrival. Suspending a slot aborts its poll loop but keeps the
//! job handle and attempt count, so [`resume`](SummaryJobController::resume)
//! continues the same job under the same bound. A suspended slot stays
//! quiet until resumed: a job handle that arrives while it is suspended is
//! stored without polling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::PollConfig;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventHandler};
use crate::lock;
use crate::model::{ListId, UserContext};
use crate::source::{DataSource, JobHandle, JobStatus};

/// Cached state of a list's summarization job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SummaryRecord {
    Absent,
    Generating {
        /// Polls issued so far for the current job.
        attempts: u32,
    },
    Completed {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    Error {
        reason: EngineError,
    },
}

impl SummaryRecord {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Generating { .. } => "generating",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_generating(&self) -> bool {
        matches!(self, Self::Generating { .. })
    }

    /// Summary text, once completed.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Completed { text, .. } => Some(text),
            _ => None,
        }
    }
}

struct SummarySlot {
    tx: watch::Sender<SummaryRecord>,
    epoch: u64,
    job: Option<JobHandle>,
    attempts: u32,
    poller: Option<JoinHandle<()>>,
    /// Set while the list is not the active selection. No poll loop is
    /// started for a suspended slot.
    suspended: bool,
}

impl SummarySlot {
    fn new() -> Self {
        let (tx, _) = watch::channel(SummaryRecord::Absent);
        Self {
            tx,
            epoch: 0,
            job: None,
            attempts: 0,
            poller: None,
            suspended: false,
        }
    }

    fn record(&self) -> SummaryRecord {
        self.tx.borrow().clone()
    }

    fn polling(&self) -> bool {
        self.poller.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Abort the poll loop. Returns whether one was running.
    fn stop_polling(&mut self) -> bool {
        match self.poller.take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }

    /// Reset to `absent` under a new epoch. Returns whether the record changed.
    fn reset(&mut self) -> bool {
        self.epoch += 1;
        self.stop_polling();
        self.job = None;
        self.attempts = 0;
        if matches!(*self.tx.borrow(), SummaryRecord::Absent) {
            return false;
        }
        self.tx.send_replace(SummaryRecord::Absent);
        true
    }
}

/// Drives summary jobs for every registered list.
pub struct SummaryJobController {
    this: Weak<SummaryJobController>,
    source: Arc<dyn DataSource>,
    ctx: UserContext,
    poll: PollConfig,
    events: Arc<dyn EventHandler>,
    slots: Mutex<HashMap<ListId, SummarySlot>>,
}

impl SummaryJobController {
    pub fn new(
        source: Arc<dyn DataSource>,
        ctx: UserContext,
        poll: PollConfig,
        events: Arc<dyn EventHandler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            source,
            ctx,
            poll,
            events,
            slots: Mutex::new(HashMap::new()),
        })
    }

    pub fn poll_config(&self) -> PollConfig {
        self.poll
    }

    /// Create an `absent` slot for `id` if none exists.
    pub fn register(&self, id: ListId) {
        lock(&self.slots).entry(id).or_insert_with(SummarySlot::new);
    }

    /// Current record. Never starts a job; unknown lists are `absent`.
    pub fn get(&self, id: ListId) -> SummaryRecord {
        lock(&self.slots)
            .get(&id)
            .map_or(SummaryRecord::Absent, SummarySlot::record)
    }

    /// All records, for snapshots.
    pub fn records(&self) -> Vec<(ListId, SummaryRecord)> {
        lock(&self.slots)
            .iter()
            .map(|(id, slot)| (*id, slot.record()))
            .collect()
    }

    /// Receiver that observes every record change for `id`.
    pub fn subscribe(&self, id: ListId) -> Option<watch::Receiver<SummaryRecord>> {
        lock(&self.slots).get(&id).map(|slot| slot.tx.subscribe())
    }

    pub fn is_polling(&self, id: ListId) -> bool {
        lock(&self.slots).get(&id).is_some_and(SummarySlot::polling)
    }

    pub fn is_suspended(&self, id: ListId) -> bool {
        lock(&self.slots).get(&id).is_some_and(|slot| slot.suspended)
    }

    /// Ask for a summary.
    ///
    /// A completed record is returned as is. A job in flight is joined.
    /// Otherwise a new job is created and polling starts, unless the slot
    /// is suspended. Returns the record after the call.
    pub async fn request(&self, id: ListId) -> Result<SummaryRecord, EngineError> {
        self.start(id, false).await
    }

    /// Regenerate even when a completed record exists, asking the source to
    /// drop whatever it cached. A job already in flight is joined rather
    /// than duplicated.
    pub async fn force_refresh(&self, id: ListId) -> Result<SummaryRecord, EngineError> {
        self.start(id, true).await
    }

    /// Resolve once the record for `id` is no longer `generating`.
    ///
    /// A suspended slot is not resumed: its current record is returned
    /// immediately. A list forgotten while waiting resolves to `absent`.
    pub async fn wait(&self, id: ListId) -> Result<SummaryRecord, EngineError> {
        let mut rx = {
            let slots = lock(&self.slots);
            let slot = slots.get(&id).ok_or(EngineError::NotFound(id))?;
            if slot.suspended {
                trace!("Summary for list {id} is suspended; not waiting");
                return Ok(slot.record());
            }
            slot.tx.subscribe()
        };
        match rx.wait_for(|record| !record.is_generating()).await {
            Ok(record) => Ok((*record).clone()),
            Err(_) => Ok(SummaryRecord::Absent),
        }
    }

    /// Stop polling for `id` and keep it stopped until [`resume`]. The job
    /// handle and attempt count are kept. Returns whether a loop was running.
    ///
    /// [`resume`]: SummaryJobController::resume
    pub fn suspend(&self, id: ListId) -> bool {
        let stopped = lock(&self.slots).get_mut(&id).is_some_and(|slot| {
            slot.suspended = true;
            slot.stop_polling()
        });
        if stopped {
            debug!("Suspended summary polling for list {id}");
            self.events.on_event(&EngineEvent::PollingCancelled { id });
        }
        stopped
    }

    /// Lift a suspension and restart polling for a `generating` record.
    /// Returns whether a loop was started.
    pub fn resume(&self, id: ListId) -> bool {
        let mut slots = lock(&self.slots);
        let Some(slot) = slots.get_mut(&id) else {
            return false;
        };
        slot.suspended = false;
        if !slot.record().is_generating() || slot.job.is_none() || slot.polling() {
            return false;
        }
        debug!(
            "Resuming summary polling for list {id} at attempt {}",
            slot.attempts
        );
        self.spawn_poller(id, slot);
        true
    }

    /// Drop the record for `id` back to `absent`, discarding any job.
    pub fn invalidate(&self, id: ListId) {
        let changed = lock(&self.slots)
            .get_mut(&id)
            .is_some_and(SummarySlot::reset);
        if changed {
            debug!("Invalidated summary for list {id}");
            self.emit(id, &SummaryRecord::Absent);
        }
    }

    /// Remove the slot for `id`, stopping its poll loop. Subscribers see
    /// the channel close.
    pub fn forget(&self, id: ListId) {
        if let Some(mut slot) = lock(&self.slots).remove(&id)
            && slot.stop_polling()
        {
            debug!("Stopped summary polling for removed list {id}");
        }
    }

    async fn start(&self, id: ListId, force: bool) -> Result<SummaryRecord, EngineError> {
        let (epoch, record) = {
            let mut slots = lock(&self.slots);
            let slot = slots.get_mut(&id).ok_or(EngineError::NotFound(id))?;
            let current = slot.record();
            if current.is_generating() {
                trace!("Summary for list {id} already generating");
                if slot.job.is_some() && !slot.polling() && !slot.suspended {
                    self.spawn_poller(id, slot);
                }
                return Ok(current);
            }
            if !force && matches!(current, SummaryRecord::Completed { .. }) {
                trace!("Summary for list {id} served from cache");
                return Ok(current);
            }
            slot.epoch += 1;
            slot.stop_polling();
            slot.job = None;
            slot.attempts = 0;
            let record = SummaryRecord::Generating { attempts: 0 };
            slot.tx.send_replace(record.clone());
            (slot.epoch, record)
        };
        info!("Requesting summary job for list {id}");
        self.emit(id, &record);

        let requested = self.source.request_summary_job(&self.ctx, id, force).await;

        let outcome = {
            let mut slots = lock(&self.slots);
            match slots.get_mut(&id) {
                Some(slot) if slot.epoch == epoch => Some(match requested {
                    Ok(handle) => {
                        debug!("Summary job {} started for list {id}", handle.job_id);
                        slot.job = Some(handle);
                        if slot.suspended {
                            debug!("List {id} is suspended; polling waits for resume");
                        } else {
                            self.spawn_poller(id, slot);
                        }
                        record
                    }
                    Err(reason) => {
                        let failed = SummaryRecord::Error { reason };
                        slot.tx.send_replace(failed.clone());
                        failed
                    }
                }),
                _ => None,
            }
        };

        match outcome {
            Some(record) => {
                if let SummaryRecord::Error { reason } = &record {
                    warn!("Summary job for list {id} could not be created: {reason}");
                    self.emit(id, &record);
                }
                Ok(record)
            }
            None => {
                debug!("Summary request for list {id} superseded");
                Ok(self.get(id))
            }
        }
    }

    fn spawn_poller(&self, id: ListId, slot: &mut SummarySlot) {
        let Some(handle) = slot.job.clone() else {
            return;
        };
        slot.poller = Some(tokio::spawn(poll_loop(
            self.this.clone(),
            id,
            slot.epoch,
            handle,
        )));
    }

    /// Count a poll. `None` when the slot moved on.
    fn begin_poll(&self, id: ListId, epoch: u64) -> Option<u32> {
        let attempt = {
            let mut slots = lock(&self.slots);
            let slot = slots.get_mut(&id).filter(|s| s.epoch == epoch)?;
            slot.attempts += 1;
            slot.attempts
        };
        self.events.on_event(&EngineEvent::SummaryPolled {
            id,
            attempt,
            max_attempts: self.poll.max_attempts,
        });
        Some(attempt)
    }

    /// Apply a poll result. Returns whether polling continues.
    fn finish_poll(
        &self,
        id: ListId,
        epoch: u64,
        attempt: u32,
        status: Result<JobStatus, EngineError>,
    ) -> bool {
        let (record, keep_polling) = {
            let mut slots = lock(&self.slots);
            let Some(slot) = slots.get_mut(&id).filter(|s| s.epoch == epoch) else {
                return false;
            };
            let (record, keep_polling) = match status {
                Ok(JobStatus::Running) if attempt >= self.poll.max_attempts => (
                    SummaryRecord::Error {
                        reason: EngineError::Exhausted { attempts: attempt },
                    },
                    false,
                ),
                Ok(JobStatus::Running) => (SummaryRecord::Generating { attempts: attempt }, true),
                Ok(JobStatus::Done { result, model }) => (
                    SummaryRecord::Completed {
                        text: result,
                        model,
                    },
                    false,
                ),
                Ok(JobStatus::Failed { reason }) => (
                    SummaryRecord::Error {
                        reason: EngineError::Unavailable(reason),
                    },
                    false,
                ),
                Err(reason) => (SummaryRecord::Error { reason }, false),
            };
            slot.tx.send_replace(record.clone());
            if !keep_polling {
                slot.job = None;
                slot.poller = None;
            }
            (record, keep_polling)
        };

        if keep_polling {
            trace!("Summary job for list {id} still running ({attempt})");
            return true;
        }
        match &record {
            SummaryRecord::Completed { .. } => {
                info!("Summary for list {id} completed after {attempt} poll(s)");
            }
            SummaryRecord::Error { reason } => warn!("Summary for list {id} failed: {reason}"),
            _ => {}
        }
        self.emit(id, &record);
        false
    }

    fn emit(&self, id: ListId, record: &SummaryRecord) {
        self.events
            .on_event(&EngineEvent::SummaryChanged { id, record });
    }
}

impl Drop for SummaryJobController {
    fn drop(&mut self) {
        let slots = self.slots.get_mut().unwrap_or_else(|e| e.into_inner());
        for slot in slots.values_mut() {
            slot.stop_polling();
        }
    }
}

/// Sleep, poll, repeat until the job resolves, the bound is hit, the slot
/// moves to a new epoch, or the controller is dropped.
async fn poll_loop(
    controller: Weak<SummaryJobController>,
    id: ListId,
    epoch: u64,
    handle: JobHandle,
) {
    loop {
        let Some(interval) = controller.upgrade().map(|c| c.poll.interval) else {
            return;
        };
        tokio::time::sleep(interval).await;

        let Some(this) = controller.upgrade() else {
            return;
        };
        let Some(attempt) = this.begin_poll(id, epoch) else {
            return;
        };
        let status = this.source.poll_summary_job(&this.ctx, &handle).await;
        if !this.finish_poll(id, epoch, attempt, status) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopHandler;
    use crate::source::memory::MemoryDataSource;
    use std::time::Duration;

    fn controller(source: &Arc<MemoryDataSource>) -> Arc<SummaryJobController> {
        let controller = SummaryJobController::new(
            Arc::clone(source) as Arc<dyn DataSource>,
            UserContext::new("dev@example.com"),
            PollConfig::default(),
            Arc::new(NoopHandler),
        );
        controller.register(ListId(1));
        controller
    }

    fn done(text: &str) -> JobStatus {
        JobStatus::Done {
            result: text.into(),
            model: Some("claude".into()),
        }
    }

    #[test]
    fn record_serializes_with_status_tag() {
        let json = serde_json::to_value(SummaryRecord::Completed {
            text: "text".into(),
            model: None,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"status": "completed", "text": "text"}));
        assert_eq!(
            serde_json::to_value(SummaryRecord::Absent).unwrap(),
            serde_json::json!({"status": "absent"})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn request_polls_until_done_then_serves_cache() {
        let list = ListId(1);
        let source = Arc::new(
            MemoryDataSource::new().with_poll_script(list, vec![JobStatus::Running, done("text")]),
        );
        let controller = controller(&source);

        assert_eq!(controller.get(list), SummaryRecord::Absent);
        let record = controller.request(list).await.unwrap();
        assert!(record.is_generating());

        let record = controller.wait(list).await.unwrap();
        assert_eq!(record.text(), Some("text"));
        assert_eq!(source.poll_count(list), 2);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(controller.request(list).await.unwrap().text(), Some("text"));
        assert_eq!(source.poll_count(list), 2);
        assert_eq!(source.job_requests(list), 1);
        assert!(!controller.is_polling(list));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_create_one_job() {
        let list = ListId(1);
        let source = Arc::new(MemoryDataSource::new());
        let controller = controller(&source);

        let (a, b, c) = tokio::join!(
            controller.request(list),
            controller.request(list),
            controller.force_refresh(list)
        );
        assert!(a.unwrap().is_generating());
        assert!(b.unwrap().is_generating());
        assert!(c.unwrap().is_generating());
        assert_eq!(source.job_requests(list), 1);

        controller.wait(list).await.unwrap();
        assert_eq!(source.poll_count(list), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_attempts() {
        let list = ListId(1);
        let source = Arc::new(MemoryDataSource::new().with_poll_script(list, vec![JobStatus::Running]));
        let controller = controller(&source);

        controller.request(list).await.unwrap();
        let record = controller.wait(list).await.unwrap();
        assert_eq!(
            record,
            SummaryRecord::Error {
                reason: EngineError::Exhausted { attempts: 30 }
            }
        );
        assert_eq!(source.poll_count(list), 30);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(source.poll_count(list), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn force_refresh_regenerates_completed_summary() {
        let list = ListId(1);
        let source = Arc::new(MemoryDataSource::new().with_poll_script(list, vec![done("first")]));
        let controller = controller(&source);

        controller.request(list).await.unwrap();
        assert_eq!(controller.wait(list).await.unwrap().text(), Some("first"));

        source.set_poll_script(list, vec![done("second")]);
        assert!(controller.force_refresh(list).await.unwrap().is_generating());
        assert_eq!(controller.wait(list).await.unwrap().text(), Some("second"));
        assert_eq!(source.job_requests(list), 2);
        assert_eq!(source.regenerations(list), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_is_recorded_and_retryable() {
        let list = ListId(1);
        let source = Arc::new(MemoryDataSource::new());
        source.fail_jobs(list, true);
        let controller = controller(&source);

        let record = controller.request(list).await.unwrap();
        assert!(matches!(
            record,
            SummaryRecord::Error {
                reason: EngineError::Unavailable(_)
            }
        ));

        source.fail_jobs(list, false);
        controller.request(list).await.unwrap();
        assert!(controller.wait(list).await.unwrap().text().is_some());
        assert_eq!(source.job_requests(list), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_becomes_error() {
        let list = ListId(1);
        let source = Arc::new(MemoryDataSource::new().with_poll_script(
            list,
            vec![JobStatus::Failed {
                reason: "model overloaded".into(),
            }],
        ));
        let controller = controller(&source);

        controller.request(list).await.unwrap();
        assert_eq!(
            controller.wait(list).await.unwrap(),
            SummaryRecord::Error {
                reason: EngineError::unavailable("model overloaded")
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn suspend_and_resume_keep_the_same_job() {
        let list = ListId(1);
        let source = Arc::new(MemoryDataSource::new().with_poll_script(
            list,
            vec![JobStatus::Running, JobStatus::Running, done("text")],
        ));
        let controller = controller(&source);

        controller.request(list).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(source.poll_count(list), 1);

        assert!(controller.suspend(list));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.poll_count(list), 1);
        assert_eq!(controller.get(list), SummaryRecord::Generating { attempts: 1 });

        assert!(controller.resume(list));
        assert_eq!(controller.wait(list).await.unwrap().text(), Some("text"));
        assert_eq!(source.poll_count(list), 3);
        assert_eq!(source.job_requests(list), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn job_created_after_suspend_does_not_poll() {
        let list = ListId(1);
        let source = Arc::new(
            MemoryDataSource::new()
                .with_job_delay(list, Duration::from_secs(1))
                .with_poll_script(list, vec![JobStatus::Running, done("text")]),
        );
        let controller = controller(&source);

        let request = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.request(list).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!controller.suspend(list));
        assert!(controller.is_suspended(list));

        assert!(request.await.unwrap().unwrap().is_generating());
        assert!(!controller.is_polling(list));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.poll_count(list), 0);

        // Neither a second request nor a wait restarts a suspended slot.
        assert!(controller.request(list).await.unwrap().is_generating());
        assert!(controller.wait(list).await.unwrap().is_generating());
        assert!(!controller.is_polling(list));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.poll_count(list), 0);

        assert!(controller.resume(list));
        assert_eq!(controller.wait(list).await.unwrap().text(), Some("text"));
        assert_eq!(source.job_requests(list), 1);
        assert_eq!(source.poll_count(list), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_discards_job_in_flight() {
        let list = ListId(1);
        let source = Arc::new(MemoryDataSource::new().with_poll_script(list, vec![JobStatus::Running]));
        let controller = controller(&source);

        controller.request(list).await.unwrap();
        controller.invalidate(list);
        assert_eq!(controller.get(list), SummaryRecord::Absent);
        assert!(!controller.is_polling(list));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.poll_count(list), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn forget_closes_subscribers() {
        let list = ListId(1);
        let source = Arc::new(MemoryDataSource::new().with_poll_script(list, vec![JobStatus::Running]));
        let controller = controller(&source);
        controller.request(list).await.unwrap();

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.wait(list).await })
        };
        tokio::time::sleep(Duration::from_secs(7)).await;
        controller.forget(list);

        assert_eq!(waiter.await.unwrap().unwrap(), SummaryRecord::Absent);
        assert_eq!(controller.get(list), SummaryRecord::Absent);
        assert!(controller.request(list).await.is_err());
        assert_eq!(source.poll_count(list), 1);
    }
}
