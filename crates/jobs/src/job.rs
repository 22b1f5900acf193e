//! A single tracked job: its status timeline, the transitions that move
//! it forward, and the one-shot result handed to callers.
//!
//! Every transition is idempotent. The poll loop and the event stream
//! race to report the same facts, so re-applying an already-recorded
//! milestone is a no-op, and once a job reaches a terminal state only
//! the error log keeps growing.

use std::collections::BTreeSet;
use std::future::IntoFuture;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use catapult_comfyui::schema::{HistoryEntry, WorkflowTicket};
use catapult_core::types::{NodeId, Timestamp};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;

use crate::error::JobError;
use crate::status::{ErrorInfo, JobStatus, RemoteQueueStatus};

/// What a job resolves to.
pub type JobResult = Result<HistoryEntry, JobError>;

/// Everything needed to start tracking a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: String,
    pub workflow: Arc<serde_json::Value>,
    /// Output nodes that must produce data for the job to succeed.
    pub important: BTreeSet<NodeId>,
    /// Directory for diagnostic dumps of this job.
    pub debug_path: Option<PathBuf>,
}

/// Write side of a job's result. Resolves at most once.
#[derive(Debug)]
pub(crate) struct ResultSlot {
    tx: watch::Sender<Option<JobResult>>,
}

impl ResultSlot {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Store `result` unless the slot is already resolved. Returns
    /// whether this call resolved it.
    pub(crate) fn resolve(&self, result: JobResult) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        })
    }

    pub(crate) fn peek(&self) -> Option<JobResult> {
        self.tx.borrow().clone()
    }

    pub(crate) fn subscribe(&self, job_id: &str) -> JobFuture {
        JobFuture {
            job_id: job_id.into(),
            rx: self.tx.subscribe(),
        }
    }
}

/// Caller handle on a job's eventual result.
///
/// Cloneable; every clone observes the same single resolution. Await it
/// directly (it implements [`IntoFuture`]) or poll it with
/// [`try_result`](Self::try_result).
#[derive(Debug, Clone)]
pub struct JobFuture {
    job_id: Arc<str>,
    rx: watch::Receiver<Option<JobResult>>,
}

impl JobFuture {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn is_resolved(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The result, if the job has finished.
    pub fn try_result(&self) -> Option<JobResult> {
        self.rx.borrow().clone()
    }

    /// Wait for the job to finish.
    ///
    /// If the orchestrator drops the job without resolving it, this
    /// resolves to [`JobError::Cancelled`].
    pub async fn wait(mut self) -> JobResult {
        let resolved = match self.rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        resolved.unwrap_or(Err(JobError::Cancelled))
    }
}

impl IntoFuture for JobFuture {
    type Output = JobResult;
    type IntoFuture = BoxFuture<'static, JobResult>;

    fn into_future(self) -> Self::IntoFuture {
        self.wait().boxed()
    }
}

/// A tracked job.
///
/// Owned by the [`JobTable`](crate::table::JobTable) and only reachable
/// while its lock is held. The status can only move through the `mark_*`
/// transitions below.
#[derive(Debug)]
pub struct JobRecord {
    job_id: String,
    workflow: Arc<serde_json::Value>,
    important: BTreeSet<NodeId>,
    status: JobStatus,
    remote_queue_status: RemoteQueueStatus,
    result: ResultSlot,
    debug_path: Option<PathBuf>,
}

impl JobRecord {
    pub(crate) fn new(job: NewJob, now: Timestamp) -> Self {
        Self {
            job_id: job.job_id,
            workflow: job.workflow,
            important: job.important,
            status: JobStatus::new(now),
            remote_queue_status: RemoteQueueStatus::Unknown,
            result: ResultSlot::new(),
            debug_path: job.debug_path,
        }
    }

    /// Rebuild a record from a status saved by an earlier orchestrator.
    ///
    /// A terminal saved status resolves the result straight away: success
    /// with the stored history entry, cancellation with
    /// [`JobError::Cancelled`], and errors with [`JobError::JobFailed`]
    /// listing the recorded error messages.
    pub(crate) fn restore(job: NewJob, status: JobStatus) -> Self {
        let result = ResultSlot::new();
        if status.success.is_some() {
            result.resolve(Ok(status.job_history.clone().unwrap_or_default()));
        } else if status.cancelled.is_some() {
            result.resolve(Err(JobError::Cancelled));
        } else if status.errored.is_some() {
            let notes = status.errors.iter().map(|e| e.message.clone()).collect();
            result.resolve(Err(JobError::JobFailed { notes }));
        }

        Self {
            job_id: job.job_id,
            workflow: job.workflow,
            important: job.important,
            status,
            remote_queue_status: RemoteQueueStatus::Unknown,
            result,
            debug_path: job.debug_path,
        }
    }

    // ---- accessors ----

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn workflow(&self) -> &Arc<serde_json::Value> {
        &self.workflow
    }

    pub fn important(&self) -> &BTreeSet<NodeId> {
        &self.important
    }

    pub fn status(&self) -> &JobStatus {
        &self.status
    }

    pub fn remote_queue_status(&self) -> RemoteQueueStatus {
        self.remote_queue_status
    }

    pub fn prompt_id(&self) -> Option<&str> {
        self.status.prompt_id()
    }

    pub fn is_done(&self) -> bool {
        self.status.is_done()
    }

    pub fn debug_path(&self) -> Option<&Path> {
        self.debug_path.as_deref()
    }

    pub fn future(&self) -> JobFuture {
        self.result.subscribe(&self.job_id)
    }

    // ---- transitions ----

    /// Attach the submission acknowledgement. The first ticket wins.
    pub fn record_ticket(&mut self, ticket: WorkflowTicket) {
        if self.status.ticket.is_none() {
            self.status.ticket = Some(ticket);
        }
    }

    pub fn mark_engine_scheduled(&mut self, now: Timestamp) -> bool {
        if self.is_done() || self.status.engine_scheduled.is_some() {
            return false;
        }
        self.status.engine_scheduled = Some(now);
        true
    }

    pub fn mark_pending(&mut self, now: Timestamp) -> bool {
        if self.is_done() || self.status.pending.is_some() {
            return false;
        }
        self.status.pending = Some(now);
        tracing::debug!(job_id = %self.job_id, "Job pending in ComfyUI queue");
        true
    }

    /// Returns `true` only the first time the job is seen running.
    pub fn mark_running(&mut self, now: Timestamp) -> bool {
        if self.is_done() || self.status.running.is_some() {
            return false;
        }
        self.status.running = Some(now);
        tracing::info!(job_id = %self.job_id, "Job started running");
        true
    }

    /// Conclude successfully. No-op (returns `false`) on a terminal job.
    pub fn mark_success(&mut self, entry: HistoryEntry, now: Timestamp) -> bool {
        if self.is_done() {
            return false;
        }
        self.status.success = Some(now);
        self.status.job_history = Some(entry.clone());
        self.result.resolve(Ok(entry));
        tracing::info!(job_id = %self.job_id, "Job succeeded");
        true
    }

    /// Conclude with `error`. On a terminal job the error is only logged
    /// to the status; returns whether this call concluded the job.
    pub fn mark_errored(&mut self, error: JobError, now: Timestamp) -> bool {
        self.status.errors.push(error.to_info(now));
        if self.is_done() {
            return false;
        }
        self.status.errored = Some(now);
        tracing::warn!(job_id = %self.job_id, error = %error, "Job errored");
        self.result.resolve(Err(error));
        true
    }

    pub fn mark_cancelled(&mut self, now: Timestamp) -> bool {
        if self.is_done() {
            return false;
        }
        self.status.cancelled = Some(now);
        self.result.resolve(Err(JobError::Cancelled));
        tracing::info!(job_id = %self.job_id, "Job cancelled");
        true
    }

    /// Append a diagnostic without concluding the job.
    pub fn record_error(&mut self, info: ErrorInfo) {
        self.status.errors.push(info);
    }

    /// Keep the engine's history entry. Ignored once the job is done.
    pub fn record_history(&mut self, entry: HistoryEntry) -> bool {
        if self.is_done() {
            return false;
        }
        self.status.job_history = Some(entry);
        true
    }

    pub fn stamp_system_stats_check(&mut self, now: Timestamp) {
        if !self.is_done() {
            self.status.system_stats_check = Some(now);
        }
    }

    pub fn stamp_queue_check(&mut self, now: Timestamp) {
        if !self.is_done() {
            self.status.queue_check = Some(now);
        }
    }

    /// Store the latest queue observation, returning the previous one.
    pub fn set_remote_queue_status(&mut self, observed: RemoteQueueStatus) -> RemoteQueueStatus {
        std::mem::replace(&mut self.remote_queue_status, observed)
    }

    /// Resolve the result with [`JobError::Cancelled`] without touching
    /// the status. [`sync_with_result`](Self::sync_with_result) brings the
    /// status in line afterwards.
    pub(crate) fn abandon(&mut self) -> bool {
        self.result.resolve(Err(JobError::Cancelled))
    }

    /// If the result was resolved outside the transitions above, set the
    /// matching outcome timestamp. Returns whether the status changed.
    pub fn sync_with_result(&mut self, now: Timestamp) -> bool {
        if self.is_done() {
            return false;
        }
        let Some(result) = self.result.peek() else {
            return false;
        };

        match result {
            Ok(entry) => {
                self.status.success = Some(now);
                self.status.job_history.get_or_insert(entry);
            }
            Err(JobError::Cancelled) => self.status.cancelled = Some(now),
            Err(error) => {
                self.status.errors.push(error.to_info(now));
                self.status.errored = Some(now);
            }
        }
        tracing::debug!(job_id = %self.job_id, phase = ?self.status.phase(), "Synced status with result");
        true
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::Utc;

    use super::*;
    use crate::status::JobPhase;

    fn record() -> JobRecord {
        JobRecord::new(
            NewJob {
                job_id: "render-1".to_string(),
                workflow: Arc::new(serde_json::json!({})),
                important: BTreeSet::new(),
                debug_path: None,
            },
            Utc::now(),
        )
    }

    #[test]
    fn milestones_are_first_observed() {
        let mut job = record();
        let first = Utc::now();
        assert!(job.mark_pending(first));
        assert!(!job.mark_pending(Utc::now()));
        assert_eq!(job.status().pending, Some(first));

        assert!(job.mark_running(first));
        assert!(!job.mark_running(Utc::now()));
        assert_eq!(job.status().running, Some(first));
    }

    #[test]
    fn success_is_terminal_and_idempotent() {
        let mut job = record();
        let future = job.future();
        let now = Utc::now();

        assert!(job.mark_success(HistoryEntry::default(), now));
        assert!(!job.mark_success(HistoryEntry::default(), Utc::now()));
        assert!(!job.mark_cancelled(Utc::now()));
        assert!(!job.mark_errored(JobError::Cancelled, Utc::now()));

        let status = job.status();
        assert_eq!(status.success, Some(now));
        assert!(status.errored.is_none());
        assert!(status.cancelled.is_none());
        // The late error is still logged.
        assert_eq!(status.errors.len(), 1);
        assert_matches!(future.try_result(), Some(Ok(_)));
    }

    #[test]
    fn terminal_job_ignores_milestones() {
        let mut job = record();
        job.mark_cancelled(Utc::now());
        assert!(!job.mark_pending(Utc::now()));
        assert!(!job.mark_running(Utc::now()));
        assert!(!job.record_history(HistoryEntry::default()));
        assert_eq!(job.status().phase(), JobPhase::Cancelled);
    }

    #[test]
    fn errored_rejects_future() {
        let mut job = record();
        let future = job.future();
        let error = JobError::JobVanished {
            prompt_id: "p1".to_string(),
        };
        assert!(job.mark_errored(error, Utc::now()));
        assert_matches!(
            future.try_result(),
            Some(Err(JobError::JobVanished { prompt_id })) if prompt_id == "p1"
        );
        assert_eq!(job.status().errors[0].kind, "job_vanished");
    }

    #[test]
    fn record_error_does_not_conclude() {
        let mut job = record();
        job.record_error(ErrorInfo::new("execution_error", "boom", Utc::now()));
        assert!(!job.is_done());
        assert!(!job.future().is_resolved());
    }

    #[test]
    fn sync_with_result_catches_up_after_abandon() {
        let mut job = record();
        assert!(job.abandon());
        assert!(!job.is_done());
        assert!(job.sync_with_result(Utc::now()));
        assert_eq!(job.status().phase(), JobPhase::Cancelled);
        assert!(!job.sync_with_result(Utc::now()));
    }

    #[test]
    fn remote_queue_status_returns_previous() {
        let mut job = record();
        assert_eq!(
            job.set_remote_queue_status(RemoteQueueStatus::NotInQueue),
            RemoteQueueStatus::Unknown
        );
        assert_eq!(
            job.set_remote_queue_status(RemoteQueueStatus::NotInQueue),
            RemoteQueueStatus::NotInQueue
        );
    }

    #[test]
    fn restore_resolves_terminal_status() {
        let now = Utc::now();
        let mut status = JobStatus::new(now);
        status.errored = Some(now);
        status
            .errors
            .push(ErrorInfo::new("job_vanished", "gone", now));

        let job = JobRecord::restore(
            NewJob {
                job_id: "render-1".to_string(),
                workflow: Arc::new(serde_json::json!({})),
                important: BTreeSet::new(),
                debug_path: None,
            },
            status,
        );
        assert_matches!(
            job.future().try_result(),
            Some(Err(JobError::JobFailed { notes })) if notes == vec!["gone".to_string()]
        );
    }

    #[tokio::test]
    async fn future_resolves_for_every_clone() {
        let mut job = record();
        let a = job.future();
        let b = a.clone();
        let waiter = tokio::spawn(async move { a.await });

        job.mark_success(HistoryEntry::default(), Utc::now());

        assert_matches!(waiter.await.unwrap(), Ok(_));
        assert_matches!(b.await, Ok(_));
    }

    #[tokio::test]
    async fn dropped_record_cancels_future() {
        let job = record();
        let future = job.future();
        drop(job);
        assert_matches!(future.await, Err(JobError::Cancelled));
    }
}
