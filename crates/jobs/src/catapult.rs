//! The orchestrator facade.
//!
//! [`Catapult`] owns the job table and two background tasks: the poll loop
//! ([`crate::poller`]) and the event-stream consumer ([`crate::monitor`]).
//! Callers submit workflows, watch their status, and await their results.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use catapult_comfyui::engine::EngineClient;
use catapult_comfyui::schema::HistoryEntry;
use catapult_core::types::NodeId;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::CatapultConfig;
use crate::debug::dump_status;
use crate::error::{CatapultError, JobError, WorkflowSubmissionError};
use crate::health::{spawn_supervised, Health};
use crate::job::{JobFuture, JobRecord, NewJob};
use crate::status::{ErrorInfo, JobStatus, RemoteQueueStatus, RunningGuess};
use crate::table::JobTable;
use crate::{monitor, poller};

/// A workflow to run.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Caller-chosen slug, unique for the lifetime of the orchestrator.
    pub job_id: String,
    /// API-format workflow JSON.
    pub workflow: serde_json::Value,
    /// Output nodes that must produce data.
    pub important: Vec<NodeId>,
    /// Dump directory for this job, overriding
    /// [`CatapultConfig::debug_path`].
    pub debug_path: Option<PathBuf>,
}

impl SubmitRequest {
    pub fn new(job_id: impl Into<String>, workflow: serde_json::Value) -> Self {
        Self {
            job_id: job_id.into(),
            workflow,
            important: Vec::new(),
            debug_path: None,
        }
    }

    pub fn important<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.important = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn debug_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.debug_path = Some(path.into());
        self
    }
}

/// A job handed over from an earlier orchestrator instance.
#[derive(Debug, Clone)]
pub struct ResumeRequest {
    pub job_id: String,
    pub workflow: serde_json::Value,
    pub important: Vec<NodeId>,
    /// Status as last reported by the previous instance. Must carry a
    /// ticket with a prompt id.
    pub status: JobStatus,
    pub debug_path: Option<PathBuf>,
}

/// State shared between the facade and its background tasks.
pub(crate) struct Inner {
    pub(crate) engine: Arc<dyn EngineClient>,
    pub(crate) table: JobTable,
    pub(crate) health: Arc<Health>,
    pub(crate) config: CatapultConfig,
    /// Identifies this orchestrator to ComfyUI; submissions and the event
    /// subscription share it.
    pub(crate) client_id: String,
}

impl Inner {
    pub(crate) fn new(engine: Arc<dyn EngineClient>, config: CatapultConfig) -> Self {
        Self {
            engine,
            table: JobTable::new(),
            health: Arc::new(Health::default()),
            config,
            client_id: Uuid::new_v4().to_string(),
        }
    }

    /// Conclude a job with `error` and dump its status if it has a debug
    /// directory.
    pub(crate) async fn fail_job(&self, job_id: &str, error: JobError) {
        let dump = self
            .table
            .transaction(|state| {
                let job = state.job_mut(job_id)?;
                if !job.mark_errored(error, Utc::now()) {
                    return None;
                }
                let dir = job.debug_path()?.to_path_buf();
                Some((dir, job.status().clone()))
            })
            .await;

        if let Some((dir, status)) = dump {
            dump_status(&dir, job_id, &status).await;
        }
    }
}

/// Handle on a running orchestrator.
///
/// Created with [`Catapult::start`]. Call [`close`](Self::close) to stop
/// the background tasks; dropping the handle stops them too but does not
/// wait for them.
pub struct Catapult {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Catapult {
    /// Start tracking jobs on `engine`.
    ///
    /// Spawns the poll loop and the event-stream consumer; must be called
    /// from within a Tokio runtime.
    pub fn start(engine: Arc<dyn EngineClient>, config: CatapultConfig) -> Arc<Self> {
        let inner = Arc::new(Inner::new(engine, config));
        let cancel = CancellationToken::new();

        let tasks = vec![
            (
                "poll_loop",
                spawn_supervised(
                    "poll_loop",
                    inner.health.clone(),
                    cancel.clone(),
                    poller::run(inner.clone(), cancel.clone()),
                ),
            ),
            (
                "event_stream",
                spawn_supervised(
                    "event_stream",
                    inner.health.clone(),
                    cancel.clone(),
                    monitor::run(inner.clone(), cancel.clone()),
                ),
            ),
        ];

        tracing::info!(client_id = %inner.client_id, "Catapult started");

        Arc::new(Self {
            inner,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    /// The client id used for submissions and the event subscription.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// `Err` once a background task has died.
    pub fn check_health(&self) -> Result<(), CatapultError> {
        self.inner.health.check()
    }

    fn ensure_open(&self) -> Result<(), CatapultError> {
        if self.cancel.is_cancelled() {
            return Err(CatapultError::Closed);
        }
        self.check_health()
    }

    /// Submit a workflow and start tracking it.
    ///
    /// Returns the status right after submission and a future for the
    /// result. If ComfyUI rejects the workflow, the job is recorded as
    /// errored and [`CatapultError::WorkflowSubmission`] is returned.
    pub async fn submit(&self, req: SubmitRequest) -> Result<(JobStatus, JobFuture), CatapultError> {
        self.ensure_open()?;

        let job_id = req.job_id;
        let workflow = Arc::new(req.workflow);
        let future = self
            .create_job(NewJob {
                job_id: job_id.clone(),
                workflow: workflow.clone(),
                important: req.important.into_iter().collect::<BTreeSet<_>>(),
                debug_path: req.debug_path.or_else(|| self.inner.config.debug_path.clone()),
            })
            .await?;

        tracing::info!(job_id = %job_id, "Submitting workflow to ComfyUI");
        let ticket = match self
            .inner
            .engine
            .submit_workflow(&workflow, &self.inner.client_id)
            .await
        {
            Ok(ticket) => ticket,
            Err(e) => {
                self.inner
                    .fail_job(&job_id, JobError::Submit(e.to_string()))
                    .await;
                return Err(CatapultError::Engine(e));
            }
        };

        let prompt_id = match (&ticket.prompt_id, ticket.has_errors()) {
            (Some(prompt_id), false) => prompt_id.clone(),
            _ => {
                let rejection = WorkflowSubmissionError::new(workflow, ticket.clone());
                self.inner
                    .table
                    .transaction(|state| {
                        if let Some(job) = state.job_mut(&job_id) {
                            job.record_ticket(ticket);
                        }
                    })
                    .await;
                self.inner
                    .fail_job(&job_id, JobError::WorkflowSubmission(rejection.clone()))
                    .await;
                return Err(CatapultError::WorkflowSubmission(rejection));
            }
        };

        let now = Utc::now();
        let status = self
            .inner
            .table
            .transaction(|state| {
                state.index_prompt(&prompt_id, &job_id);
                let job = state.job_mut(&job_id)?;
                job.record_ticket(ticket);
                job.mark_engine_scheduled(now);
                Some(job.status().clone())
            })
            .await
            .ok_or_else(|| CatapultError::JobNotFound(job_id.clone()))?;

        tracing::info!(job_id = %job_id, prompt_id = %prompt_id, "Workflow queued in ComfyUI");
        Ok((status, future))
    }

    /// Insert a new record, unless `close` started meanwhile.
    ///
    /// `close` cancels the token before sweeping the table, so a record
    /// created after its sweep sees the token cancelled here and is
    /// abandoned on the spot.
    async fn create_job(&self, job: NewJob) -> Result<JobFuture, CatapultError> {
        let job_id = job.job_id.clone();
        let future = self.inner.table.create(job).await?;
        if !self.cancel.is_cancelled() {
            return Ok(future);
        }

        self.inner
            .table
            .transaction(|state| {
                if let Some(job) = state.job_mut(&job_id) {
                    job.abandon();
                    job.sync_with_result(Utc::now());
                }
            })
            .await;
        Err(CatapultError::Closed)
    }

    /// Submit a workflow and wait for its result.
    pub async fn submit_and_wait(&self, req: SubmitRequest) -> Result<HistoryEntry, CatapultError> {
        let (_, future) = self.submit(req).await?;
        Ok(future.await?)
    }

    /// Resume tracking a job submitted by an earlier orchestrator.
    ///
    /// The job is matched to ComfyUI by the prompt id in the saved
    /// ticket. A terminal saved status resolves the future immediately.
    pub async fn resume(&self, req: ResumeRequest) -> Result<(JobStatus, JobFuture), CatapultError> {
        self.ensure_open()?;

        let invalid = |reason: &str| CatapultError::InvalidResume {
            job_id: req.job_id.clone(),
            reason: reason.to_string(),
        };
        let Some(prompt_id) = req.status.prompt_id().map(str::to_string) else {
            return Err(invalid("saved status has no ticket with a prompt id"));
        };
        if req.status.success.is_some() && req.status.job_history.is_none() {
            return Err(invalid("saved status is successful but has no history"));
        }

        let record = JobRecord::restore(
            NewJob {
                job_id: req.job_id.clone(),
                workflow: Arc::new(req.workflow),
                important: req.important.into_iter().collect(),
                debug_path: req.debug_path.or_else(|| self.inner.config.debug_path.clone()),
            },
            req.status.clone(),
        );
        let future = self.inner.table.insert_restored(record).await?;

        tracing::info!(
            job_id = %req.job_id,
            prompt_id = %prompt_id,
            phase = ?req.status.phase(),
            "Resumed job",
        );
        Ok((req.status, future))
    }

    /// Current status snapshot and a future for the result.
    pub async fn get_status(&self, job_id: &str) -> Result<(JobStatus, JobFuture), CatapultError> {
        self.check_health()?;
        self.inner.table.get(job_id).await
    }

    /// Every error recorded against a job, terminal or not, oldest first.
    ///
    /// Still answers after a background task has died.
    pub async fn get_exceptions(&self, job_id: &str) -> Result<Vec<ErrorInfo>, CatapultError> {
        self.inner.table.exceptions(job_id).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<String>, CatapultError> {
        self.check_health()?;
        Ok(self.inner.table.list_ids().await)
    }

    /// What the event stream last said ComfyUI was executing. Best effort.
    pub async fn running_guess(&self) -> Result<RunningGuess, CatapultError> {
        self.check_health()?;
        Ok(self.inner.table.running_guess().await)
    }

    /// Cancel a job.
    ///
    /// A finished job is left alone. If the job may still be queued or
    /// running in ComfyUI it is deleted from the queue and the engine is
    /// interrupted. ComfyUI's interrupt is not targeted, so when the job is
    /// still waiting, or finished in the meantime, whatever prompt is
    /// executing gets interrupted instead.
    pub async fn cancel_job(&self, job_id: &str) -> Result<(), CatapultError> {
        self.check_health()?;

        let plan = self
            .inner
            .table
            .transaction(|state| -> Result<Option<Option<String>>, CatapultError> {
                let job = state
                    .job(job_id)
                    .ok_or_else(|| CatapultError::JobNotFound(job_id.to_string()))?;
                if job.is_done() {
                    return Ok(None);
                }
                let remote = match job.remote_queue_status() {
                    RemoteQueueStatus::PendingOrRunning => true,
                    RemoteQueueStatus::Unknown => job.prompt_id().is_some(),
                    RemoteQueueStatus::NotInQueue => false,
                };
                Ok(Some(job.prompt_id().filter(|_| remote).map(str::to_string)))
            })
            .await?;

        let Some(remote_prompt) = plan else {
            tracing::debug!(job_id = %job_id, "Job already finished, nothing to cancel");
            return Ok(());
        };

        if let Some(prompt_id) = remote_prompt {
            if let Err(e) = self
                .inner
                .engine
                .delete_from_queue(std::slice::from_ref(&prompt_id), false)
                .await
            {
                tracing::warn!(job_id = %job_id, prompt_id = %prompt_id, error = %e, "Failed to delete job from ComfyUI queue");
            }
            // A fresh prompt on an idle engine starts executing before
            // either signal reports it, so `running` cannot be trusted here.
            if let Err(e) = self.inner.engine.interrupt().await {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to interrupt ComfyUI");
            }
        }

        self.inner
            .table
            .transaction(|state| {
                if let Some(job) = state.job_mut(job_id) {
                    job.mark_cancelled(Utc::now());
                }
            })
            .await;
        Ok(())
    }

    /// Stop the background tasks and cancel every unfinished job.
    ///
    /// Returns the background failure, if one was recorded. Safe to call
    /// more than once.
    pub async fn close(&self) -> Result<(), CatapultError> {
        if !self.cancel.is_cancelled() {
            tracing::info!(client_id = %self.inner.client_id, "Closing catapult");
        }
        self.cancel.cancel();

        let abandoned = self
            .inner
            .table
            .transaction(|state| {
                let now = Utc::now();
                let mut abandoned = 0;
                for job in state.jobs_mut() {
                    if job.abandon() {
                        abandoned += 1;
                    }
                    job.sync_with_result(now);
                }
                abandoned
            })
            .await;
        if abandoned > 0 {
            tracing::info!(jobs = abandoned, "Cancelled unfinished jobs");
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for (task, mut handle) in tasks {
            match tokio::time::timeout(self.inner.config.shutdown_timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => self.inner.health.task_failed(task, e.to_string()),
                Err(_) => {
                    tracing::warn!(task, "Background task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        self.check_health()
    }
}

impl Drop for Catapult {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
