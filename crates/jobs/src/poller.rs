//! Reconciliation loop.
//!
//! The authoritative path to a job's outcome: every `poll_interval` the
//! engine's queue and history are compared against the job table. The
//! event stream only adds timeliness on top of this.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use catapult_comfyui::schema::{History, QueueInfo};
use catapult_core::types::{NodeId, PromptId};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::catapult::Inner;
use crate::error::JobError;
use crate::outcome;
use crate::status::{ErrorInfo, RemoteQueueStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueuePosition {
    Pending,
    Running,
}

/// A job that has left the queue and needs a history lookup.
struct HistoryCandidate {
    job_id: String,
    prompt_id: PromptId,
    /// Already out of the queue on the previous pass.
    previously_absent: bool,
    workflow: Arc<serde_json::Value>,
    important: BTreeSet<NodeId>,
}

pub(crate) async fn run(inner: Arc<Inner>, cancel: CancellationToken) {
    tracing::info!(
        poll_interval_ms = inner.config.poll_interval.as_millis() as u64,
        "Poll loop started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(inner.config.poll_interval) => {}
        }
        poll_once(&inner).await;
    }

    tracing::info!("Poll loop stopped");
}

/// One reconciliation pass.
pub(crate) async fn poll_once(inner: &Inner) {
    if let Err(e) = inner.health.check() {
        tracing::debug!(error = %e, "Polling with a failed background task");
    }

    let synced = inner
        .table
        .transaction(|state| {
            let now = Utc::now();
            state
                .jobs_mut()
                .filter_map(|job| job.sync_with_result(now).then(|| job.job_id().to_string()))
                .collect::<Vec<_>>()
        })
        .await;
    if !synced.is_empty() {
        tracing::debug!(jobs = ?synced, "Reconciled statuses with resolved results");
    }

    probe_system_stats(inner).await;

    let Some(candidates) = probe_queue(inner).await else {
        return;
    };

    for candidate in candidates {
        probe_history(inner, candidate).await;
    }
}

async fn probe_system_stats(inner: &Inner) {
    match inner.engine.get_system_stats().await {
        Ok(stats) => {
            tracing::debug!(devices = stats.devices.len(), "System stats check passed");
            let now = Utc::now();
            inner
                .table
                .transaction(|state| {
                    for job in state.jobs_mut() {
                        job.stamp_system_stats_check(now);
                    }
                })
                .await;
        }
        Err(e) => tracing::warn!(error = %e, "System stats check failed"),
    }
}

/// Map every queued prompt to its position. A prompt listed as both
/// pending and running counts as running.
fn queue_positions(queue: &QueueInfo) -> HashMap<PromptId, QueuePosition> {
    let mut positions = HashMap::new();
    for entry in &queue.queue_pending {
        positions.insert(entry.prompt_id.clone(), QueuePosition::Pending);
    }
    for entry in &queue.queue_running {
        positions.insert(entry.prompt_id.clone(), QueuePosition::Running);
    }
    positions
}

/// Apply the queue observation. Returns the jobs to look up in history,
/// or `None` if the queue could not be fetched.
async fn probe_queue(inner: &Inner) -> Option<Vec<HistoryCandidate>> {
    let queue = match inner.engine.get_queue().await {
        Ok(queue) => queue,
        Err(e) => {
            tracing::warn!(error = %e, "Queue check failed, skipping history checks");
            return None;
        }
    };
    let positions = queue_positions(&queue);
    let now = Utc::now();

    let candidates = inner
        .table
        .transaction(|state| {
            let mut started = None;
            for (prompt_id, position) in &positions {
                // Prompts submitted by other clients are not ours to track.
                let Some(job) = state.job_for_prompt_mut(prompt_id) else {
                    continue;
                };
                match position {
                    QueuePosition::Pending => {
                        job.mark_pending(now);
                    }
                    QueuePosition::Running => {
                        if job.mark_running(now) {
                            started = Some(job.job_id().to_string());
                        }
                    }
                }
            }
            if let Some(job_id) = started {
                state.running_guess_mut().set_job(Some(job_id), None, now);
            }

            let mut candidates = Vec::new();
            for job in state.jobs_mut() {
                if job.is_done() {
                    continue;
                }
                let Some(prompt_id) = job.prompt_id().map(str::to_string) else {
                    continue;
                };
                job.stamp_queue_check(now);

                let queued = positions.contains_key(&prompt_id);
                let observed = if queued {
                    RemoteQueueStatus::PendingOrRunning
                } else {
                    RemoteQueueStatus::NotInQueue
                };
                let previous = job.set_remote_queue_status(observed);

                if !queued && job.status().job_history.is_none() {
                    candidates.push(HistoryCandidate {
                        job_id: job.job_id().to_string(),
                        prompt_id,
                        previously_absent: previous == RemoteQueueStatus::NotInQueue,
                        workflow: job.workflow().clone(),
                        important: job.important().clone(),
                    });
                }
            }
            candidates
        })
        .await;

    Some(candidates)
}

async fn probe_history(inner: &Inner, candidate: HistoryCandidate) {
    let history = match inner.engine.get_history(&candidate.prompt_id).await {
        Ok(history) => history,
        Err(e) => {
            tracing::warn!(
                job_id = %candidate.job_id,
                prompt_id = %candidate.prompt_id,
                error = %e,
                "History check failed",
            );
            let info = ErrorInfo::new("history_check", e.to_string(), Utc::now())
                .with_attribute("prompt_id", &candidate.prompt_id);
            inner
                .table
                .transaction(|state| {
                    if let Some(job) = state.job_mut(&candidate.job_id) {
                        job.record_error(info);
                    }
                })
                .await;
            return;
        }
    };

    apply_history(inner, candidate, history).await;
}

async fn apply_history(inner: &Inner, candidate: HistoryCandidate, history: History) {
    if history.is_empty() {
        if candidate.previously_absent {
            let error = JobError::JobVanished {
                prompt_id: candidate.prompt_id.clone(),
            };
            inner.fail_job(&candidate.job_id, error).await;
        } else {
            // Finished between the queue and history probes, or not
            // recorded yet. Look again next pass.
            tracing::debug!(
                job_id = %candidate.job_id,
                prompt_id = %candidate.prompt_id,
                "Job left the queue but has no history yet",
            );
        }
        return;
    }

    let Some(entry) = history.into_entry(&candidate.prompt_id) else {
        tracing::warn!(
            job_id = %candidate.job_id,
            prompt_id = %candidate.prompt_id,
            "History response did not contain the requested prompt",
        );
        let info = ErrorInfo::new(
            "history_check",
            "history response did not contain the requested prompt",
            Utc::now(),
        )
        .with_attribute("prompt_id", &candidate.prompt_id);
        inner
            .table
            .transaction(|state| {
                if let Some(job) = state.job_mut(&candidate.job_id) {
                    job.record_error(info);
                }
            })
            .await;
        return;
    };

    match outcome::evaluate(&entry, &candidate.workflow, &candidate.important) {
        Ok(()) => {
            inner
                .table
                .transaction(|state| {
                    if let Some(job) = state.job_mut(&candidate.job_id) {
                        job.mark_success(entry, Utc::now());
                    }
                })
                .await;
        }
        Err(error) => {
            inner
                .table
                .transaction(|state| {
                    if let Some(job) = state.job_mut(&candidate.job_id) {
                        job.record_history(entry);
                    }
                })
                .await;
            inner.fail_job(&candidate.job_id, error).await;
        }
    }
}
