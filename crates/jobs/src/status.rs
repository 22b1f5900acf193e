//! Job status snapshots and the best-effort "currently running" guess.

use std::collections::BTreeMap;

use catapult_comfyui::schema::{HistoryEntry, WorkflowTicket};
use catapult_core::types::Timestamp;
use serde::{Deserialize, Serialize};

/// Last observation of a job in the engine's `/queue`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteQueueStatus {
    /// Not polled yet.
    #[default]
    Unknown,
    PendingOrRunning,
    NotInQueue,
}

/// Coarse lifecycle phase derived from the status timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Scheduled,
    EngineScheduled,
    Pending,
    Running,
    Success,
    Errored,
    Cancelled,
}

impl JobPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Errored | Self::Cancelled)
    }
}

/// One recorded problem. Terminal errors and non-terminal diagnostics
/// (stream-reported node failures, transient probe errors) share this
/// shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable category, e.g. `nodes_not_executed`.
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub recorded_at: Timestamp,
}

impl ErrorInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>, recorded_at: Timestamp) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            attributes: BTreeMap::new(),
            recorded_at,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Timeline of a single job.
///
/// Timestamps are "first observed" markers. At most one of `success`,
/// `errored` and `cancelled` is ever set; once one is, the job is done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Accepted by the orchestrator.
    pub scheduled: Option<Timestamp>,
    /// Accepted by ComfyUI (a prompt id was assigned).
    pub engine_scheduled: Option<Timestamp>,
    /// First seen pending in `/queue`.
    pub pending: Option<Timestamp>,
    /// First seen running, in `/queue` or on the event stream.
    pub running: Option<Timestamp>,
    /// Seen in `/history` with all important outputs present.
    pub success: Option<Timestamp>,
    /// Hit an unrecoverable error.
    pub errored: Option<Timestamp>,
    pub cancelled: Option<Timestamp>,
    #[serde(default)]
    pub errors: Vec<ErrorInfo>,
    /// Last successful `/system_stats` probe while the job was live.
    #[serde(default)]
    pub system_stats_check: Option<Timestamp>,
    /// Last successful `/queue` probe while the job was live.
    #[serde(default)]
    pub queue_check: Option<Timestamp>,
    /// The submission acknowledgement.
    #[serde(default)]
    pub ticket: Option<WorkflowTicket>,
    /// The `/history` entry, once retrieved.
    #[serde(default)]
    pub job_history: Option<HistoryEntry>,
}

impl JobStatus {
    pub fn new(scheduled: Timestamp) -> Self {
        Self {
            scheduled: Some(scheduled),
            engine_scheduled: None,
            pending: None,
            running: None,
            success: None,
            errored: None,
            cancelled: None,
            errors: Vec::new(),
            system_stats_check: None,
            queue_check: None,
            ticket: None,
            job_history: None,
        }
    }

    /// Whether the job is no longer viable: it finished, errored, or was
    /// cancelled.
    pub fn is_done(&self) -> bool {
        self.success.is_some() || self.errored.is_some() || self.cancelled.is_some()
    }

    pub fn phase(&self) -> JobPhase {
        if self.success.is_some() {
            JobPhase::Success
        } else if self.errored.is_some() {
            JobPhase::Errored
        } else if self.cancelled.is_some() {
            JobPhase::Cancelled
        } else if self.running.is_some() {
            JobPhase::Running
        } else if self.pending.is_some() {
            JobPhase::Pending
        } else if self.engine_scheduled.is_some() {
            JobPhase::EngineScheduled
        } else {
            JobPhase::Scheduled
        }
    }

    /// Engine-assigned prompt id, once submitted.
    pub fn prompt_id(&self) -> Option<&str> {
        self.ticket.as_ref().and_then(|t| t.prompt_id.as_deref())
    }
}

/// Step-level progress of the node currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub value: u64,
    pub max: u64,
}

/// What the event stream last claimed ComfyUI was executing.
///
/// Observability only: it races with everything and is never used to
/// decide a job's outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunningGuess {
    pub job_id: Option<String>,
    pub node_id: Option<String>,
    pub progress: Option<Progress>,
    pub updated: Timestamp,
}

impl RunningGuess {
    pub fn new(now: Timestamp) -> Self {
        Self {
            job_id: None,
            node_id: None,
            progress: None,
            updated: now,
        }
    }

    /// A (possibly unknown) job started executing `node_id`.
    pub fn set_job(&mut self, job_id: Option<String>, node_id: Option<String>, now: Timestamp) {
        self.job_id = job_id;
        self.node_id = node_id;
        self.progress = None;
        self.updated = now;
    }

    pub fn set_node(&mut self, node_id: Option<String>, now: Timestamp) {
        self.node_id = node_id;
        self.updated = now;
    }

    pub fn set_progress(&mut self, progress: Progress, now: Timestamp) {
        self.progress = Some(progress);
        self.updated = now;
    }

    pub fn clear(&mut self, now: Timestamp) {
        self.set_job(None, None, now);
    }
}
