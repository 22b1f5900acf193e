use std::sync::Arc;

use catapult_comfyui::api::ComfyUIApiError;
use catapult_comfyui::schema::WorkflowTicket;
use catapult_core::error::CoreError;
use catapult_core::types::{NodeId, Timestamp};

use crate::status::ErrorInfo;

/// ComfyUI refused to queue a workflow.
///
/// Carries the submitted workflow and the raw ticket so callers can see
/// which nodes failed validation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Workflow submission rejected by ComfyUI: {summary}")]
pub struct WorkflowSubmissionError {
    pub summary: String,
    pub workflow: Arc<serde_json::Value>,
    pub ticket: WorkflowTicket,
}

impl WorkflowSubmissionError {
    pub fn new(workflow: Arc<serde_json::Value>, ticket: WorkflowTicket) -> Self {
        Self {
            summary: summarize_ticket(&ticket),
            workflow,
            ticket,
        }
    }
}

/// Why a job did not produce a result. This is what a [`JobFuture`]
/// resolves to on failure, so it is cheap to clone.
///
/// [`JobFuture`]: crate::job::JobFuture
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    WorkflowSubmission(#[from] WorkflowSubmissionError),

    /// The submission request itself failed (network, non-2xx status).
    #[error("Failed to submit workflow: {0}")]
    Submit(String),

    /// Important output nodes finished without producing output.
    #[error("Nodes {nodes:?} (titles {titles:?}) were not executed")]
    NodesNotExecuted {
        nodes: Vec<NodeId>,
        titles: Vec<Option<String>>,
    },

    /// ComfyUI marked the execution as failed or incomplete.
    #[error("ComfyUI reported the job as failed: {}", notes.join("; "))]
    JobFailed { notes: Vec<String> },

    /// The prompt is neither queued nor in history, typically after an
    /// engine restart.
    #[error("Prompt {prompt_id} vanished from ComfyUI (not queued, no history)")]
    JobVanished { prompt_id: String },

    #[error("Job was cancelled")]
    Cancelled,
}

impl JobError {
    /// Stable category name used in [`ErrorInfo::kind`].
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkflowSubmission(_) => "workflow_submission",
            Self::Submit(_) => "submit",
            Self::NodesNotExecuted { .. } => "nodes_not_executed",
            Self::JobFailed { .. } => "job_failed",
            Self::JobVanished { .. } => "job_vanished",
            Self::Cancelled => "cancelled",
        }
    }

    /// Render into an error-log entry.
    pub fn to_info(&self, recorded_at: Timestamp) -> ErrorInfo {
        let info = ErrorInfo::new(self.kind(), self.to_string(), recorded_at);
        match self {
            Self::NodesNotExecuted { nodes, .. } => info.with_attribute("nodes", nodes.join(",")),
            Self::JobVanished { prompt_id } => info.with_attribute("prompt_id", prompt_id),
            Self::WorkflowSubmission(e) => match &e.ticket.prompt_id {
                Some(prompt_id) => info.with_attribute("prompt_id", prompt_id),
                None => info,
            },
            _ => info,
        }
    }
}

/// Errors returned by [`Catapult`](crate::catapult::Catapult) operations.
#[derive(Debug, thiserror::Error)]
pub enum CatapultError {
    #[error("Job id '{0}' is already in use")]
    DuplicateJobId(String),

    #[error("Invalid job id: {0}")]
    InvalidJobId(#[source] CoreError),

    #[error("Job '{0}' not found")]
    JobNotFound(String),

    #[error("Cannot resume job '{job_id}': {reason}")]
    InvalidResume { job_id: String, reason: String },

    #[error(transparent)]
    WorkflowSubmission(#[from] WorkflowSubmissionError),

    #[error("ComfyUI request failed: {0}")]
    Engine(#[from] ComfyUIApiError),

    #[error(transparent)]
    Job(#[from] JobError),

    /// A background task died; the orchestrator is no longer tracking
    /// jobs reliably.
    #[error("Background task failed: {0}")]
    Background(String),

    #[error("Catapult is closed")]
    Closed,
}

/// One-line description of a rejected ticket.
fn summarize_ticket(ticket: &WorkflowTicket) -> String {
    let mut parts = Vec::new();

    match &ticket.error {
        Some(serde_json::Value::String(message)) => parts.push(message.clone()),
        Some(serde_json::Value::Object(error)) => {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            match error.get("details").and_then(|d| d.as_str()) {
                Some(details) if !details.is_empty() => {
                    parts.push(format!("{message}: {details}"))
                }
                _ => parts.push(message.to_string()),
            }
        }
        Some(serde_json::Value::Null) | None => {}
        Some(other) => parts.push(other.to_string()),
    }

    if let Some(node_errors) = &ticket.node_errors {
        let mut nodes: Vec<_> = node_errors.iter().collect();
        nodes.sort_by(|a, b| a.0.cmp(b.0));
        for (node_id, errors) in nodes {
            let messages: Vec<&str> = errors.errors.iter().map(|e| e.message.as_str()).collect();
            parts.push(format!(
                "node {node_id} ({}): {}",
                errors.class_type,
                messages.join(", ")
            ));
        }
    }

    if ticket.prompt_id.is_none() && parts.is_empty() {
        parts.push("no prompt id assigned".to_string());
    }

    parts.join("; ")
}
