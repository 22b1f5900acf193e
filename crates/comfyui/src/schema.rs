//! Typed ComfyUI REST response bodies.
//!
//! Only the fields the job tracker reads are modelled explicitly;
//! everything else is preserved in `extra` maps so history entries can be
//! handed back to callers without loss.

use std::collections::HashMap;

use catapult_core::types::{NodeId, PromptId};
use serde::{Deserialize, Serialize};

/// Response returned by `POST /prompt`.
///
/// ComfyUI reports workflow validation problems through `error` and
/// `node_errors`; a ticket without a `prompt_id` was not queued.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTicket {
    #[serde(default)]
    pub prompt_id: Option<PromptId>,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: Option<i64>,
    #[serde(default)]
    pub node_errors: Option<HashMap<NodeId, NodeErrors>>,
    /// Either a plain string or a `{type, message, details, extra_info}`
    /// object depending on the ComfyUI version.
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

impl WorkflowTicket {
    /// Whether the engine rejected the submission.
    pub fn has_errors(&self) -> bool {
        let node_errors = self
            .node_errors
            .as_ref()
            .is_some_and(|errors| !errors.is_empty());
        let error = self.error.as_ref().is_some_and(|e| !e.is_null());
        node_errors || error || self.prompt_id.is_none()
    }
}

/// Validation errors for one node of a rejected workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeErrors {
    #[serde(default)]
    pub class_type: String,
    #[serde(default)]
    pub dependent_outputs: Vec<NodeId>,
    #[serde(default)]
    pub errors: Vec<NodeErrorInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeErrorInfo {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub extra_info: serde_json::Value,
}

/// Response returned by `GET /queue`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueInfo {
    #[serde(default)]
    pub queue_running: Vec<QueueEntry>,
    #[serde(default)]
    pub queue_pending: Vec<QueueEntry>,
}

/// One queued execution.
///
/// On the wire this is a positional array:
/// `[number, prompt_id, prompt, extra_data, outputs_to_execute, ...]`.
/// Trailing elements added by newer ComfyUI versions are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<serde_json::Value>", into = "Vec<serde_json::Value>")]
pub struct QueueEntry {
    pub number: i64,
    pub prompt_id: PromptId,
    pub prompt: serde_json::Value,
    pub extra_data: serde_json::Value,
    pub outputs_to_execute: Vec<NodeId>,
}

impl TryFrom<Vec<serde_json::Value>> for QueueEntry {
    type Error = String;

    fn try_from(items: Vec<serde_json::Value>) -> Result<Self, Self::Error> {
        let mut items = items.into_iter();

        let number = match items.next() {
            Some(v) => v
                .as_i64()
                .ok_or_else(|| format!("queue entry number is not an integer: {v}"))?,
            None => return Err("queue entry is empty".to_string()),
        };
        let prompt_id = match items.next() {
            Some(serde_json::Value::String(s)) => s,
            Some(v) => return Err(format!("queue entry prompt_id is not a string: {v}")),
            None => return Err("queue entry has no prompt_id".to_string()),
        };
        let prompt = items.next().unwrap_or(serde_json::Value::Null);
        let extra_data = items.next().unwrap_or(serde_json::Value::Null);
        let outputs_to_execute = match items.next() {
            Some(v) => serde_json::from_value(v)
                .map_err(|e| format!("queue entry outputs_to_execute: {e}"))?,
            None => Vec::new(),
        };

        Ok(Self {
            number,
            prompt_id,
            prompt,
            extra_data,
            outputs_to_execute,
        })
    }
}

impl From<QueueEntry> for Vec<serde_json::Value> {
    fn from(entry: QueueEntry) -> Self {
        vec![
            entry.number.into(),
            entry.prompt_id.into(),
            entry.prompt,
            entry.extra_data,
            entry.outputs_to_execute.into(),
        ]
    }
}

/// Response returned by `GET /history/{prompt_id}`: a map from prompt id
/// to its history entry. Empty when ComfyUI has no record of the prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct History(pub HashMap<PromptId, HistoryEntry>);

impl History {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, prompt_id: &str) -> Option<&HistoryEntry> {
        self.0.get(prompt_id)
    }

    pub fn into_entry(mut self, prompt_id: &str) -> Option<HistoryEntry> {
        self.0.remove(prompt_id)
    }
}

/// A finished execution as recorded by ComfyUI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Per-node output data (images, gifs, text...), keyed by node id.
    #[serde(default)]
    pub outputs: Option<HashMap<NodeId, serde_json::Value>>,
    /// The queue entry that was executed.
    #[serde(default)]
    pub prompt: Option<QueueEntry>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl HistoryEntry {
    /// Node ids the engine planned to execute as outputs.
    pub fn outputs_to_execute(&self) -> &[NodeId] {
        self.prompt
            .as_ref()
            .map(|p| p.outputs_to_execute.as_slice())
            .unwrap_or_default()
    }

    /// Whether the given node produced output data.
    pub fn has_output(&self, node_id: &str) -> bool {
        self.outputs
            .as_ref()
            .is_some_and(|outputs| outputs.contains_key(node_id))
    }
}

/// Completion block of a history entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryStatus {
    /// `"success"` or `"error"`.
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default = "default_completed")]
    pub completed: bool,
    /// `[event_name, payload]` pairs logged during execution.
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
}

fn default_completed() -> bool {
    true
}

impl HistoryStatus {
    /// Whether ComfyUI reports the run as failed or incomplete.
    pub fn is_failure(&self) -> bool {
        !self.completed || self.status_str.as_deref() == Some("error")
    }
}

/// Response returned by `GET /system_stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    #[serde(default)]
    pub system: Option<SystemInfo>,
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub python_version: Option<String>,
    #[serde(default)]
    pub embedded_python: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub index: Option<i64>,
    #[serde(default)]
    pub vram_total: Option<u64>,
    #[serde(default)]
    pub vram_free: Option<u64>,
    #[serde(default)]
    pub torch_vram_total: Option<u64>,
    #[serde(default)]
    pub torch_vram_free: Option<u64>,
}
