//! Pre-built test data: workflows, tickets, history entries, event frames.

use std::collections::HashMap;

use catapult_comfyui::schema::{HistoryEntry, NodeErrorInfo, NodeErrors, WorkflowTicket};

/// A small text-to-image workflow in API format.
///
/// Node `9` ("Save Image") is the usual important output; node `12` is a
/// preview without a `_meta` title.
pub fn workflow() -> serde_json::Value {
    serde_json::json!({
        "3": {
            "class_type": "KSampler",
            "inputs": {"seed": 42, "steps": 20, "model": ["4", 0]},
            "_meta": {"title": "KSampler"}
        },
        "4": {
            "class_type": "CheckpointLoaderSimple",
            "inputs": {"ckpt_name": "sd_xl_base_1.0.safetensors"},
            "_meta": {"title": "Load Checkpoint"}
        },
        "8": {
            "class_type": "VAEDecode",
            "inputs": {"samples": ["3", 0], "vae": ["4", 2]},
            "_meta": {"title": "VAE Decode"}
        },
        "9": {
            "class_type": "SaveImage",
            "inputs": {"images": ["8", 0], "filename_prefix": "render"},
            "_meta": {"title": "Save Image"}
        },
        "12": {
            "class_type": "PreviewImage",
            "inputs": {"images": ["8", 0]}
        }
    })
}

/// An accepted submission.
pub fn ticket(prompt_id: &str) -> WorkflowTicket {
    WorkflowTicket {
        prompt_id: Some(prompt_id.to_string()),
        number: Some(1),
        node_errors: Some(HashMap::new()),
        error: None,
    }
}

/// A submission rejected because `node_id` failed validation.
pub fn rejected_ticket(node_id: &str) -> WorkflowTicket {
    let mut node_errors = HashMap::new();
    node_errors.insert(
        node_id.to_string(),
        NodeErrors {
            class_type: "CheckpointLoaderSimple".to_string(),
            dependent_outputs: vec!["9".to_string()],
            errors: vec![NodeErrorInfo {
                kind: "value_not_in_list".to_string(),
                message: "Value not in list".to_string(),
                details: "ckpt_name: 'missing.safetensors' not in []".to_string(),
                extra_info: serde_json::Value::Null,
            }],
        },
    );
    WorkflowTicket {
        prompt_id: None,
        number: None,
        node_errors: Some(node_errors),
        error: Some(serde_json::json!({
            "type": "prompt_outputs_failed_validation",
            "message": "Prompt outputs failed validation",
            "details": "",
            "extra_info": {}
        })),
    }
}

/// A successfully completed execution that planned `outputs_to_execute`
/// and produced images for the `produced` nodes.
pub fn history_entry(prompt_id: &str, outputs_to_execute: &[&str], produced: &[&str]) -> HistoryEntry {
    let outputs: serde_json::Map<String, serde_json::Value> = produced
        .iter()
        .map(|node| {
            (
                (*node).to_string(),
                serde_json::json!({
                    "images": [{"filename": format!("render_{node}.png"), "subfolder": "", "type": "output"}]
                }),
            )
        })
        .collect();

    serde_json::from_value(serde_json::json!({
        "prompt": [1, prompt_id, workflow(), {"client_id": "test"}, outputs_to_execute],
        "outputs": outputs,
        "status": {"status_str": "success", "completed": true, "messages": []}
    }))
    .unwrap()
}

/// An execution ComfyUI marked as failed at `node_id`.
pub fn failed_history_entry(prompt_id: &str, node_id: &str, message: &str) -> HistoryEntry {
    serde_json::from_value(serde_json::json!({
        "prompt": [1, prompt_id, workflow(), {"client_id": "test"}, ["9"]],
        "outputs": {},
        "status": {
            "status_str": "error",
            "completed": false,
            "messages": [
                ["execution_start", {"prompt_id": prompt_id}],
                ["execution_error", {
                    "prompt_id": prompt_id,
                    "node_id": node_id,
                    "node_type": "KSampler",
                    "exception_type": "RuntimeError",
                    "exception_message": message
                }]
            ]
        }
    }))
    .unwrap()
}

/// A WebSocket text frame `{"type": kind, "data": data}`.
pub fn event(kind: &str, data: serde_json::Value) -> String {
    serde_json::json!({"type": kind, "data": data}).to_string()
}
