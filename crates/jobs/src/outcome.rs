//! Deciding whether a finished execution succeeded.

use std::collections::BTreeSet;

use catapult_comfyui::schema::{HistoryEntry, HistoryStatus};
use catapult_core::types::NodeId;

use crate::error::JobError;

/// Judge a completed history entry.
///
/// The engine's own failure flag wins. Otherwise the job fails only if one
/// of the `important` nodes was scheduled as an output and produced
/// nothing; unimportant missing outputs are tolerated.
pub fn evaluate(
    entry: &HistoryEntry,
    workflow: &serde_json::Value,
    important: &BTreeSet<NodeId>,
) -> Result<(), JobError> {
    if let Some(status) = &entry.status {
        if status.is_failure() {
            return Err(JobError::JobFailed {
                notes: failure_notes(status),
            });
        }
    }

    let mut nodes: Vec<NodeId> = Vec::new();
    for node_id in entry.outputs_to_execute() {
        if important.contains(node_id) && !entry.has_output(node_id) && !nodes.contains(node_id) {
            nodes.push(node_id.clone());
        }
    }

    if nodes.is_empty() {
        return Ok(());
    }

    let titles = nodes.iter().map(|node| node_title(workflow, node)).collect();
    Err(JobError::NodesNotExecuted { nodes, titles })
}

/// The `_meta.title` a node was given in the workflow editor.
pub fn node_title(workflow: &serde_json::Value, node_id: &str) -> Option<String> {
    workflow
        .get(node_id)?
        .get("_meta")?
        .get("title")?
        .as_str()
        .map(str::to_string)
}

/// Human-readable lines from the `[event, payload]` pairs ComfyUI logs
/// into a failed history entry.
fn failure_notes(status: &HistoryStatus) -> Vec<String> {
    let mut notes: Vec<String> = status
        .messages
        .iter()
        .filter_map(|message| {
            let pair = message.as_array()?;
            let event = pair.first()?.as_str()?;
            let payload = pair.get(1)?;
            let text = |key: &str| payload.get(key).and_then(|v| v.as_str()).unwrap_or("?");
            match event {
                "execution_error" => Some(format!(
                    "node {} ({}) raised {}: {}",
                    text("node_id"),
                    text("node_type"),
                    text("exception_type"),
                    text("exception_message").trim(),
                )),
                "execution_interrupted" => {
                    Some(format!("interrupted at node {}", text("node_id")))
                }
                _ => None,
            }
        })
        .collect();

    if notes.is_empty() {
        notes.push(format!(
            "status_str={}, completed={}",
            status.status_str.as_deref().unwrap_or("none"),
            status.completed
        ));
    }
    notes
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn workflow() -> serde_json::Value {
        serde_json::json!({
            "3": {"class_type": "KSampler", "inputs": {}, "_meta": {"title": "KSampler"}},
            "9": {"class_type": "SaveImage", "inputs": {}, "_meta": {"title": "Save Image"}},
            "12": {"class_type": "PreviewImage", "inputs": {}},
        })
    }

    fn entry(outputs_to_execute: &[&str], produced: &[&str]) -> HistoryEntry {
        let outputs: serde_json::Map<String, serde_json::Value> = produced
            .iter()
            .map(|node| (node.to_string(), serde_json::json!({"images": []})))
            .collect();
        serde_json::from_value(serde_json::json!({
            "prompt": [1, "p1", {}, {}, outputs_to_execute],
            "outputs": outputs,
            "status": {"status_str": "success", "completed": true, "messages": []},
        }))
        .unwrap()
    }

    fn important(nodes: &[&str]) -> BTreeSet<NodeId> {
        nodes.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn all_outputs_present_is_success() {
        let entry = entry(&["9"], &["9"]);
        assert!(evaluate(&entry, &workflow(), &important(&["9"])).is_ok());
    }

    #[test]
    fn missing_important_output_fails_with_title() {
        let entry = entry(&["9", "12"], &["12"]);
        let err = evaluate(&entry, &workflow(), &important(&["9"])).unwrap_err();
        assert_matches!(
            err,
            JobError::NodesNotExecuted { nodes, titles }
                if nodes == vec!["9".to_string()] && titles == vec![Some("Save Image".to_string())]
        );
    }

    #[test]
    fn missing_unimportant_output_is_tolerated() {
        let entry = entry(&["9", "12"], &["9"]);
        assert!(evaluate(&entry, &workflow(), &important(&["9"])).is_ok());
    }

    #[test]
    fn title_is_none_without_meta() {
        assert_eq!(node_title(&workflow(), "12"), None);
        assert_eq!(node_title(&workflow(), "404"), None);
        assert_eq!(node_title(&workflow(), "3").as_deref(), Some("KSampler"));
    }

    #[test]
    fn engine_failure_wins_over_outputs() {
        let mut entry = entry(&["9"], &["9"]);
        entry.status = Some(HistoryStatus {
            status_str: Some("error".to_string()),
            completed: false,
            messages: vec![serde_json::json!([
                "execution_error",
                {
                    "node_id": "3",
                    "node_type": "KSampler",
                    "exception_type": "RuntimeError",
                    "exception_message": "CUDA out of memory\n",
                }
            ])],
        });

        let err = evaluate(&entry, &workflow(), &important(&["9"])).unwrap_err();
        assert_matches!(
            err,
            JobError::JobFailed { notes }
                if notes == vec!["node 3 (KSampler) raised RuntimeError: CUDA out of memory".to_string()]
        );
    }

    #[test]
    fn incomplete_without_messages_still_fails() {
        let mut entry = entry(&[], &[]);
        entry.status = Some(HistoryStatus {
            status_str: None,
            completed: false,
            messages: vec![],
        });
        let err = evaluate(&entry, &workflow(), &important(&[])).unwrap_err();
        assert_matches!(err, JobError::JobFailed { notes } if notes[0].contains("completed=false"));
    }
}
