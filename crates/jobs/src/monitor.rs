//! Event-stream consumer.
//!
//! Keeps a WebSocket subscription open and feeds its messages into the
//! job table. Everything here is opportunistic: it makes `running` show
//! up sooner and maintains the running guess, but never decides an
//! outcome.

use std::sync::Arc;

use catapult_comfyui::client::{ComfyUIClientError, EventStream};
use catapult_comfyui::messages::{parse_message, ComfyUIMessage, ExecutionFailureData};
use catapult_comfyui::reconnect::reconnect_loop;
use catapult_core::types::{NodeId, Timestamp};
use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::catapult::Inner;
use crate::status::{ErrorInfo, Progress};
use crate::table::{JobTable, TableState};

/// Why a receive session ended on its own.
enum SessionEnd {
    Closed,
    Failed(ComfyUIClientError),
}

pub(crate) async fn run(inner: Arc<Inner>, cancel: CancellationToken) {
    let engine = inner.engine.as_ref();
    let client_id = inner.client_id.as_str();
    tracing::info!(client_id = %client_id, "Event stream consumer started");

    loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => break,
            opened = engine.open_event_stream(client_id) => opened,
        };

        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(client_id = %client_id, error = %e, "Failed to open event stream");
                match reconnect_loop(engine, client_id, &inner.config.reconnect, &cancel).await {
                    Some(stream) => stream,
                    None => break,
                }
            }
        };
        tracing::debug!(client_id = %client_id, "Event stream open");

        // ComfyUI only says what is executing when a client connects, so
        // connections are recycled on a fixed interval.
        let ended = tokio::select! {
            _ = cancel.cancelled() => break,
            ended = tokio::time::timeout(inner.config.ws_connect_interval, consume(&inner, stream)) => ended,
        };
        match ended {
            Err(_) => tracing::debug!(client_id = %client_id, "Recycling event stream"),
            Ok(SessionEnd::Closed) => {
                tracing::info!(client_id = %client_id, "Event stream closed by ComfyUI")
            }
            Ok(SessionEnd::Failed(e)) => {
                tracing::warn!(client_id = %client_id, error = %e, "Event stream failed")
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(inner.config.reconnect.initial_delay) => {}
        }
    }

    tracing::info!(client_id = %client_id, "Event stream consumer stopped");
}

async fn consume(inner: &Inner, mut stream: EventStream) -> SessionEnd {
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(text) => text,
            Err(e) => return SessionEnd::Failed(e),
        };

        match parse_message(&text) {
            Ok(message) => handle_message(&inner.table, message).await,
            Err(e) => {
                tracing::warn!(error = %e, raw = %text, "Failed to decode ComfyUI message");
                tokio::time::sleep(inner.config.decode_error_delay).await;
            }
        }
    }
    SessionEnd::Closed
}

/// Apply one decoded message to the table.
pub(crate) async fn handle_message(table: &JobTable, message: ComfyUIMessage) {
    let now = Utc::now();

    match message {
        ComfyUIMessage::Executing(data) => match data.prompt_id {
            Some(prompt_id) => {
                table
                    .transaction(|state| observe_running(state, &prompt_id, data.node, now))
                    .await;
            }
            None => {
                if let Some(node) = data.last_node_id.or(data.node) {
                    table
                        .transaction(|state| state.running_guess_mut().set_node(Some(node), now))
                        .await;
                }
            }
        },
        ComfyUIMessage::ExecutionStart(data) => {
            table
                .transaction(|state| observe_running(state, &data.prompt_id, None, now))
                .await;
        }
        ComfyUIMessage::Executed(data) => {
            table
                .transaction(|state| {
                    if !observe_running(state, &data.prompt_id, Some(data.node), now) {
                        state.running_guess_mut().set_node(None, now);
                    }
                })
                .await;
        }
        ComfyUIMessage::ExecutionError(data) => {
            table
                .transaction(|state| record_failure(state, "execution_error", data, now))
                .await;
        }
        ComfyUIMessage::ExecutionInterrupted(data) => {
            table
                .transaction(|state| record_failure(state, "execution_interrupted", data, now))
                .await;
        }
        ComfyUIMessage::ExecutionSuccess(data) => {
            tracing::debug!(prompt_id = %data.prompt_id, "Execution finished");
            table
                .transaction(|state| state.running_guess_mut().clear(now))
                .await;
        }
        ComfyUIMessage::Progress(data) => match data.steps() {
            Some((value, max)) => {
                table
                    .transaction(|state| {
                        state
                            .running_guess_mut()
                            .set_progress(Progress { value, max }, now)
                    })
                    .await;
            }
            None => {
                tracing::debug!(value = %data.value, max = %data.max, "Ignoring non-integer progress")
            }
        },
        ComfyUIMessage::Status(data) => {
            let queue_remaining = data.status.and_then(|s| s.exec_info.queue_remaining);
            tracing::debug!(?queue_remaining, "ComfyUI status");
        }
        ComfyUIMessage::ExecutionCached(data) => {
            tracing::debug!(prompt_id = ?data.prompt_id, nodes = ?data.nodes, "Nodes served from cache");
        }
        ComfyUIMessage::Unknown { kind, .. } => {
            tracing::debug!(kind = %kind, "Ignoring unhandled ComfyUI message");
        }
    }
}

/// A prompt is executing `node`. Returns whether the prompt belongs to a
/// tracked job.
fn observe_running(
    state: &mut TableState,
    prompt_id: &str,
    node: Option<NodeId>,
    now: Timestamp,
) -> bool {
    let job_id = state.resolve_prompt(prompt_id).map(str::to_string);
    if let Some(job) = job_id.as_deref().and_then(|id| state.job_mut(id)) {
        job.mark_running(now);
    }
    let known = job_id.is_some();
    state.running_guess_mut().set_job(job_id, node, now);
    known
}

/// Note a node failure reported on the stream. The poll loop concludes
/// the job once ComfyUI writes the history entry.
fn record_failure(state: &mut TableState, kind: &str, data: ExecutionFailureData, now: Timestamp) {
    let job_id = data
        .prompt_id
        .as_deref()
        .and_then(|prompt_id| state.resolve_prompt(prompt_id))
        .map(str::to_string);

    match job_id.as_deref().and_then(|id| state.job_mut(id)) {
        Some(job) if !job.is_done() => {
            let message = match (&data.exception_type, &data.exception_message) {
                (Some(exception), Some(message)) => format!("{exception}: {}", message.trim()),
                (None, Some(message)) => message.trim().to_string(),
                _ => kind.replace('_', " "),
            };
            tracing::warn!(
                job_id = %job.job_id(),
                node_id = ?data.node_id,
                node_type = ?data.node_type,
                "ComfyUI reported {kind}",
            );

            let mut info = ErrorInfo::new(kind, message, now).with_attribute("payload", data.raw.to_string());
            for (key, value) in [
                ("prompt_id", &data.prompt_id),
                ("node_id", &data.node_id),
                ("node_type", &data.node_type),
                ("exception_type", &data.exception_type),
            ] {
                if let Some(value) = value {
                    info = info.with_attribute(key, value);
                }
            }
            job.record_error(info);
        }
        Some(_) => {}
        None => tracing::debug!(prompt_id = ?data.prompt_id, "Ignoring {kind} for untracked prompt"),
    }

    state.running_guess_mut().clear(now);
}
