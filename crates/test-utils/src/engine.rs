//! In-memory ComfyUI engine with call recording.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use catapult_comfyui::api::ComfyUIApiError;
use catapult_comfyui::client::{ComfyUIClientError, EventStream};
use catapult_comfyui::engine::EngineClient;
use catapult_comfyui::schema::{
    History, HistoryEntry, QueueEntry, QueueInfo, SystemStats, WorkflowTicket,
};
use futures::channel::mpsc;
use futures::StreamExt;

/// Record of an engine call for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    /// `POST /prompt`.
    SubmitWorkflow {
        /// Client id the workflow was submitted under.
        client_id: String,
    },
    /// `GET /queue`.
    GetQueue,
    /// `GET /history/{prompt_id}`.
    GetHistory {
        /// Prompt that was looked up.
        prompt_id: String,
    },
    /// `GET /system_stats`.
    GetSystemStats,
    /// `POST /interrupt`.
    Interrupt,
    /// `POST /queue` with a delete list.
    DeleteFromQueue {
        /// Prompts asked to be removed.
        prompt_ids: Vec<String>,
        /// Whether the whole queue was cleared.
        clear: bool,
    },
    /// WebSocket subscription.
    OpenEventStream {
        /// Client id used for the subscription.
        client_id: String,
    },
}

type FrameSender = mpsc::UnboundedSender<Result<String, ComfyUIClientError>>;

#[derive(Default)]
struct MockState {
    tickets: VecDeque<WorkflowTicket>,
    submitted: u64,
    queue: QueueInfo,
    histories: HashMap<String, HistoryEntry>,
    fail_submit: bool,
    fail_queue: bool,
    fail_history: bool,
    fail_system_stats: bool,
    panic_on_queue: bool,
    stream_failures: u32,
    stream: Option<FrameSender>,
    calls: Vec<EngineCall>,
}

/// Scriptable stand-in for a ComfyUI server.
///
/// Submissions get tickets `prompt-1`, `prompt-2`, ... unless tickets were
/// queued with [`push_ticket`](Self::push_ticket). The queue is empty and
/// every history lookup returns nothing until configured. Each
/// `open_event_stream` replaces the previous stream; frames pushed with
/// [`push_event`](Self::push_event) go to the newest one.
#[derive(Default)]
pub struct MockEngine {
    state: Mutex<MockState>,
}

fn mock_failure(what: &str) -> ComfyUIApiError {
    ComfyUIApiError::Status {
        status: 500,
        body: format!("mock {what} failure"),
    }
}

impl MockEngine {
    /// Creates an engine with an empty queue and history.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    // ---- scripting ----

    /// Answer the next submission with `ticket`.
    pub fn push_ticket(&self, ticket: WorkflowTicket) {
        self.with_state(|s| s.tickets.push_back(ticket));
    }

    /// Replace the queue contents with the given prompt ids.
    pub fn set_queue(&self, running: &[&str], pending: &[&str]) {
        let entries = |ids: &[&str]| {
            ids.iter()
                .enumerate()
                .map(|(i, id)| QueueEntry {
                    number: i as i64,
                    prompt_id: (*id).to_string(),
                    ..Default::default()
                })
                .collect::<Vec<_>>()
        };
        let queue = QueueInfo {
            queue_running: entries(running),
            queue_pending: entries(pending),
        };
        self.with_state(|s| s.queue = queue);
    }

    /// Record a finished execution for `prompt_id`.
    pub fn set_history(&self, prompt_id: &str, entry: HistoryEntry) {
        self.with_state(|s| {
            s.histories.insert(prompt_id.to_string(), entry);
        });
    }

    /// Make `submit_workflow` fail with a 500.
    pub fn fail_submit(&self, fail: bool) {
        self.with_state(|s| s.fail_submit = fail);
    }

    /// Make `get_queue` fail with a 500.
    pub fn fail_queue(&self, fail: bool) {
        self.with_state(|s| s.fail_queue = fail);
    }

    /// Make `get_history` fail with a 500.
    pub fn fail_history(&self, fail: bool) {
        self.with_state(|s| s.fail_history = fail);
    }

    /// Make `get_system_stats` fail with a 500.
    pub fn fail_system_stats(&self, fail: bool) {
        self.with_state(|s| s.fail_system_stats = fail);
    }

    /// Make `get_queue` panic, killing whichever task calls it.
    pub fn panic_on_queue(&self, panic: bool) {
        self.with_state(|s| s.panic_on_queue = panic);
    }

    /// Refuse the next `count` event-stream connections.
    pub fn fail_stream_opens(&self, count: u32) {
        self.with_state(|s| s.stream_failures = count);
    }

    /// Send a text frame on the current event stream. Returns `false` if
    /// no stream is open.
    pub fn push_event(&self, frame: impl Into<String>) -> bool {
        let frame = frame.into();
        self.with_state(|s| match &s.stream {
            Some(tx) => tx.unbounded_send(Ok(frame)).is_ok(),
            None => false,
        })
    }

    /// Fail the current event stream with a protocol error.
    pub fn push_stream_error(&self, message: &str) -> bool {
        self.with_state(|s| match &s.stream {
            Some(tx) => tx
                .unbounded_send(Err(ComfyUIClientError::Protocol(message.to_string())))
                .is_ok(),
            None => false,
        })
    }

    /// End the current event stream as if the server closed it.
    pub fn close_stream(&self) {
        self.with_state(|s| s.stream = None);
    }

    /// Wait until an event stream is open, polling every few milliseconds.
    pub async fn wait_for_stream(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let open = self.with_state(|s| s.stream.as_ref().is_some_and(|tx| !tx.is_closed()));
            if open {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    // ---- inspection ----

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<EngineCall> {
        self.with_state(|s| s.calls.clone())
    }

    /// Client ids of all submissions.
    pub fn submitted_client_ids(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::SubmitWorkflow { client_id } => Some(client_id),
                _ => None,
            })
            .collect()
    }

    /// Number of `get_history` calls.
    pub fn history_requests(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, EngineCall::GetHistory { .. }))
            .count()
    }

    /// All prompt ids passed to `delete_from_queue`.
    pub fn deleted_prompt_ids(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::DeleteFromQueue { prompt_ids, .. } => Some(prompt_ids),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Number of `interrupt` calls.
    pub fn interrupts(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, EngineCall::Interrupt))
            .count()
    }

    /// Number of `open_event_stream` calls, successful or not.
    pub fn stream_opens(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, EngineCall::OpenEventStream { .. }))
            .count()
    }
}

#[async_trait]
impl EngineClient for MockEngine {
    async fn submit_workflow(
        &self,
        _workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<WorkflowTicket, ComfyUIApiError> {
        self.with_state(|s| {
            s.calls.push(EngineCall::SubmitWorkflow {
                client_id: client_id.to_string(),
            });
            if s.fail_submit {
                return Err(mock_failure("submit"));
            }
            s.submitted += 1;
            let number = s.submitted;
            Ok(s.tickets.pop_front().unwrap_or_else(|| WorkflowTicket {
                prompt_id: Some(format!("prompt-{number}")),
                number: Some(number as i64),
                node_errors: Some(HashMap::new()),
                error: None,
            }))
        })
    }

    async fn get_queue(&self) -> Result<QueueInfo, ComfyUIApiError> {
        let (result, panic) = self.with_state(|s| {
            s.calls.push(EngineCall::GetQueue);
            let result = if s.fail_queue {
                Err(mock_failure("queue"))
            } else {
                Ok(s.queue.clone())
            };
            (result, s.panic_on_queue)
        });
        // Outside the lock so the mutex is not poisoned.
        if panic {
            panic!("mock engine panicked in get_queue");
        }
        result
    }

    async fn get_history(&self, prompt_id: &str) -> Result<History, ComfyUIApiError> {
        self.with_state(|s| {
            s.calls.push(EngineCall::GetHistory {
                prompt_id: prompt_id.to_string(),
            });
            if s.fail_history {
                return Err(mock_failure("history"));
            }
            let mut history = History::default();
            if let Some(entry) = s.histories.get(prompt_id) {
                history.0.insert(prompt_id.to_string(), entry.clone());
            }
            Ok(history)
        })
    }

    async fn get_system_stats(&self) -> Result<SystemStats, ComfyUIApiError> {
        self.with_state(|s| {
            s.calls.push(EngineCall::GetSystemStats);
            if s.fail_system_stats {
                return Err(mock_failure("system stats"));
            }
            Ok(SystemStats::default())
        })
    }

    async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        self.with_state(|s| s.calls.push(EngineCall::Interrupt));
        Ok(())
    }

    async fn delete_from_queue(
        &self,
        prompt_ids: &[String],
        clear: bool,
    ) -> Result<(), ComfyUIApiError> {
        self.with_state(|s| {
            s.calls.push(EngineCall::DeleteFromQueue {
                prompt_ids: prompt_ids.to_vec(),
                clear,
            });
            s.queue
                .queue_pending
                .retain(|entry| !prompt_ids.contains(&entry.prompt_id));
        });
        Ok(())
    }

    async fn open_event_stream(&self, client_id: &str) -> Result<EventStream, ComfyUIClientError> {
        self.with_state(|s| {
            s.calls.push(EngineCall::OpenEventStream {
                client_id: client_id.to_string(),
            });
            if s.stream_failures > 0 {
                s.stream_failures -= 1;
                return Err(ComfyUIClientError::Connection(
                    "mock connection refused".to_string(),
                ));
            }
            let (tx, rx) = mpsc::unbounded();
            s.stream = Some(tx);
            Ok(rx.boxed())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generated_tickets_are_numbered() {
        let engine = MockEngine::new();
        let a = engine.submit_workflow(&serde_json::json!({}), "c").await.unwrap();
        let b = engine.submit_workflow(&serde_json::json!({}), "c").await.unwrap();
        assert_eq!(a.prompt_id.as_deref(), Some("prompt-1"));
        assert_eq!(b.prompt_id.as_deref(), Some("prompt-2"));
        assert!(!a.has_errors());
    }

    #[tokio::test]
    async fn events_reach_the_newest_stream() {
        let engine = MockEngine::new();
        assert!(!engine.push_event("ignored"));

        let mut stream = engine.open_event_stream("c").await.unwrap();
        assert!(engine.wait_for_stream(Duration::from_millis(50)).await);
        assert!(engine.push_event("hello"));
        assert_eq!(stream.next().await.unwrap().unwrap(), "hello");

        engine.close_stream();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn stream_failures_are_counted_down() {
        let engine = MockEngine::new();
        engine.fail_stream_opens(1);
        assert!(engine.open_event_stream("c").await.is_err());
        assert!(engine.open_event_stream("c").await.is_ok());
        assert_eq!(engine.stream_opens(), 2);
    }
}
