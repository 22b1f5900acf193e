//! Supervision of the background tasks.
//!
//! The poll loop and the event-stream consumer are expected to run until
//! shutdown. If either panics or returns early, the failure is recorded
//! here and every facade call reports it from then on.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::CatapultError;

#[derive(Debug, Clone)]
struct TaskFailure {
    task: &'static str,
    reason: String,
}

#[derive(Debug, Default)]
struct HealthState {
    failures: Vec<TaskFailure>,
    /// How many failures have already been logged by `check`.
    reported: usize,
}

/// Fatal-error surface shared by the facade and its background tasks.
#[derive(Debug, Default)]
pub(crate) struct Health {
    state: Mutex<HealthState>,
}

impl Health {
    pub(crate) fn task_failed(&self, task: &'static str, reason: String) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.failures.push(TaskFailure { task, reason });
    }

    /// `Err` with the first recorded failure. Failures not seen by a
    /// previous call are logged once at `error` level.
    pub(crate) fn check(&self) -> Result<(), CatapultError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        for failure in &state.failures[state.reported..] {
            tracing::error!(task = failure.task, reason = %failure.reason, "Background task died");
        }
        state.reported = state.failures.len();

        match state.failures.first() {
            Some(first) => Err(CatapultError::Background(format!(
                "{}: {}",
                first.task, first.reason
            ))),
            None => Ok(()),
        }
    }
}

/// Spawn a long-running task whose death outside of shutdown is fatal.
pub(crate) fn spawn_supervised<F>(
    task: &'static str,
    health: Arc<Health>,
    cancel: CancellationToken,
    fut: F,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(()) if cancel.is_cancelled() => {
                tracing::debug!(task, "Background task stopped");
            }
            Ok(()) => health.task_failed(task, "exited unexpectedly".to_string()),
            Err(panic) => health.task_failed(task, format!("panicked: {}", panic_message(&*panic))),
        }
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
