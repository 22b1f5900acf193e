//! Job tracking for ComfyUI.
//!
//! [`Catapult`] submits workflows to a ComfyUI engine and follows each one
//! to a single outcome. Two background tasks feed the shared
//! [`JobTable`]: a poll loop that reconciles against the engine's queue and
//! history (authoritative), and an event-stream consumer that reports
//! progress early (best effort).

pub mod catapult;
pub mod config;
pub mod debug;
pub mod error;
mod health;
pub mod job;
mod monitor;
pub mod outcome;
mod poller;
pub mod status;
pub mod table;

pub use catapult::{Catapult, ResumeRequest, SubmitRequest};
pub use config::CatapultConfig;
pub use error::{CatapultError, JobError, WorkflowSubmissionError};
pub use job::{JobFuture, JobResult};
pub use status::{ErrorInfo, JobPhase, JobStatus, Progress, RemoteQueueStatus, RunningGuess};
pub use table::JobTable;
