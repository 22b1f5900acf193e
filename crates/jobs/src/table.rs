//! The job table: every tracked job, the prompt-id index, and the running
//! guess, all behind one lock.
//!
//! Callers never get a reference that outlives the lock. Reads hand out
//! snapshots; writes go through [`JobTable::transaction`], whose closure
//! runs synchronously while the lock is held.

use std::collections::HashMap;

use catapult_core::naming::validate_job_id;
use catapult_core::types::PromptId;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::CatapultError;
use crate::job::{JobFuture, JobRecord, NewJob};
use crate::status::{ErrorInfo, JobStatus, RunningGuess};

/// Shared registry of jobs.
pub struct JobTable {
    state: Mutex<TableState>,
}

/// Contents of the table, visible only inside a transaction.
pub struct TableState {
    jobs: HashMap<String, JobRecord>,
    prompt_index: HashMap<PromptId, String>,
    running: RunningGuess,
}

impl JobTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                jobs: HashMap::new(),
                prompt_index: HashMap::new(),
                running: RunningGuess::new(Utc::now()),
            }),
        }
    }

    /// Start tracking a new job.
    pub async fn create(&self, job: NewJob) -> Result<JobFuture, CatapultError> {
        validate_job_id(&job.job_id).map_err(CatapultError::InvalidJobId)?;
        let record = JobRecord::new(job, Utc::now());
        self.insert(record).await
    }

    /// Track a job rebuilt from a saved status, indexing its prompt id.
    pub(crate) async fn insert_restored(&self, record: JobRecord) -> Result<JobFuture, CatapultError> {
        validate_job_id(record.job_id()).map_err(CatapultError::InvalidJobId)?;
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(record.job_id()) {
            return Err(CatapultError::DuplicateJobId(record.job_id().to_string()));
        }
        if let Some(prompt_id) = record.prompt_id() {
            state
                .prompt_index
                .insert(prompt_id.to_string(), record.job_id().to_string());
        }
        let future = record.future();
        state.jobs.insert(record.job_id().to_string(), record);
        Ok(future)
    }

    async fn insert(&self, record: JobRecord) -> Result<JobFuture, CatapultError> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(record.job_id()) {
            return Err(CatapultError::DuplicateJobId(record.job_id().to_string()));
        }
        let future = record.future();
        state.jobs.insert(record.job_id().to_string(), record);
        Ok(future)
    }

    /// Snapshot of a job's status plus a handle on its result.
    pub async fn get(&self, job_id: &str) -> Result<(JobStatus, JobFuture), CatapultError> {
        let state = self.state.lock().await;
        let job = state
            .jobs
            .get(job_id)
            .ok_or_else(|| CatapultError::JobNotFound(job_id.to_string()))?;
        Ok((job.status().clone(), job.future()))
    }

    pub async fn exceptions(&self, job_id: &str) -> Result<Vec<ErrorInfo>, CatapultError> {
        let state = self.state.lock().await;
        let job = state
            .jobs
            .get(job_id)
            .ok_or_else(|| CatapultError::JobNotFound(job_id.to_string()))?;
        Ok(job.status().errors.clone())
    }

    /// Sorted snapshot of every job id.
    pub async fn list_ids(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state.jobs.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn index_prompt_id(&self, prompt_id: &str, job_id: &str) {
        self.state.lock().await.index_prompt(prompt_id, job_id);
    }

    pub async fn resolve_prompt_id(&self, prompt_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .resolve_prompt(prompt_id)
            .map(str::to_string)
    }

    pub async fn running_guess(&self) -> RunningGuess {
        self.state.lock().await.running.clone()
    }

    /// Run `f` with exclusive access to the table.
    pub async fn transaction<R>(&self, f: impl FnOnce(&mut TableState) -> R) -> R {
        let mut state = self.state.lock().await;
        f(&mut state)
    }
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TableState {
    pub fn job(&self, job_id: &str) -> Option<&JobRecord> {
        self.jobs.get(job_id)
    }

    pub fn job_mut(&mut self, job_id: &str) -> Option<&mut JobRecord> {
        self.jobs.get_mut(job_id)
    }

    pub fn jobs_mut(&mut self) -> impl Iterator<Item = &mut JobRecord> {
        self.jobs.values_mut()
    }

    pub fn index_prompt(&mut self, prompt_id: &str, job_id: &str) {
        self.prompt_index
            .insert(prompt_id.to_string(), job_id.to_string());
    }

    /// The job a prompt id was submitted for. Prompts submitted by anyone
    /// else resolve to `None`.
    pub fn resolve_prompt(&self, prompt_id: &str) -> Option<&str> {
        self.prompt_index.get(prompt_id).map(String::as_str)
    }

    pub fn job_for_prompt_mut(&mut self, prompt_id: &str) -> Option<&mut JobRecord> {
        let job_id = self.prompt_index.get(prompt_id)?;
        self.jobs.get_mut(job_id)
    }

    pub fn running_guess_mut(&mut self) -> &mut RunningGuess {
        &mut self.running
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use assert_matches::assert_matches;

    use super::*;

    fn new_job(job_id: &str) -> NewJob {
        NewJob {
            job_id: job_id.to_string(),
            workflow: Arc::new(serde_json::json!({})),
            important: BTreeSet::new(),
            debug_path: None,
        }
    }

    #[tokio::test]
    async fn create_and_get() {
        let table = JobTable::new();
        let future = table.create(new_job("render-1")).await.unwrap();
        assert_eq!(future.job_id(), "render-1");

        let (status, _) = table.get("render-1").await.unwrap();
        assert!(status.scheduled.is_some());
        assert!(!status.is_done());
    }

    #[tokio::test]
    async fn duplicate_job_id_is_rejected() {
        let table = JobTable::new();
        table.create(new_job("render-1")).await.unwrap();
        let err = table.create(new_job("render-1")).await.unwrap_err();
        assert_matches!(err, CatapultError::DuplicateJobId(id) if id == "render-1");
    }

    #[tokio::test]
    async fn non_slug_job_id_is_rejected() {
        let table = JobTable::new();
        let err = table.create(new_job("Render 1")).await.unwrap_err();
        assert_matches!(err, CatapultError::InvalidJobId(_));
        assert!(table.list_ids().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let table = JobTable::new();
        assert_matches!(table.get("nope").await, Err(CatapultError::JobNotFound(_)));
        assert_matches!(
            table.exceptions("nope").await,
            Err(CatapultError::JobNotFound(_))
        );
    }

    #[tokio::test]
    async fn list_ids_is_sorted() {
        let table = JobTable::new();
        for id in ["c", "a", "b"] {
            table.create(new_job(id)).await.unwrap();
        }
        assert_eq!(table.list_ids().await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn prompt_index_routes_known_prompts_only() {
        let table = JobTable::new();
        table.create(new_job("render-1")).await.unwrap();
        table.index_prompt_id("p1", "render-1").await;

        assert_eq!(table.resolve_prompt_id("p1").await.as_deref(), Some("render-1"));
        assert_eq!(table.resolve_prompt_id("someone-else").await, None);

        let found = table
            .transaction(|state| state.job_for_prompt_mut("p1").map(|j| j.job_id().to_string()))
            .await;
        assert_eq!(found.as_deref(), Some("render-1"));
    }

    #[tokio::test]
    async fn transaction_mutates_under_lock() {
        let table = JobTable::new();
        table.create(new_job("render-1")).await.unwrap();

        let now = Utc::now();
        let changed = table
            .transaction(|state| {
                state
                    .running_guess_mut()
                    .set_job(Some("render-1".to_string()), None, now);
                state.job_mut("render-1").map(|job| job.mark_running(now))
            })
            .await;
        assert_eq!(changed, Some(true));

        let (status, _) = table.get("render-1").await.unwrap();
        assert_eq!(status.running, Some(now));
        assert_eq!(table.running_guess().await.job_id.as_deref(), Some("render-1"));
    }
}
