//! End-to-end job lifecycles against an in-memory engine.
//!
//! Each test starts a real `Catapult` with a short poll interval and
//! scripts the `MockEngine` to walk a job through ComfyUI's queue and
//! history.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use catapult_jobs::debug::status_dump_path;
use catapult_jobs::{
    Catapult, CatapultConfig, CatapultError, JobError, JobFuture, JobPhase, JobStatus,
    SubmitRequest,
};
use catapult_test_utils::{fixtures, init_test_logging, MockEngine};

fn fast_config() -> CatapultConfig {
    CatapultConfig {
        poll_interval: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

fn start() -> (Arc<MockEngine>, Arc<Catapult>) {
    init_test_logging();
    let engine = Arc::new(MockEngine::new());
    let catapult = Catapult::start(engine.clone(), fast_config());
    (engine, catapult)
}

/// Poll the job's status until `done` holds or two seconds pass.
async fn wait_for_status(
    catapult: &Catapult,
    job_id: &str,
    done: impl Fn(&JobStatus) -> bool,
) -> JobStatus {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let (status, _) = catapult.get_status(job_id).await.unwrap();
        if done(&status) {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {job_id}, last status: {status:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// The mock numbers its tickets, so the first submission is always
/// `prompt-1`. Tests script the engine before submitting so the poll loop
/// never sees the job in an unplanned state.
const PROMPT_ID: &str = "prompt-1";

async fn submit_render(catapult: &Catapult) -> JobFuture {
    let (status, future) = catapult
        .submit(SubmitRequest::new("render-1", fixtures::workflow()).important(["9"]))
        .await
        .unwrap();
    assert_eq!(status.prompt_id(), Some(PROMPT_ID));
    future
}

// ---------------------------------------------------------------------------
// Test: a job moves through the queue and succeeds
// ---------------------------------------------------------------------------

#[tokio::test]
async fn job_runs_to_success() {
    let (engine, catapult) = start();
    engine.set_queue(&[], &[PROMPT_ID]);
    let future = submit_render(&catapult).await;
    wait_for_status(&catapult, "render-1", |s| s.pending.is_some()).await;

    engine.set_queue(&[PROMPT_ID], &[]);
    wait_for_status(&catapult, "render-1", |s| s.running.is_some()).await;

    // History first, so the job is never seen out of the queue without it.
    engine.set_history(PROMPT_ID, fixtures::history_entry(PROMPT_ID, &["9"], &["9"]));
    engine.set_queue(&[], &[]);

    let entry = tokio::time::timeout(Duration::from_secs(2), future.wait())
        .await
        .expect("job should finish")
        .unwrap();
    assert!(entry.has_output("9"));

    let (status, _) = catapult.get_status("render-1").await.unwrap();
    assert_eq!(status.phase(), JobPhase::Success);
    assert!(status.job_history.is_some());
    assert!(status.errored.is_none());
    assert!(status.cancelled.is_none());
    assert!(status.queue_check.is_some());
    assert!(status.system_stats_check.is_some());

    catapult.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Test: a missing important output fails the job with its node title
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_important_output_fails_job() {
    let (engine, catapult) = start();
    engine.set_history(PROMPT_ID, fixtures::history_entry(PROMPT_ID, &["9"], &[]));
    let future = submit_render(&catapult).await;

    let err = tokio::time::timeout(Duration::from_secs(2), future.wait())
        .await
        .expect("job should finish")
        .unwrap_err();
    assert_matches!(
        err,
        JobError::NodesNotExecuted { nodes, titles }
            if nodes == vec!["9".to_string()] && titles == vec![Some("Save Image".to_string())]
    );

    let errors = catapult.get_exceptions("render-1").await.unwrap();
    assert!(errors.iter().any(|e| e.kind == "nodes_not_executed"));
    let (status, _) = catapult.get_status("render-1").await.unwrap();
    assert_eq!(status.phase(), JobPhase::Errored);
    assert!(status.job_history.is_some());

    catapult.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Test: unimportant missing outputs are tolerated
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_unimportant_output_still_succeeds() {
    let (engine, catapult) = start();
    engine.set_history(
        PROMPT_ID,
        fixtures::history_entry(PROMPT_ID, &["9", "12"], &["9"]),
    );
    let future = submit_render(&catapult).await;

    let result = tokio::time::timeout(Duration::from_secs(2), future.wait())
        .await
        .expect("job should finish");
    assert_matches!(result, Ok(_));

    catapult.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Test: ComfyUI reporting a failed execution fails the job
// ---------------------------------------------------------------------------

#[tokio::test]
async fn engine_failure_fails_job() {
    let (engine, catapult) = start();
    engine.set_history(
        PROMPT_ID,
        fixtures::failed_history_entry(PROMPT_ID, "3", "CUDA out of memory"),
    );
    let future = submit_render(&catapult).await;

    let err = tokio::time::timeout(Duration::from_secs(2), future.wait())
        .await
        .expect("job should finish")
        .unwrap_err();
    assert_matches!(err, JobError::JobFailed { notes } if notes[0].contains("CUDA out of memory"));

    catapult.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Test: a job that disappears from queue and history is reported vanished
// ---------------------------------------------------------------------------

#[tokio::test]
async fn vanished_job_errors_and_dumps_status() {
    init_test_logging();
    let dump_dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MockEngine::new());
    let catapult = Catapult::start(
        engine.clone(),
        CatapultConfig {
            debug_path: Some(dump_dir.path().to_path_buf()),
            ..fast_config()
        },
    );
    let future = submit_render(&catapult).await;

    let err = tokio::time::timeout(Duration::from_secs(2), future.wait())
        .await
        .expect("job should finish")
        .unwrap_err();
    assert_matches!(err, JobError::JobVanished { prompt_id } if prompt_id == PROMPT_ID);
    // It took at least two history lookups to decide.
    assert!(engine.history_requests() >= 2);

    let dump = status_dump_path(dump_dir.path(), "render-1");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !dump.exists() {
        assert!(tokio::time::Instant::now() < deadline, "no status dump written");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let body = tokio::fs::read(&dump).await.unwrap();
    let dumped: JobStatus = serde_json::from_slice(&body).unwrap();
    assert_eq!(dumped.phase(), JobPhase::Errored);

    catapult.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Test: a rejected submission fails immediately and is never polled
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rejected_submission_is_not_tracked_remotely() {
    let (engine, catapult) = start();
    engine.push_ticket(fixtures::rejected_ticket("4"));

    let err = catapult
        .submit(SubmitRequest::new("render-1", fixtures::workflow()).important(["9"]))
        .await
        .unwrap_err();
    let rejection = match err {
        CatapultError::WorkflowSubmission(rejection) => rejection,
        other => panic!("expected a submission error, got {other:?}"),
    };
    assert!(rejection.summary.contains("Value not in list"));
    assert_eq!(rejection.workflow.as_ref(), &fixtures::workflow());

    let (status, future) = catapult.get_status("render-1").await.unwrap();
    assert_eq!(status.phase(), JobPhase::Errored);
    assert!(status.engine_scheduled.is_none());
    assert_matches!(future.await, Err(JobError::WorkflowSubmission(_)));

    // A few poll passes later the job is untouched.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.history_requests(), 0);
    assert_eq!(catapult.get_exceptions("render-1").await.unwrap().len(), 1);

    catapult.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Test: prompts from other clients do not affect tracked jobs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn foreign_prompts_are_ignored() {
    let (engine, catapult) = start();
    engine.set_queue(&["someone-else"], &[PROMPT_ID]);
    let _future = submit_render(&catapult).await;

    let status = wait_for_status(&catapult, "render-1", |s| s.pending.is_some()).await;
    assert!(status.running.is_none());
    assert_eq!(catapult.list_jobs().await.unwrap(), vec!["render-1"]);
    assert_eq!(engine.history_requests(), 0);

    catapult.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Test: cancel racing with completion yields exactly one outcome
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_racing_success_has_one_outcome() {
    let (engine, catapult) = start();
    engine.set_queue(&[PROMPT_ID], &[]);
    let future = submit_render(&catapult).await;
    wait_for_status(&catapult, "render-1", |s| s.running.is_some()).await;

    engine.set_history(PROMPT_ID, fixtures::history_entry(PROMPT_ID, &["9"], &["9"]));
    engine.set_queue(&[], &[]);
    let (cancelled, result) = tokio::join!(catapult.cancel_job("render-1"), future.wait());
    cancelled.unwrap();

    let (status, _) = catapult.get_status("render-1").await.unwrap();
    let outcomes = [status.success, status.errored, status.cancelled]
        .iter()
        .filter(|t| t.is_some())
        .count();
    assert_eq!(outcomes, 1);
    match status.phase() {
        JobPhase::Success => assert_matches!(result, Ok(_)),
        JobPhase::Cancelled => assert_matches!(result, Err(JobError::Cancelled)),
        other => panic!("unexpected phase {other:?}"),
    }

    catapult.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Test: cancelling a pending job removes it from the queue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_pending_job_deletes_from_queue() {
    let (engine, catapult) = start();
    engine.set_queue(&[], &[PROMPT_ID]);
    let future = submit_render(&catapult).await;
    wait_for_status(&catapult, "render-1", |s| s.pending.is_some()).await;

    catapult.cancel_job("render-1").await.unwrap();

    assert_matches!(future.await, Err(JobError::Cancelled));
    assert_eq!(engine.deleted_prompt_ids(), vec![PROMPT_ID.to_string()]);
    // Interrupt is untargeted and sent whenever the job may be remote.
    assert_eq!(engine.interrupts(), 1);

    // A late history entry does not revive the job.
    engine.set_history(PROMPT_ID, fixtures::history_entry(PROMPT_ID, &["9"], &["9"]));
    tokio::time::sleep(Duration::from_millis(60)).await;
    let (status, _) = catapult.get_status("render-1").await.unwrap();
    assert_eq!(status.phase(), JobPhase::Cancelled);

    catapult.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Test: a job executing remotely but not yet observed is interrupted
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_interrupts_job_running_before_first_poll() {
    init_test_logging();
    let engine = Arc::new(MockEngine::new());
    let catapult = Catapult::start(
        engine.clone(),
        CatapultConfig {
            // No poll pass before the cancel; the stream stays quiet too.
            poll_interval: Duration::from_secs(3600),
            ..fast_config()
        },
    );
    engine.set_queue(&[PROMPT_ID], &[]);
    let future = submit_render(&catapult).await;

    catapult.cancel_job("render-1").await.unwrap();

    assert_matches!(future.await, Err(JobError::Cancelled));
    assert_eq!(engine.deleted_prompt_ids(), vec![PROMPT_ID.to_string()]);
    assert_eq!(engine.interrupts(), 1);
    let (status, _) = catapult.get_status("render-1").await.unwrap();
    assert!(status.running.is_none());
    assert_eq!(status.phase(), JobPhase::Cancelled);

    catapult.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Test: submit_and_wait returns the history entry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_and_wait_returns_history() {
    let (engine, catapult) = start();
    engine.set_history(PROMPT_ID, fixtures::history_entry(PROMPT_ID, &["9"], &["9"]));

    let entry = tokio::time::timeout(
        Duration::from_secs(2),
        catapult.submit_and_wait(SubmitRequest::new("render-1", fixtures::workflow()).important(["9"])),
    )
    .await
    .expect("job should finish")
    .unwrap();
    assert!(entry.has_output("9"));

    catapult.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Test: a dead poll loop is fatal and reported by every call
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dead_background_task_is_reported() {
    let (engine, catapult) = start();
    engine.fail_history(true);
    let _future = submit_render(&catapult).await;
    // A failed history lookup leaves a diagnostic behind before the crash.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while catapult.get_exceptions("render-1").await.unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "no history error recorded");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    engine.panic_on_queue(true);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while catapult.check_health().is_ok() {
        assert!(tokio::time::Instant::now() < deadline, "poll loop never died");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_matches!(
        catapult
            .submit(SubmitRequest::new("render-1", fixtures::workflow()))
            .await,
        Err(CatapultError::Background(_))
    );
    assert_matches!(catapult.list_jobs().await, Err(CatapultError::Background(_)));
    // Diagnostics stay readable after the crash.
    let errors = catapult.get_exceptions("render-1").await.unwrap();
    assert!(errors.iter().any(|e| e.kind == "history_check"));
    assert_matches!(catapult.close().await, Err(CatapultError::Background(reason)) if reason.contains("poll_loop"));
}

// ---------------------------------------------------------------------------
// Test: invalid job ids are rejected before anything is submitted
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_job_id_is_rejected() {
    let (engine, catapult) = start();

    let err = catapult
        .submit(SubmitRequest::new("Render 1", fixtures::workflow()))
        .await
        .unwrap_err();
    assert_matches!(err, CatapultError::InvalidJobId(_));
    assert!(engine.submitted_client_ids().is_empty());

    catapult.close().await.unwrap();
}
