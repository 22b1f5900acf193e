//! `catapult-worker` -- submit one ComfyUI workflow and wait for it.
//!
//! Reads an API-format workflow from disk, submits it through a
//! [`Catapult`] instance, and prints the produced outputs as JSON once
//! the job succeeds. Ctrl-C cancels the job on the server before exiting.
//!
//! # Environment variables
//!
//! | Variable          | Required | Default        | Description                              |
//! |-------------------|----------|----------------|------------------------------------------|
//! | `COMFY_API_URL`   | yes      | --             | ComfyUI base URL, e.g. `http://host:8188` |
//! | `WORKFLOW_PATH`   | yes      | --             | Path to an API-format workflow JSON file  |
//! | `JOB_ID`          | no       | random slug    | Job id to track the submission under      |
//! | `IMPORTANT_NODES` | no       | --             | Comma-separated node ids that must produce output |
//!
//! Scheduler settings (`CATAPULT_*`) are read by [`CatapultConfig::from_env`].

use std::sync::Arc;

use anyhow::Context;
use catapult_comfyui::engine::ComfyUIEngine;
use catapult_core::naming::slugify;
use catapult_jobs::{Catapult, CatapultConfig, SubmitRequest};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "catapult_worker=info,catapult_jobs=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let api_url = required("COMFY_API_URL")?;
    let workflow_path = required("WORKFLOW_PATH")?;
    let job_id = std::env::var("JOB_ID")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| slugify(&uuid::Uuid::new_v4().to_string()));
    let important = important_nodes(std::env::var("IMPORTANT_NODES").ok().as_deref());

    let body = tokio::fs::read(&workflow_path)
        .await
        .with_context(|| format!("reading workflow from {workflow_path}"))?;
    let workflow: serde_json::Value = serde_json::from_slice(&body)
        .with_context(|| format!("parsing workflow in {workflow_path}"))?;

    let config = CatapultConfig::from_env();
    tracing::info!(
        job_id = %job_id,
        workflow = %workflow_path,
        important = ?important,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        "Starting catapult-worker",
    );

    let engine = Arc::new(ComfyUIEngine::new(&api_url));
    let catapult = Catapult::start(engine, config);

    let (status, future) = catapult
        .submit(SubmitRequest::new(job_id.clone(), workflow).important(important))
        .await
        .context("submitting workflow")?;
    tracing::info!(
        job_id = %job_id,
        prompt_id = status.prompt_id().unwrap_or_default(),
        "Workflow submitted",
    );

    let outcome = tokio::select! {
        result = future.wait() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    let result = match outcome {
        Some(result) => result,
        None => {
            tracing::info!(job_id = %job_id, "Interrupted, cancelling job");
            catapult.cancel_job(&job_id).await?;
            catapult.close().await?;
            return Ok(());
        }
    };

    let closed = catapult.close().await;
    let entry = result.with_context(|| format!("job {job_id} did not succeed"))?;
    closed?;

    let outputs = entry.outputs.unwrap_or_default();
    println!("{}", serde_json::to_string_pretty(&outputs)?);
    tracing::info!(job_id = %job_id, outputs = outputs.len(), "Job finished");
    Ok(())
}

fn required(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("{name} environment variable is required"))
}

/// Parse a comma-separated node list, skipping blanks.
fn important_nodes(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|node| !node.is_empty())
        .map(str::to_string)
        .collect()
}
