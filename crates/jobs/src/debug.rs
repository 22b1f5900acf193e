//! Diagnostic dumps of failed jobs.

use std::path::{Path, PathBuf};

use crate::status::JobStatus;

/// File a job's status is dumped to inside `dir`.
pub fn status_dump_path(dir: &Path, job_id: &str) -> PathBuf {
    dir.join(format!("{job_id}.status.json"))
}

/// Write `status` as pretty JSON to `{dir}/{job_id}.status.json`,
/// creating `dir` if needed.
pub async fn write_status_dump(
    dir: &Path,
    job_id: &str,
    status: &JobStatus,
) -> std::io::Result<PathBuf> {
    let body = serde_json::to_vec_pretty(status)?;
    tokio::fs::create_dir_all(dir).await?;
    let path = status_dump_path(dir, job_id);
    tokio::fs::write(&path, body).await?;
    Ok(path)
}

/// [`write_status_dump`], logging instead of failing.
pub(crate) async fn dump_status(dir: &Path, job_id: &str, status: &JobStatus) {
    match write_status_dump(dir, job_id, status).await {
        Ok(path) => {
            tracing::info!(job_id = %job_id, path = %path.display(), "Wrote job status dump")
        }
        Err(e) => {
            tracing::warn!(job_id = %job_id, dir = %dir.display(), error = %e, "Failed to write job status dump")
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::status::ErrorInfo;

    #[tokio::test]
    async fn dump_is_readable_json() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("dumps");

        let now = Utc::now();
        let mut status = JobStatus::new(now);
        status.errored = Some(now);
        status.errors.push(ErrorInfo::new("job_vanished", "gone", now));

        let path = write_status_dump(&nested, "render-1", &status).await.unwrap();
        assert_eq!(path, nested.join("render-1.status.json"));

        let body = tokio::fs::read(&path).await.unwrap();
        let back: JobStatus = serde_json::from_slice(&body).unwrap();
        assert_eq!(back, status);
    }

    #[tokio::test]
    async fn unwritable_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        tokio::fs::write(&file, b"x").await.unwrap();

        let status = JobStatus::new(Utc::now());
        assert!(write_status_dump(&file, "render-1", &status).await.is_err());
    }
}
