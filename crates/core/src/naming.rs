//! Job identifier naming rules.
//!
//! Job ids are chosen by the caller and double as file names for
//! diagnostic dumps, so they must be normalized slugs: lowercase ASCII
//! letters and digits separated by single hyphens.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::CoreError;

/// Maximum length of a job id in characters.
pub const MAX_JOB_ID_LEN: usize = 128;

/// Regex pattern for a normalized slug.
pub const SLUG_PATTERN: &str = r"^[a-z0-9]+(?:-[a-z0-9]+)*$";

static SLUG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(SLUG_PATTERN).expect("valid regex"));

/// Whether `s` is already a normalized slug.
pub fn is_slug(s: &str) -> bool {
    s.len() <= MAX_JOB_ID_LEN && SLUG_RE.is_match(s)
}

/// Validate a caller-supplied job id.
pub fn validate_job_id(job_id: &str) -> Result<(), CoreError> {
    if job_id.is_empty() {
        return Err(CoreError::Validation("Job id must not be empty".to_string()));
    }
    if job_id.len() > MAX_JOB_ID_LEN {
        return Err(CoreError::Validation(format!(
            "Job id exceeds maximum length of {MAX_JOB_ID_LEN} characters (got {})",
            job_id.len()
        )));
    }
    if !SLUG_RE.is_match(job_id) {
        return Err(CoreError::Validation(format!(
            "Job id '{job_id}' is not a slug (expected e.g. '{}')",
            slugify(job_id)
        )));
    }
    Ok(())
}

/// Normalize arbitrary text into a slug.
///
/// Runs of anything other than ASCII letters and digits collapse into a
/// single hyphen; leading and trailing hyphens are dropped.
///
/// # Examples
///
/// ```
/// use catapult_core::naming::slugify;
///
/// assert_eq!(slugify("Render 1"), "render-1");
/// assert_eq!(slugify("  SDXL / turbo__v2 "), "sdxl-turbo-v2");
/// assert_eq!(slugify("already-a-slug"), "already-a-slug");
/// ```
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_hyphen = false;

    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }

    if slug.len() > MAX_JOB_ID_LEN {
        slug.truncate(MAX_JOB_ID_LEN);
        while slug.ends_with('-') {
            slug.pop();
        }
    }
    slug
}
