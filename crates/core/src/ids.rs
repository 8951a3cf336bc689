//! Job identifier generation and validation.

use crate::error::CoreError;
use crate::types::JobId;

/// Length of the random suffix appended to temporary ids.
const SUFFIX_LEN: usize = 8;

/// Generate a client-side temporary job id.
///
/// Format: `{unix_millis}-{8 hex chars}`. The conversion endpoint may
/// echo this id back or replace it with its own.
pub fn temporary_job_id() -> JobId {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{millis}-{}", &suffix[..SUFFIX_LEN])
}

/// Check that a job id can be interpolated into a topic name.
///
/// Rejects empty ids and ids containing control characters (STOMP
/// frames are line-oriented and NUL-terminated).
pub fn validate_job_id(job_id: &str) -> Result<(), CoreError> {
    if job_id.is_empty() {
        return Err(CoreError::Validation(
            "No job id provided for tracking".into(),
        ));
    }
    if job_id.chars().any(char::is_control) {
        return Err(CoreError::Validation(format!(
            "Job id {job_id:?} contains control characters"
        )));
    }
    Ok(())
}
