//! Topic and URL naming conventions shared with the conversion backend.
//!
//! Progress for a job is published on `/topic/conversion/{job_id}`. The
//! message-bus endpoint and converted-file downloads hang off the API
//! host with the `/api` path segment removed.

use crate::error::CoreError;

/// Prefix of every conversion progress topic.
pub const CONVERSION_TOPIC_PREFIX: &str = "/topic/conversion/";

/// Path of the message-bus endpoint relative to the backend base URL.
pub const BUS_ENDPOINT_PATH: &str = "/ws-endpoint";

/// Path of converted-file downloads relative to the backend base URL.
pub const CONVERTED_FILES_PATH: &str = "/api/admin/files/converted/";

/// Build the progress topic for a job id.
///
/// Plain interpolation; no escaping is applied.
///
/// ```
/// use bitzomax_core::naming::conversion_topic;
///
/// assert_eq!(conversion_topic("job-1"), "/topic/conversion/job-1");
/// ```
pub fn conversion_topic(job_id: &str) -> String {
    format!("{CONVERSION_TOPIC_PREFIX}{job_id}")
}

/// Extract the job id from a conversion topic, if it is one.
pub fn job_id_from_topic(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(CONVERSION_TOPIC_PREFIX)
        .filter(|id| !id.is_empty())
}

/// Strip the `/api` path segment (and anything after it) from an API URL.
///
/// `http://host:8080/api` and `http://host:8080/api/v1` both become
/// `http://host:8080`. URLs without an `/api` segment are returned with
/// any trailing slash removed.
pub fn backend_base_url(api_url: &str) -> Result<&str, CoreError> {
    let trimmed = api_url.trim_end_matches('/');
    if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
        return Err(CoreError::InvalidUrl(api_url.to_string()));
    }

    let mut search_from = 0;
    while let Some(offset) = trimmed[search_from..].find("/api") {
        let start = search_from + offset;
        let rest = &trimmed[start + "/api".len()..];
        if rest.is_empty() || rest.starts_with('/') {
            return Ok(&trimmed[..start]);
        }
        search_from = start + "/api".len();
    }
    Ok(trimmed)
}

/// Derive the message-bus endpoint from the API URL.
///
/// ```
/// use bitzomax_core::naming::bus_endpoint_from_api_url;
///
/// assert_eq!(
///     bus_endpoint_from_api_url("http://localhost:8080/api").unwrap(),
///     "http://localhost:8080/ws-endpoint",
/// );
/// ```
pub fn bus_endpoint_from_api_url(api_url: &str) -> Result<String, CoreError> {
    Ok(format!("{}{BUS_ENDPOINT_PATH}", backend_base_url(api_url)?))
}

/// URL from which a converted file can be downloaded.
pub fn converted_file_url(api_url: &str, file_name: &str) -> Result<String, CoreError> {
    Ok(format!(
        "{}{CONVERTED_FILES_PATH}{file_name}",
        backend_base_url(api_url)?
    ))
}

/// File name to save a converted file under.
///
/// With an original name, keeps its stem and takes the converted file's
/// extension (`clip.mov` + `abc.webm` -> `clip.webm`). Without one, the
/// converted name is used unchanged.
pub fn download_file_name(converted: &str, original: Option<&str>) -> String {
    let Some(original) = original else {
        return converted.to_string();
    };
    let extension = converted.rfind('.').map(|i| &converted[i..]).unwrap_or("");
    let stem = original.rfind('.').map(|i| &original[..i]).unwrap_or(original);
    format!("{stem}{extension}")
}
