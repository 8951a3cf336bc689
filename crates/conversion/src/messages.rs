//! Conversion progress payloads and decoder.
//!
//! The backend publishes JSON of the shape
//! `{"fileId": ..., "percentComplete": 42, "status": "processing", "message": ...}`
//! on `/topic/conversion/{jobId}`. This module decodes it into a typed
//! [`ProgressEvent`], rejecting unknown statuses explicitly.

use serde::Deserialize;

/// Raw progress message as published by the backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub percent_complete: Option<f64>,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub result_file: Option<String>,
}

/// A decoded progress update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Processing { percent: u8, message: String },
    Complete { message: String, result_file: String },
    Error { message: String },
}

impl ProgressEvent {
    /// Whether this event ends the tracking session.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressEvent::Processing { .. })
    }
}

/// Errors from decoding a progress message body.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Error parsing server response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown conversion status: {0}")]
    UnknownStatus(String),

    #[error("Conversion reported complete without a result file")]
    MissingResultFile,
}

/// Clamp a reported percentage into `0..=100`.
pub fn clamp_percent(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 100.0) as u8
}

impl TryFrom<ProgressPayload> for ProgressEvent {
    type Error = DecodeError;

    fn try_from(payload: ProgressPayload) -> Result<Self, DecodeError> {
        let message = payload.message.filter(|m| !m.is_empty());
        match payload.status.as_str() {
            "processing" => {
                let percent = clamp_percent(payload.percent_complete.unwrap_or(0.0));
                Ok(ProgressEvent::Processing {
                    percent,
                    message: message.unwrap_or_else(|| format!("Processing at {percent}%")),
                })
            }
            "complete" => {
                let result_file = payload
                    .result_file
                    .filter(|f| !f.is_empty())
                    .ok_or(DecodeError::MissingResultFile)?;
                Ok(ProgressEvent::Complete {
                    message: message.unwrap_or_else(|| "Conversion complete".to_string()),
                    result_file,
                })
            }
            "error" => Ok(ProgressEvent::Error {
                message: message.unwrap_or_else(|| "Unknown error occurred".to_string()),
            }),
            other => Err(DecodeError::UnknownStatus(other.to_string())),
        }
    }
}

/// Decode a message body into a [`ProgressEvent`].
pub fn decode_progress(body: &str) -> Result<ProgressEvent, DecodeError> {
    let payload: ProgressPayload = serde_json::from_str(body)?;
    ProgressEvent::try_from(payload)
}
