//! Conversion orchestration: upload a file and follow its progress.

use std::sync::Arc;

use bitzomax_bus::ConnectionManager;
use bitzomax_core::ids::temporary_job_id;
use bitzomax_core::naming::download_file_name;

use crate::api::{ApiError, ConversionApi, ConversionResponse, MediaUpload};
use crate::config::ClientConfig;
use crate::monitor::ConversionMonitor;
use crate::session::TrackingCallbacks;
use crate::tracker::{
    ConversionTracker, TrackerError, TrackingHandle, CONNECT_FAILED_MESSAGE,
};

/// Errors from [`ConversionService::convert_to_webm`].
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("{}", CONNECT_FAILED_MESSAGE)]
    Connection,

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

/// Result of a successful upload.
#[derive(Debug)]
pub struct ConversionOutcome {
    /// Id the job is tracked under (server id when it differs).
    pub job_id: String,
    pub response: ConversionResponse,
    /// Present when callbacks were supplied.
    pub tracking: Option<TrackingHandle>,
}

/// Uploads media for conversion and tracks it over the message bus.
#[derive(Clone)]
pub struct ConversionService {
    tracker: ConversionTracker,
    api: ConversionApi,
}

impl ConversionService {
    pub fn new(manager: Arc<ConnectionManager>, api: ConversionApi) -> Self {
        Self {
            tracker: ConversionTracker::new(manager),
            api,
        }
    }

    /// Build a service speaking STOMP over WebSocket from configuration.
    pub fn from_config(config: ClientConfig) -> Self {
        let api = ConversionApi::new(config.api_url).with_token(config.api_token);
        Self::new(ConnectionManager::stomp(config.bus), api)
    }

    pub fn tracker(&self) -> &ConversionTracker {
        &self.tracker
    }

    pub fn api(&self) -> &ConversionApi {
        &self.api
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        self.tracker.manager()
    }

    /// A fresh monitor over this service's tracker.
    pub fn monitor(&self) -> ConversionMonitor {
        ConversionMonitor::new(self.tracker.clone())
    }

    /// Upload `upload` for WebM conversion.
    ///
    /// Connects first, tracks the job under a temporary id before the
    /// upload starts so no early progress is missed, then follows the
    /// server-assigned id if the backend returns a different one. Failures
    /// are also reported through `on_error` when callbacks are given.
    pub async fn convert_to_webm(
        &self,
        upload: MediaUpload,
        callbacks: Option<TrackingCallbacks>,
    ) -> Result<ConversionOutcome, ConversionError> {
        let manager = self.tracker.manager();
        tracing::info!(file_name = %upload.file_name, "Starting WebM conversion");

        if !manager.is_connected() && !manager.connect(None).await {
            let err = ConversionError::Connection;
            report(&callbacks, &err);
            return Err(err);
        }

        let temporary_id = temporary_job_id();
        let tracking = match &callbacks {
            Some(callbacks) => Some(self.tracker.track(&temporary_id, callbacks.clone()).await),
            None => None,
        };

        tracing::debug!(job_id = %temporary_id, "Uploading file for conversion");
        let response = match self.api.convert_to_webm(upload, &temporary_id).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(job_id = %temporary_id, error = %e, "Conversion upload failed");
                if let Some(handle) = &tracking {
                    handle.cancel();
                }
                let err = ConversionError::Api(e);
                report(&callbacks, &err);
                return Err(err);
            }
        };

        let mut job_id = temporary_id.clone();
        if let Some(server_id) = response.file_id.as_deref().filter(|id| *id != temporary_id) {
            job_id = server_id.to_string();
            if tracking.as_ref().is_some_and(TrackingHandle::is_active) {
                match self.tracker.switch_identifier(&temporary_id, server_id) {
                    Ok(()) => {}
                    Err(TrackerError::SessionFinished(_)) => {
                        tracing::debug!(job_id = %temporary_id, "Session finished before id switch");
                    }
                    Err(e) => {
                        tracing::warn!(
                            old_job_id = %temporary_id,
                            new_job_id = %server_id,
                            error = %e,
                            "Failed to follow server job id",
                        );
                    }
                }
            }
        }

        tracing::info!(job_id = %job_id, "Conversion accepted");
        Ok(ConversionOutcome {
            job_id,
            response,
            tracking,
        })
    }

    /// Drop the connection and connect again. Sessions tracked over the
    /// old connection are cancelled.
    pub async fn retry_connection(&self) -> bool {
        self.tracker.disconnect();
        self.tracker.manager().connect(None).await
    }

    /// Download URL of a converted file.
    pub fn download_url(&self, file_name: &str) -> Result<String, ApiError> {
        self.api.converted_file_url(file_name)
    }

    /// Fetch a converted file, returning the name to save it under and its
    /// bytes.
    pub async fn download_converted(
        &self,
        file_name: &str,
        original_file_name: Option<&str>,
    ) -> Result<(String, Vec<u8>), ApiError> {
        let bytes = self.api.download_converted(file_name).await?;
        Ok((download_file_name(file_name, original_file_name), bytes))
    }
}

fn report(callbacks: &Option<TrackingCallbacks>, err: &ConversionError) {
    if let Some(callbacks) = callbacks {
        (callbacks.on_error)(&err.to_string());
    }
}
