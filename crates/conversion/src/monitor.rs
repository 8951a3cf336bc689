//! Observable conversion state for UI callers.
//!
//! [`ConversionMonitor`] folds the tracker's callbacks into one
//! [`ConversionState`] value published on a `tokio::sync::watch` channel,
//! so a caller can either poll [`ConversionMonitor::state`] or await
//! changes on a receiver.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::watch;

use crate::session::TrackingCallbacks;
use crate::tracker::{ConversionTracker, TrackerError, TrackingHandle, CONNECT_FAILED_MESSAGE};

/// Coarse status shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversionStatus {
    Idle,
    Connecting,
    Tracking,
    Completed,
    Error,
}

/// Snapshot of one monitored conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionState {
    pub status: ConversionStatus,
    /// 0 to 100.
    pub progress: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConversionState {
    pub fn idle(message: &str) -> Self {
        Self {
            status: ConversionStatus::Idle,
            progress: 0,
            message: message.to_string(),
            result_file: None,
            error: None,
        }
    }
}

impl Default for ConversionState {
    fn default() -> Self {
        Self::idle("Not started")
    }
}

struct Shared {
    tx: watch::Sender<ConversionState>,
    /// Bumped by `start` and `disconnect`; callbacks from older sessions
    /// are ignored.
    generation: AtomicU64,
}

impl Shared {
    /// Apply `update` if `generation` is still current.
    fn update(&self, generation: u64, update: impl FnOnce(&mut ConversionState)) {
        self.tx.send_if_modified(|state| {
            if self.generation.load(Ordering::Acquire) != generation {
                return false;
            }
            let before = state.clone();
            update(state);
            *state != before
        });
    }
}

/// Single-job projection of the tracker into a [`ConversionState`].
pub struct ConversionMonitor {
    tracker: ConversionTracker,
    shared: Arc<Shared>,
    current: Mutex<Option<TrackingHandle>>,
}

impl ConversionMonitor {
    pub fn new(tracker: ConversionTracker) -> Self {
        let (tx, _) = watch::channel(ConversionState::default());
        Self {
            tracker,
            shared: Arc::new(Shared {
                tx,
                generation: AtomicU64::new(0),
            }),
            current: Mutex::new(None),
        }
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<TrackingHandle>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConversionState {
        self.shared.tx.borrow().clone()
    }

    /// Receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<ConversionState> {
        self.shared.tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.tracker.manager().is_connected()
    }

    /// Job id currently monitored, following identifier switches.
    pub fn job_id(&self) -> Option<String> {
        self.lock_current().as_ref().map(TrackingHandle::job_id)
    }

    /// Start monitoring `job_id`, replacing whatever was monitored before.
    ///
    /// Resets the state, including progress.
    pub async fn start(&self, job_id: &str) {
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(previous) = self.lock_current().take() {
            previous.cancel();
        }

        let status = if self.is_connected() {
            ConversionStatus::Tracking
        } else {
            ConversionStatus::Connecting
        };
        self.shared.tx.send_replace(ConversionState {
            status,
            progress: 0,
            message: "Starting tracking...".to_string(),
            result_file: None,
            error: None,
        });

        let handle = self
            .tracker
            .track(job_id, self.callbacks(generation))
            .await;

        let mut current = self.lock_current();
        if self.shared.generation.load(Ordering::Acquire) != generation {
            drop(current);
            handle.cancel();
            return;
        }
        if handle.is_active() {
            self.shared.update(generation, |state| {
                if state.status == ConversionStatus::Connecting {
                    state.status = ConversionStatus::Tracking;
                }
            });
        }
        *current = Some(handle);
    }

    /// Follow the monitored job to a server-assigned id.
    pub fn switch_identifier(&self, old_job_id: &str, new_job_id: &str) -> Result<(), TrackerError> {
        self.tracker.switch_identifier(old_job_id, new_job_id)
    }

    /// Stop monitoring. Progress is kept.
    pub fn cancel(&self) {
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let Some(handle) = self.lock_current().take() else {
            return;
        };
        handle.cancel();
        self.shared.update(generation, |state| {
            if matches!(
                state.status,
                ConversionStatus::Connecting | ConversionStatus::Tracking
            ) {
                state.status = ConversionStatus::Idle;
                state.message = "Tracking cancelled".to_string();
            }
        });
    }

    /// Connect the shared bus. Returns whether it is connected.
    pub async fn connect(&self) -> bool {
        if self.is_connected() {
            return true;
        }
        let generation = self.shared.generation.load(Ordering::Acquire);
        self.shared.update(generation, |state| {
            if state.status == ConversionStatus::Idle {
                state.status = ConversionStatus::Connecting;
                state.message = "Connecting...".to_string();
            }
        });

        let connected = self.tracker.manager().connect(None).await;
        self.shared.update(generation, |state| {
            if state.status != ConversionStatus::Connecting {
                return;
            }
            if connected {
                state.status = ConversionStatus::Idle;
                state.message = "Connected".to_string();
            } else {
                state.status = ConversionStatus::Error;
                state.message = "Connection failed".to_string();
                state.error = Some(CONNECT_FAILED_MESSAGE.to_string());
            }
        });
        connected
    }

    /// Disconnect the shared bus. Affects every session using it.
    pub fn disconnect(&self) {
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(handle) = self.lock_current().take() {
            handle.cancel();
        }
        self.tracker.disconnect();
        self.shared.update(generation, |state| {
            state.status = ConversionStatus::Idle;
            state.message = "Disconnected".to_string();
            state.result_file = None;
            state.error = None;
        });
    }

    fn callbacks(&self, generation: u64) -> TrackingCallbacks {
        let on_progress = Arc::clone(&self.shared);
        let on_complete = Arc::clone(&self.shared);
        let on_error = Arc::clone(&self.shared);
        TrackingCallbacks::new(
            move |percent, message| {
                on_progress.update(generation, |state| {
                    // Progress after a recoverable error resumes tracking.
                    if state.status != ConversionStatus::Completed {
                        state.status = ConversionStatus::Tracking;
                        state.error = None;
                    }
                    state.progress = state.progress.max(percent);
                    state.message = message.to_string();
                });
            },
            move |result_file| {
                on_complete.update(generation, |state| {
                    state.status = ConversionStatus::Completed;
                    state.progress = 100;
                    state.message = "Conversion completed".to_string();
                    state.result_file = Some(result_file.to_string());
                });
            },
            move |error| {
                on_error.update(generation, |state| {
                    state.status = ConversionStatus::Error;
                    state.message = "Conversion failed".to_string();
                    state.error = Some(error.to_string());
                });
            },
        )
    }
}
