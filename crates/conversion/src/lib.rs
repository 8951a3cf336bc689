//! Conversion progress tracking over the message bus.
//!
//! [`ConversionTracker`] follows jobs by id and reports through callbacks,
//! [`ConversionMonitor`] projects one job into an observable state value,
//! and [`ConversionService`] ties tracking to the upload endpoint.

pub mod api;
pub mod config;
pub mod messages;
pub mod monitor;
pub mod service;
pub mod session;
pub mod tracker;

pub use api::{ApiError, ConversionApi, ConversionResponse, MediaUpload};
pub use config::{ClientConfig, ConfigError};
pub use messages::{decode_progress, DecodeError, ProgressEvent};
pub use monitor::{ConversionMonitor, ConversionState, ConversionStatus};
pub use service::{ConversionError, ConversionOutcome, ConversionService};
pub use session::{SessionState, TrackingCallbacks, TrackingSession};
pub use tracker::{ConversionTracker, TrackerError, TrackingHandle};
