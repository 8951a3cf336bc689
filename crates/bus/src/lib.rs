//! Message-bus client for conversion progress topics.
//!
//! Provides a STOMP frame codec, a WebSocket transport, a shared
//! [`ConnectionManager`] with single-flight connect and bounded
//! exponential-backoff reconnection, and the [`SubscriptionRegistry`]
//! that keeps at most one live subscription per job id.

pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod manager;
pub mod processor;
pub mod reconnect;
pub mod registry;
pub mod testing;
pub mod transport;

pub use config::BusConfig;
pub use error::BusError;
pub use manager::{ConnectionManager, ConnectionState};
pub use registry::{Delivery, MessageHandler, SubscriptionHandle, SubscriptionRegistry};
pub use transport::{BusConnector, BusLink, LinkCommand, LinkEvent};
