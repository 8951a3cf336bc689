use std::time::Duration;

use crate::frame::HeartBeat;
use crate::reconnect::ReconnectConfig;

/// Endpoint used when neither the caller nor the config names one.
pub const DEFAULT_ENDPOINT: &str = "http://localhost:8080/ws-endpoint";

/// Budget for a single connect attempt, handshake included.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Heart-beat interval requested in both directions.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(4000);

/// Settings for the [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// SockJS-style base URL, e.g. `http://host:8080/ws-endpoint`.
    pub endpoint: String,
    pub connect_timeout: Duration,
    pub heart_beat: HeartBeat,
    pub reconnect: ReconnectConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heart_beat: HeartBeat::new(DEFAULT_HEARTBEAT, DEFAULT_HEARTBEAT),
            reconnect: ReconnectConfig::default(),
        }
    }
}
