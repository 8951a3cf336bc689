use std::time::Duration;

use bitzomax_bus::config::DEFAULT_ENDPOINT;
use bitzomax_bus::frame::HeartBeat;
use bitzomax_bus::reconnect::ReconnectConfig;
use bitzomax_bus::BusConfig;
use bitzomax_core::naming::bus_endpoint_from_api_url;

/// API URL used when `API_URL` is unset.
pub const DEFAULT_API_URL: &str = "http://localhost:8080/api";

/// Errors from loading [`ClientConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a valid {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Client configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base API URL, e.g. `http://localhost:8080/api`.
    pub api_url: String,
    /// Bearer token for the REST endpoints.
    pub api_token: Option<String>,
    pub bus: BusConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_token: None,
            bus: BusConfig {
                endpoint: derive_endpoint(DEFAULT_API_URL),
                ..BusConfig::default()
            },
        }
    }
}

impl ClientConfig {
    /// Load a `.env` file if present, then read the environment.
    pub fn from_dotenv() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                          | Default                          |
    /// |----------------------------------|----------------------------------|
    /// | `API_URL`                        | `http://localhost:8080/api`      |
    /// | `API_TOKEN`                      | none                             |
    /// | `BUS_ENDPOINT`                   | derived from `API_URL`           |
    /// | `BUS_CONNECT_TIMEOUT_SECS`       | `10`                             |
    /// | `BUS_HEARTBEAT_MS`               | `4000`                           |
    /// | `BUS_RECONNECT_MAX_ATTEMPTS`     | `10`                             |
    /// | `BUS_RECONNECT_INITIAL_DELAY_MS` | `2000`                           |
    /// | `BUS_RECONNECT_MAX_DELAY_SECS`   | `30`                             |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_url = var("API_URL").unwrap_or_else(|| DEFAULT_API_URL.into());
        let api_token = var("API_TOKEN");
        let endpoint = var("BUS_ENDPOINT").unwrap_or_else(|| derive_endpoint(&api_url));

        let connect_timeout_secs: u64 = parse(&var, "BUS_CONNECT_TIMEOUT_SECS", 10, "u64")?;
        let heartbeat_ms: u64 = parse(&var, "BUS_HEARTBEAT_MS", 4000, "u64")?;
        let max_attempts: u32 = parse(&var, "BUS_RECONNECT_MAX_ATTEMPTS", 10, "u32")?;
        let initial_delay_ms: u64 = parse(&var, "BUS_RECONNECT_INITIAL_DELAY_MS", 2000, "u64")?;
        let max_delay_secs: u64 = parse(&var, "BUS_RECONNECT_MAX_DELAY_SECS", 30, "u64")?;

        let heartbeat = Duration::from_millis(heartbeat_ms);
        let bus = BusConfig {
            endpoint,
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            heart_beat: HeartBeat::new(heartbeat, heartbeat),
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(initial_delay_ms),
                max_delay: Duration::from_secs(max_delay_secs),
                max_attempts,
                ..ReconnectConfig::default()
            },
        };

        Ok(Self {
            api_url,
            api_token,
            bus,
        })
    }
}

fn parse<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    match var(name) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
            var: name,
            expected,
            value,
        }),
    }
}

fn derive_endpoint(api_url: &str) -> String {
    match bus_endpoint_from_api_url(api_url) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            tracing::warn!(api_url, error = %e, "Cannot derive bus endpoint, using default");
            DEFAULT_ENDPOINT.to_string()
        }
    }
}
