//! Daemon configuration loaded from a TOML file.
//!
//! The path comes from `SONDENOTIFY_CONFIG` (default `config.toml`). Every
//! section is optional except `[[backends]]`; missing sections take the
//! defaults documented in `config.example.toml`.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sondenotify_core::{PolicyConfig, PredictionConfig, StationPosition, TrackerConfig};
use sondenotify_events::{BackendConfig, RetryPolicy, DEFAULT_MAX_IN_FLIGHT};
use validator::Validate;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "SONDENOTIFY_CONFIG";

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Port AutoRX sends payload summaries to by default.
pub const DEFAULT_UDP_PORT: u16 = 55673;

const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// `[listener]`: where payload summaries arrive.
#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
#[serde(default)]
pub struct ListenerConfig {
    /// IP literal (`0.0.0.0`, `::`) or a resolvable host name.
    #[validate(length(min = 1))]
    pub host: String,
    /// `0` picks an ephemeral port.
    pub port: u16,
    /// Capacity of the queue between the listener and the tracker.
    #[validate(range(min = 1, max = 1_000_000))]
    pub queue_capacity: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: DEFAULT_UDP_PORT,
            queue_capacity: 1024,
        }
    }
}

/// `[dispatch]`
#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
#[serde(default)]
pub struct DispatchConfig {
    /// Events delivered at once. Further notifications are dropped with a
    /// warning until a delivery finishes.
    #[validate(range(min = 1, max = 100_000))]
    pub max_in_flight: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "sondenotify=info".into(),
            json: false,
        }
    }
}

/// `[health]`: optional HTTP liveness endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
#[serde(default)]
pub struct HealthConfig {
    /// e.g. `127.0.0.1:8080`. No server is started when unset.
    pub bind: Option<String>,
    /// How long the tracker may take to answer a liveness ping.
    #[validate(range(min = 1, max = 60_000))]
    pub check_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            bind: None,
            check_timeout_ms: 1_000,
        }
    }
}

impl HealthConfig {
    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// DaemonConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    #[validate(nested)]
    pub listener: ListenerConfig,
    /// Receiving station. Required by the distance, elevation and range-ring
    /// filters.
    #[serde(default)]
    #[validate(nested)]
    pub station: Option<StationPosition>,
    #[serde(default)]
    #[validate(nested)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    #[validate(nested)]
    pub prediction: PredictionConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    #[validate(nested)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    #[validate(nested)]
    pub health: HealthConfig,
    /// How long in-flight deliveries may drain on shutdown.
    #[serde(default = "default_shutdown_grace_secs")]
    #[validate(range(max = 600))]
    pub shutdown_grace_secs: u64,
}

fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}

impl DaemonConfig {
    /// Load from the path in `SONDENOTIFY_CONFIG`, or `config.toml`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        Self::load(path)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.check()?;
        Ok(config)
    }

    /// Parse and check a configuration held in memory.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.check()?;
        Ok(config)
    }

    /// Field-level ranges plus cross-field rules.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.retry.check().map_err(ConfigError::Invalid)?;
        self.policy
            .check(self.station.as_ref())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if let Some(landing) = &self.tracker.landing {
            if landing.silence_secs >= self.tracker.inactivity_timeout_secs {
                return Err(ConfigError::Invalid(
                    "tracker.landing.silence_secs must be shorter than tracker.inactivity_timeout_secs"
                        .into(),
                ));
            }
        }

        if self.prediction.enabled {
            if self.station.is_none() || self.policy.range_rings.is_empty() {
                return Err(ConfigError::Invalid(
                    "prediction requires a [station] position and at least one range ring".into(),
                ));
            }
            crate::prediction::parse_api_url(&self.prediction.api_url)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }

        if !self.backends.iter().any(|b| b.enabled) {
            return Err(ConfigError::Invalid(
                "at least one enabled [[backends]] entry is required".into(),
            ));
        }

        self.health_bind_addr()?;
        Ok(())
    }

    /// Resolve `[listener]` to a socket address.
    ///
    /// IP literals, including bare or bracketed IPv6, are used as given.
    /// Anything else is looked up and the first address wins.
    pub async fn udp_bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let host = self.listener.host.trim();
        let port = self.listener.port;

        let literal = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if let Ok(ip) = literal.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        let mut addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| ConfigError::Invalid(format!("listener host `{host}`: {e}")))?;
        addrs.next().ok_or_else(|| {
            ConfigError::Invalid(format!("listener host `{host}` resolved to no address"))
        })
    }

    pub fn health_bind_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        self.health
            .bind
            .as_deref()
            .map(|raw| {
                raw.parse()
                    .map_err(|e| ConfigError::Invalid(format!("health.bind `{raw}`: {e}")))
            })
            .transpose()
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
