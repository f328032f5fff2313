//! Run configuration for a load test.
//!
//! A `RunConfig` can be built in code, deserialized from a TOML file, or
//! assembled from CLI flags layered over a file. Zero-valued numeric fields
//! mean "unset" and are replaced with defaults by
//! [`RunConfig::validate_and_default`].

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Smallest wire probe packet that still fits header, timestamp and checksum.
pub const MIN_PACKET_SIZE: usize = 128;
/// Lower bound on the per-session send interval.
pub const MIN_SEND_INTERVAL: Duration = Duration::from_micros(100);

pub const DEFAULT_SESSIONS: u64 = 5;
pub const DEFAULT_DURATION: Duration = Duration::from_secs(30);
pub const DEFAULT_PACKET_SIZE: usize = 1024;
pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("static TURN run without a TURN server address")]
    MissingTurnServer,

    #[error("static STUN run without a STUN server address")]
    MissingStunServer,

    #[error("remote credential source requires {field}")]
    MissingProvisioning { field: &'static str },

    #[error("packet size {size} is below the minimum of {min} bytes")]
    PacketTooSmall { size: usize, min: usize },

    #[error("send interval {interval:?} is below the minimum of {min:?}")]
    IntervalTooShort { interval: Duration, min: Duration },

    #[error("event queue capacity must be positive")]
    ZeroQueueCapacity,
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Which protocol each session exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Stun,
    #[default]
    Turn,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Stun => write!(f, "stun"),
            Method::Turn => write!(f, "turn"),
        }
    }
}

/// Relay topology for TURN sessions. Ignored for STUN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Client socket -> relay allocation, one hop through the server.
    #[default]
    SingleHop,
    /// Relay A -> relay B, both allocations on the server.
    DoubleHop,
}

impl std::fmt::Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topology::SingleHop => write!(f, "single-hop"),
            Topology::DoubleHop => write!(f, "double-hop"),
        }
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Where session credentials come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CredentialSource {
    Static(StaticCredentials),
    Remote(RemoteCredentials),
}

impl Default for CredentialSource {
    fn default() -> Self {
        CredentialSource::Static(StaticCredentials::default())
    }
}

/// Fixed server addresses and long-term credentials shared by all sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticCredentials {
    /// STUN server, e.g. `stun.example.com:3478`. Falls back to `turn_server`.
    pub stun_server: String,
    /// TURN server, e.g. `turn.example.com:3478`.
    pub turn_server: String,
    pub username: String,
    pub password: String,
}

/// Credentials fetched from the allocation service at dispatch time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteCredentials {
    /// Allocation service URL.
    pub endpoint: String,
    pub device_id: String,
    pub token: String,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Levels for the two log streams: statistics and per-session requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for `turnstress::stats` (detail and summary dumps).
    pub stats_level: String,
    /// Level for `turnstress::probe` (worker diagnostics).
    pub probe_level: String,
    /// Emit JSON lines instead of the human formatter.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stats_level: "info".to_string(),
            probe_level: "warn".to_string(),
            json: false,
        }
    }
}

impl LoggingConfig {
    /// `EnvFilter` directive string for this configuration.
    pub fn filter_directives(&self) -> String {
        format!(
            "warn,turnstress=info,turnstress::stats={},turnstress::probe={}",
            self.stats_level, self.probe_level
        )
    }
}

// ---------------------------------------------------------------------------
// Tuning
// ---------------------------------------------------------------------------

/// Rate-limiting and protocol knobs that rarely need changing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    /// Delay between consecutive session dispatches.
    #[serde(with = "humantime_serde")]
    pub stagger: Duration,
    /// Wait between failed relay setup attempts.
    #[serde(with = "humantime_serde")]
    pub setup_backoff: Duration,
    /// Period of the per-session detail dump.
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,
    /// Response timeout for a single STUN binding request.
    #[serde(with = "humantime_serde")]
    pub stun_timeout: Duration,
    /// Bounded capacity of the probe event queue. Producers block when full.
    pub event_queue_capacity: usize,
    /// Realm presented to the TURN server.
    pub realm: String,
    /// Replace the mapped port with the sender's local port before creating
    /// the single-hop permission. Needed for servers that NAT every port of
    /// their public address to one private address.
    pub rewrite_mapped_port: bool,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            stagger: Duration::from_millis(5),
            setup_backoff: Duration::from_millis(100),
            report_interval: Duration::from_secs(5),
            stun_timeout: Duration::from_secs(5),
            event_queue_capacity: 1000,
            realm: "turnstress".to_string(),
            rewrite_mapped_port: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Complete description of one load-test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Number of concurrent probe sessions.
    pub sessions: u64,
    pub method: Method,
    pub topology: Topology,
    /// Total run duration; the shared deadline.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Size of every wire probe packet in bytes.
    pub packet_size: usize,
    /// Pause between consecutive sends (TURN) or requests (STUN).
    #[serde(with = "humantime_serde")]
    pub send_interval: Duration,
    pub credentials: CredentialSource,
    pub logging: LoggingConfig,
    pub tuning: TuningConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sessions: DEFAULT_SESSIONS,
            method: Method::default(),
            topology: Topology::default(),
            duration: DEFAULT_DURATION,
            packet_size: DEFAULT_PACKET_SIZE,
            send_interval: DEFAULT_SEND_INTERVAL,
            credentials: CredentialSource::default(),
            logging: LoggingConfig::default(),
            tuning: TuningConfig::default(),
        }
    }
}

impl RunConfig {
    /// Load a configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded run configuration");
        Ok(config)
    }

    /// Fill unset (zero) fields with defaults and reject malformed values.
    pub fn validate_and_default(&mut self) -> Result<(), ConfigError> {
        match &mut self.credentials {
            CredentialSource::Static(creds) => {
                if self.method == Method::Turn && creds.turn_server.is_empty() {
                    return Err(ConfigError::MissingTurnServer);
                }
                if creds.stun_server.is_empty() {
                    creds.stun_server = creds.turn_server.clone();
                }
                if self.method == Method::Stun && creds.stun_server.is_empty() {
                    return Err(ConfigError::MissingStunServer);
                }
            }
            CredentialSource::Remote(remote) => {
                if remote.endpoint.is_empty() {
                    return Err(ConfigError::MissingProvisioning { field: "an endpoint" });
                }
                if remote.device_id.is_empty() {
                    return Err(ConfigError::MissingProvisioning { field: "a device id" });
                }
                if remote.token.is_empty() {
                    return Err(ConfigError::MissingProvisioning { field: "a token" });
                }
            }
        }

        if self.sessions == 0 {
            self.sessions = DEFAULT_SESSIONS;
        }
        if self.duration.is_zero() {
            self.duration = DEFAULT_DURATION;
        }
        if self.packet_size == 0 {
            self.packet_size = DEFAULT_PACKET_SIZE;
        }
        if self.packet_size < MIN_PACKET_SIZE {
            return Err(ConfigError::PacketTooSmall {
                size: self.packet_size,
                min: MIN_PACKET_SIZE,
            });
        }
        if self.send_interval.is_zero() {
            self.send_interval = DEFAULT_SEND_INTERVAL;
        }
        if self.send_interval < MIN_SEND_INTERVAL {
            return Err(ConfigError::IntervalTooShort {
                interval: self.send_interval,
                min: MIN_SEND_INTERVAL,
            });
        }
        if self.logging.stats_level.is_empty() {
            self.logging.stats_level = LoggingConfig::default().stats_level;
        }
        if self.logging.probe_level.is_empty() {
            self.logging.probe_level = LoggingConfig::default().probe_level;
        }
        if self.tuning.event_queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if self.tuning.report_interval.is_zero() {
            self.tuning.report_interval = TuningConfig::default().report_interval;
        }
        if self.tuning.stun_timeout.is_zero() {
            self.tuning.stun_timeout = TuningConfig::default().stun_timeout;
        }

        Ok(())
    }

    /// Human description of the server under test, for the run banner.
    pub fn target_description(&self) -> String {
        match &self.credentials {
            CredentialSource::Remote(_) => "{provisioned}".to_string(),
            CredentialSource::Static(creds) => match self.method {
                Method::Stun => creds.stun_server.clone(),
                Method::Turn => creds.turn_server.clone(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
