//! Configuration – reads/writes `~/.evdash/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use evdash_client::ClientConfig;
use evdash_cockpit::{ServerConfig, SessionConfig};
use evdash_kernel::AggregatorConfig;
use evdash_types::VehicleSettings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write config at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Where hardware sources come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    /// Detect the platform and use real drivers where available.
    #[default]
    Auto,
    Synthetic,
}

impl std::str::FromStr for HardwareMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(HardwareMode::Auto),
            "synthetic" => Ok(HardwareMode::Synthetic),
            other => Err(format!("unknown hardware mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Snapshots buffered per client.
    pub queue_capacity: usize,
    pub control_capacity: usize,
    /// Commands per second per client.
    pub command_rate_limit: u32,
    pub max_message_bytes: usize,
    /// Time sessions get to flush replies on shutdown.
    pub shutdown_grace_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: evdash_cockpit::DEFAULT_PORT,
            queue_capacity: 4,
            control_capacity: 64,
            command_rate_limit: 10,
            max_message_bytes: 64 * 1024,
            shutdown_grace_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub interval_ms: u64,
    pub history_size: usize,
    pub poll_timeout_ms: u64,
    pub stale_after_ticks: u64,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            history_size: evdash_middleware::DEFAULT_HISTORY_SIZE,
            poll_timeout_ms: 250,
            stale_after_ticks: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareSection {
    pub mode: HardwareMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub url: String,
    pub reconnect_delay_ms: u64,
    pub max_attempts: u32,
    /// `0` disables the automatic restart after `Failed`.
    pub failed_cooldown_ms: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8765".to_string(),
            reconnect_delay_ms: 2000,
            max_attempts: 5,
            failed_cooldown_ms: 30_000,
        }
    }
}

/// Persisted configuration stored in `~/.evdash/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub telemetry: TelemetrySection,
    pub hardware: HardwareSection,
    /// Settings the vehicle starts with.
    pub settings: VehicleSettings,
    pub client: ClientSection,
}

impl Config {
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for zero intervals or rate limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telemetry.interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "telemetry.interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.telemetry.poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "telemetry.poll_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.server.command_rate_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "server.command_rate_limit",
                reason: "must be greater than zero".to_string(),
            });
        }
        if !(self.client.url.starts_with("ws://") || self.client.url.starts_with("wss://")) {
            return Err(ConfigError::Invalid {
                field: "client.url",
                reason: format!("'{}' is not a ws:// or wss:// URL", self.client.url),
            });
        }
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        let s = &self.server;
        ServerConfig {
            host: s.host.clone(),
            port: s.port,
            session: SessionConfig {
                queue_capacity: s.queue_capacity,
                control_capacity: s.control_capacity,
                command_rate_limit: NonZeroU32::new(s.command_rate_limit)
                    .unwrap_or(NonZeroU32::MIN),
                max_message_bytes: s.max_message_bytes,
            },
            shutdown_grace: Duration::from_millis(s.shutdown_grace_ms),
        }
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            interval: self.tick_interval(),
            stale_after_ticks: self.telemetry.stale_after_ticks,
            ..AggregatorConfig::default()
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry.interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.telemetry.poll_timeout_ms)
    }

    pub fn client_config(&self) -> ClientConfig {
        let c = &self.client;
        ClientConfig {
            url: c.url.clone(),
            reconnect_delay: Duration::from_millis(c.reconnect_delay_ms),
            max_attempts: c.max_attempts,
            failed_cooldown: (c.failed_cooldown_ms > 0)
                .then(|| Duration::from_millis(c.failed_cooldown_ms)),
            synthetic_interval: self.tick_interval(),
            ..ClientConfig::default()
        }
    }
}

/// Return the path to `~/.evdash/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".evdash").join("config.toml")
}

/// Load `path` (or the default location), apply env overrides and validate.
/// A missing file yields the defaults.
///
/// # Errors
///
/// Fails on unreadable or malformed files and invalid values.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_path);
    let mut cfg = load_from(&path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Load the config from a specific path.  Returns `None` if the file does
/// not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(cfg))
}

/// Apply `EVDASH_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `EVDASH_HOST` | `server.host` |
/// | `EVDASH_PORT` | `server.port` |
/// | `EVDASH_TICK_MS` | `telemetry.interval_ms` |
/// | `EVDASH_HARDWARE` | `hardware.mode` |
/// | `EVDASH_SERVER_URL` | `client.url` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("EVDASH_HOST") {
        cfg.server.host = v;
    }
    if let Ok(v) = std::env::var("EVDASH_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.server.port = port;
    }
    if let Ok(v) = std::env::var("EVDASH_TICK_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.telemetry.interval_ms = ms;
    }
    if let Ok(v) = std::env::var("EVDASH_HARDWARE")
        && let Ok(mode) = v.parse::<HardwareMode>()
    {
        cfg.hardware.mode = mode;
    }
    if let Ok(v) = std::env::var("EVDASH_SERVER_URL") {
        cfg.client.url = v;
    }
}

/// Save the config, creating the parent directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(write_err)?;
        }
    }
    let raw = toml::to_string_pretty(cfg)?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}
