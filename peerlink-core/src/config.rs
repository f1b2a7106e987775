//! Engine configuration: defaults, TOML file and environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::wire::MAX_PAYLOAD_LEN;

/// Environment variable prefix for overrides, e.g. `PEERLINK_MAX_RETRIES=4`.
pub const ENV_PREFIX: &str = "PEERLINK_";

/// Tunables for one engine instance. File: ~/.config/peerlink/config.toml or /etc/peerlink/config.toml.
/// Durations are whole milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Max datagrams drained per `process()` call (default 128).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Retransmit timeout before any RTT sample (default 200).
    #[serde(default = "default_initial_rto_ms")]
    pub initial_rto_ms: u64,
    /// Lower clamp for the estimated retransmit timeout (default 50).
    #[serde(default = "default_min_rto_ms")]
    pub min_rto_ms: u64,
    /// Upper clamp for the retransmit timeout, including backoff (default 5000).
    #[serde(default = "default_max_rto_ms")]
    pub max_rto_ms: u64,
    /// Retransmissions of one packet before the connection is declared lost (default 10).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Max reliable packets in flight per connection (default 256).
    #[serde(default = "default_send_window")]
    pub send_window: usize,
    /// Sequence numbers ahead of the next expected one that are buffered (default 1024).
    #[serde(default = "default_receive_window")]
    pub receive_window: u32,
    /// Resend interval for Connect and Disconnect (default 250).
    #[serde(default = "default_handshake_interval_ms")]
    pub handshake_interval_ms: u64,
    /// Connect attempts before the handshake times out (default 20).
    #[serde(default = "default_handshake_attempts")]
    pub handshake_attempts: u32,
    /// Time a Disconnecting connection waits for DisconnectAck (default 1000).
    #[serde(default = "default_disconnect_grace_ms")]
    pub disconnect_grace_ms: u64,
    /// Heartbeat sent when nothing else was sent for this long (default 1000).
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Connection dropped when nothing is received for this long (default 15000).
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Server only: admitted connections beyond this are rejected (default 1024).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Larger sends are dropped (default: what fits one datagram).
    #[serde(default = "default_max_payload_len")]
    pub max_payload_len: usize,
}

fn default_batch_size() -> usize {
    128
}
fn default_initial_rto_ms() -> u64 {
    200
}
fn default_min_rto_ms() -> u64 {
    50
}
fn default_max_rto_ms() -> u64 {
    5000
}
fn default_max_retries() -> u32 {
    10
}
fn default_send_window() -> usize {
    256
}
fn default_receive_window() -> u32 {
    1024
}
fn default_handshake_interval_ms() -> u64 {
    250
}
fn default_handshake_attempts() -> u32 {
    20
}
fn default_disconnect_grace_ms() -> u64 {
    1000
}
fn default_heartbeat_interval_ms() -> u64 {
    1000
}
fn default_idle_timeout_ms() -> u64 {
    15_000
}
fn default_max_connections() -> usize {
    1024
}
fn default_max_payload_len() -> usize {
    MAX_PAYLOAD_LEN
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            initial_rto_ms: default_initial_rto_ms(),
            min_rto_ms: default_min_rto_ms(),
            max_rto_ms: default_max_rto_ms(),
            max_retries: default_max_retries(),
            send_window: default_send_window(),
            receive_window: default_receive_window(),
            handshake_interval_ms: default_handshake_interval_ms(),
            handshake_attempts: default_handshake_attempts(),
            disconnect_grace_ms: default_disconnect_grace_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_connections: default_max_connections(),
            max_payload_len: default_max_payload_len(),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&s)
    }

    /// Apply `PEERLINK_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (key is the full variable name, e.g. `PEERLINK_BATCH_SIZE`).
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        override_field(&lookup, "BATCH_SIZE", &mut self.batch_size)?;
        override_field(&lookup, "INITIAL_RTO_MS", &mut self.initial_rto_ms)?;
        override_field(&lookup, "MIN_RTO_MS", &mut self.min_rto_ms)?;
        override_field(&lookup, "MAX_RTO_MS", &mut self.max_rto_ms)?;
        override_field(&lookup, "MAX_RETRIES", &mut self.max_retries)?;
        override_field(&lookup, "SEND_WINDOW", &mut self.send_window)?;
        override_field(&lookup, "RECEIVE_WINDOW", &mut self.receive_window)?;
        override_field(&lookup, "HANDSHAKE_INTERVAL_MS", &mut self.handshake_interval_ms)?;
        override_field(&lookup, "HANDSHAKE_ATTEMPTS", &mut self.handshake_attempts)?;
        override_field(&lookup, "DISCONNECT_GRACE_MS", &mut self.disconnect_grace_ms)?;
        override_field(&lookup, "HEARTBEAT_INTERVAL_MS", &mut self.heartbeat_interval_ms)?;
        override_field(&lookup, "IDLE_TIMEOUT_MS", &mut self.idle_timeout_ms)?;
        override_field(&lookup, "MAX_CONNECTIONS", &mut self.max_connections)?;
        override_field(&lookup, "MAX_PAYLOAD_LEN", &mut self.max_payload_len)?;
        Ok(())
    }

    /// Check cross-field constraints. Engines refuse to start with an invalid config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".into()));
        }
        if self.send_window == 0 || self.receive_window == 0 {
            return Err(ConfigError::Invalid("windows must be positive".into()));
        }
        if self.receive_window >= 1 << 31 {
            return Err(ConfigError::Invalid(
                "receive_window must be below 2^31".into(),
            ));
        }
        if self.send_window as u64 > u64::from(self.receive_window) {
            return Err(ConfigError::Invalid(
                "send_window must not exceed receive_window".into(),
            ));
        }
        if self.min_rto_ms == 0 || self.min_rto_ms > self.max_rto_ms {
            return Err(ConfigError::Invalid(
                "need 0 < min_rto_ms <= max_rto_ms".into(),
            ));
        }
        if self.max_payload_len > MAX_PAYLOAD_LEN {
            return Err(ConfigError::Invalid(format!(
                "max_payload_len above datagram limit {MAX_PAYLOAD_LEN}"
            )));
        }
        if self.handshake_attempts == 0 {
            return Err(ConfigError::Invalid(
                "handshake_attempts must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn initial_rto(&self) -> Duration {
        Duration::from_millis(self.initial_rto_ms)
    }
    pub fn min_rto(&self) -> Duration {
        Duration::from_millis(self.min_rto_ms)
    }
    pub fn max_rto(&self) -> Duration {
        Duration::from_millis(self.max_rto_ms)
    }
    pub fn handshake_interval(&self) -> Duration {
        Duration::from_millis(self.handshake_interval_ms)
    }
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

fn override_field<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    field: &mut T,
) -> Result<(), ConfigError> {
    let key = format!("{ENV_PREFIX}{name}");
    if let Some(raw) = lookup(&key) {
        *field = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::BadOverride { key, value: raw })?;
    }
    Ok(())
}

/// Load config: merge default, then config file (if present), then env vars.
/// A broken file or override is logged and skipped rather than aborting startup.
pub fn load() -> EngineConfig {
    let base = load_file().unwrap_or_default();
    let mut c = base.clone();
    if let Err(e) = c.apply_env() {
        tracing::warn!(error = %e, "Ignoring environment overrides");
        return base;
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerlink/config.toml"));
    out
}

fn load_file() -> Option<EngineConfig> {
    for p in config_paths() {
        if p.exists() {
            match EngineConfig::from_file(&p) {
                Ok(c) => return Some(c),
                Err(e) => tracing::warn!(path = ?p, error = %e, "Ignoring config file"),
            }
            break;
        }
    }
    None
}

/// Error loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("bad value {value:?} for {key}")]
    BadOverride { key: String, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}
