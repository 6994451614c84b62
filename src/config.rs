//! Configuration loading.
//!
//! Sources, later ones winning:
//! 1. Built-in defaults
//! 2. JSON file (`--config <path>` or `SOCKET_HUB_CONFIG`)
//! 3. `SOCKET_HUB_*` environment variables
//! 4. Command line flags (applied by the binary)

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::hub::OverflowPolicy;

/// Environment variable naming a config file.
pub const CONFIG_PATH_ENV: &str = "SOCKET_HUB_CONFIG";

/// Configuration for the socket hub.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Address the server listens on.
    pub bind_address: String,
    /// Port the server listens on.
    pub bind_port: u16,
    /// Request path that is upgraded to a WebSocket.
    pub ws_path: String,
    /// Frames each client outbox can hold.
    pub outbox_capacity: usize,
    /// Pending Hub commands before callers wait.
    pub command_capacity: usize,
    /// What a broadcast does with a client whose outbox is full.
    pub overflow: OverflowPolicy,
    /// Seconds between server-initiated pings; 0 disables.
    pub ping_interval_secs: u64,
    /// Seconds of client silence before disconnecting; 0 disables.
    pub idle_timeout_secs: u64,
    /// Default log filter when `RUST_LOG` is not set.
    pub log_level: String,
    /// Environment overrides that did not parse; reported by `validate`.
    #[serde(skip)]
    pub rejected_overrides: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 9099,
            ws_path: "/v1/home".to_string(),
            outbox_capacity: 1024,
            command_capacity: 100,
            overflow: OverflowPolicy::Drop,
            ping_interval_secs: 0,
            idle_timeout_secs: 0,
            log_level: "info".to_string(),
            rejected_overrides: Vec::new(),
        }
    }
}

impl Config {
    /// Load defaults, then the config file, then environment overrides.
    ///
    /// `path` takes precedence over `SOCKET_HUB_CONFIG`. A named file that
    /// cannot be read or parsed is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(CONFIG_PATH_ENV).ok();
        let path = path.or_else(|| env_path.as_deref().map(Path::new));

        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a JSON config file. Missing fields keep their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply `SOCKET_HUB_*` overrides looked up through `lookup`.
    ///
    /// Values that do not parse leave the field unchanged and are recorded;
    /// [`Config::validate`] then rejects the configuration.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(address) = lookup("SOCKET_HUB_BIND_ADDRESS") {
            self.bind_address = address;
        }
        if let Some(path) = lookup("SOCKET_HUB_WS_PATH") {
            self.ws_path = path;
        }
        if let Some(level) = lookup("SOCKET_HUB_LOG_LEVEL") {
            self.log_level = level;
        }

        let rejected = &mut self.rejected_overrides;
        override_parsed(&lookup, "SOCKET_HUB_BIND_PORT", &mut self.bind_port, rejected);
        override_parsed(&lookup, "SOCKET_HUB_OUTBOX_CAPACITY", &mut self.outbox_capacity, rejected);
        override_parsed(&lookup, "SOCKET_HUB_COMMAND_CAPACITY", &mut self.command_capacity, rejected);
        override_parsed(&lookup, "SOCKET_HUB_OVERFLOW", &mut self.overflow, rejected);
        override_parsed(&lookup, "SOCKET_HUB_PING_INTERVAL", &mut self.ping_interval_secs, rejected);
        override_parsed(&lookup, "SOCKET_HUB_IDLE_TIMEOUT", &mut self.idle_timeout_secs, rejected);
    }

    /// Check the configuration, reporting every problem at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = self.rejected_overrides.clone();

        if self.bind_address.trim().is_empty() {
            problems.push("bind_address must not be empty".to_string());
        }
        if !self.ws_path.starts_with('/') {
            problems.push(format!("ws_path must start with '/' (got '{}')", self.ws_path));
        }
        if self.outbox_capacity == 0 {
            problems.push("outbox_capacity must be greater than 0".to_string());
        }
        if self.command_capacity == 0 {
            problems.push("command_capacity must be greater than 0".to_string());
        }
        if self.log_level.parse::<log::LevelFilter>().is_err() {
            problems.push(format!("log_level '{}' is not a valid level", self.log_level));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Invalid configuration:\n  - {}", problems.join("\n  - "))
        }
    }

    /// `host:port` the server binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.bind_port)
    }

    /// Keepalive period, if enabled.
    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }

    /// Environment overrides that were ignored because they did not parse.
    pub fn rejected_overrides(&self) -> &[String] {
        &self.rejected_overrides
    }

    /// Idle timeout, if enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

fn override_parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
    rejected: &mut Vec<String>,
) where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(e) => rejected.push(format!("{key}={raw} is invalid: {e}")),
        }
    }
}
