//! Pipevisor configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::segment::INIT_MARKER;

/// Main pipevisor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener addresses and ports
    pub listen: ListenConfig,

    /// Task channel (named FIFO) configuration
    pub channel: ChannelConfig,

    /// Shared segment configuration
    pub segment: SegmentConfig,

    /// Watchdog supervision configuration
    pub supervision: SupervisionConfig,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        if self.segment.size < INIT_MARKER.len() {
            return Err(eyre::eyre!(
                "segment size {} is smaller than the {}-byte initialization marker",
                self.segment.size,
                INIT_MARKER.len()
            ));
        }

        let ports = [
            self.listen.client_port,
            self.listen.dispatcher_health_port,
            self.listen.worker_health_port,
        ];
        for (i, a) in ports.iter().enumerate() {
            if ports[i + 1..].contains(a) {
                return Err(eyre::eyre!("listener port {} is configured twice", a));
            }
        }

        if self.channel.reply_timeout_ms == 0 || self.supervision.probe_timeout_ms == 0 {
            return Err(eyre::eyre!("timeouts must be non-zero"));
        }
        if self.channel.poll_interval_ms == 0 || self.supervision.interval_ms == 0 {
            return Err(eyre::eyre!("poll intervals must be non-zero"));
        }
        if self.supervision.max_misses == 0 {
            return Err(eyre::eyre!("supervision max-misses must be at least 1"));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .pipevisor.yml
        let local_config = PathBuf::from(".pipevisor.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/pipevisor/pipevisor.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("pipevisor").join("pipevisor.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Runtime directory holding pid records and FIFO conduits
    ///
    /// An explicit `channel.dir` wins; otherwise the platform runtime dir.
    pub fn runtime_dir(&self) -> PathBuf {
        self.channel
            .dir
            .clone()
            .unwrap_or_else(default_runtime_dir)
    }
}

/// Default runtime directory for pid records and conduits
pub fn default_runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("pipevisor")
}

/// Listener addresses and ports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Host all listeners bind to (single-host deployment)
    pub host: String,

    /// Dispatcher client-facing port
    #[serde(rename = "client-port")]
    pub client_port: u16,

    /// Dispatcher health-check port
    #[serde(rename = "dispatcher-health-port")]
    pub dispatcher_health_port: u16,

    /// Worker health-check port
    #[serde(rename = "worker-health-port")]
    pub worker_health_port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            client_port: 2222,
            worker_health_port: 2223,
            dispatcher_health_port: 2224,
        }
    }
}

impl ListenConfig {
    /// Client-facing dispatcher address
    pub fn client_addr(&self) -> String {
        format!("{}:{}", self.host, self.client_port)
    }

    /// Health-check address for the given role
    pub fn health_addr(&self, role: crate::process::Role) -> String {
        let port = match role {
            crate::process::Role::Dispatcher => self.dispatcher_health_port,
            crate::process::Role::Worker => self.worker_health_port,
            crate::process::Role::Watchdog => self.dispatcher_health_port,
        };
        format!("{}:{}", self.host, port)
    }
}

/// Task channel (named FIFO) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Directory holding the conduits and pid records (defaults to the
    /// platform runtime dir)
    pub dir: Option<PathBuf>,

    /// How long an endpoint open may wait for the peer, in milliseconds
    #[serde(rename = "open-timeout-ms")]
    pub open_timeout_ms: u64,

    /// How long the dispatcher waits for a worker reply, in milliseconds
    #[serde(rename = "reply-timeout-ms")]
    pub reply_timeout_ms: u64,

    /// Bounded-wait interval for serve/relay loops, in milliseconds
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            dir: None,
            open_timeout_ms: 10_000,
            reply_timeout_ms: 5_000,
            poll_interval_ms: 1_000,
        }
    }
}

impl ChannelConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Shared segment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// OS identifier of the segment
    pub name: String,

    /// Segment size in bytes
    pub size: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            name: "pipevisor-handoff".to_string(),
            size: 10,
        }
    }
}

/// Liveness strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStrategyKind {
    /// TCP health-check probe (distinguishes unreachable from unresponsive)
    Socket,
    /// SIGUSR1/SIGUSR2 probe
    Signal,
}

/// Watchdog supervision configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisionConfig {
    /// Which liveness strategy the watchdog uses
    pub strategy: ProbeStrategyKind,

    /// Supervision cycle interval, in milliseconds
    #[serde(rename = "interval-ms")]
    pub interval_ms: u64,

    /// Per-probe reply timeout, in milliseconds
    #[serde(rename = "probe-timeout-ms")]
    pub probe_timeout_ms: u64,

    /// Consecutive unresponsive probes before forced restart
    #[serde(rename = "max-misses")]
    pub max_misses: u32,

    /// Grace period for a terminating process, in milliseconds
    #[serde(rename = "grace-period-ms")]
    pub grace_period_ms: u64,

    /// How many times to poll for the worker pid record after a spawn
    #[serde(rename = "pid-retries")]
    pub pid_retries: u32,

    /// Delay between pid record polls, in milliseconds
    #[serde(rename = "pid-retry-delay-ms")]
    pub pid_retry_delay_ms: u64,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            strategy: ProbeStrategyKind::Socket,
            interval_ms: 5_000,
            probe_timeout_ms: 3_000,
            max_misses: 2,
            grace_period_ms: 2_000,
            pid_retries: 10,
            pid_retry_delay_ms: 500,
        }
    }
}

impl SupervisionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn pid_retry_delay(&self) -> Duration {
        Duration::from_millis(self.pid_retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_ports_match_protocol() {
        let listen = ListenConfig::default();
        assert_eq!(listen.client_port, 2222);
        assert_eq!(listen.worker_health_port, 2223);
        assert_eq!(listen.dispatcher_health_port, 2224);
    }

    #[test]
    fn test_rejects_undersized_segment() {
        let mut config = Config::default();
        config.segment.size = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_ports() {
        let mut config = Config::default();
        config.listen.worker_health_port = config.listen.client_port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
listen:
  client-port: 3333
supervision:
  strategy: signal
  max-misses: 3
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.listen.client_port, 3333);
        assert_eq!(config.supervision.strategy, ProbeStrategyKind::Signal);
        assert_eq!(config.supervision.max_misses, 3);
        // untouched sections keep their defaults
        assert_eq!(config.segment.size, 10);
        assert_eq!(config.channel.poll_interval_ms, 1_000);
    }

    #[test]
    fn test_explicit_dir_overrides_runtime_dir() {
        let mut config = Config::default();
        config.channel.dir = Some(PathBuf::from("/tmp/pv-test"));
        assert_eq!(config.runtime_dir(), PathBuf::from("/tmp/pv-test"));
    }
}
