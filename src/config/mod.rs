//! Configuration management for connection pools
//!
//! Values can be built in code with [`ConfigBuilder`], read from a TOML/JSON/YAML
//! file, or taken from `MUXPOOL_*` environment variables. Durations are stored
//! as milliseconds so they round-trip through every format.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

use crate::error::{PoolError, Result};
use crate::protocol::Protocol;

/// Environment variable prefix used by [`PoolConfig::load_from_env`]
pub const ENV_PREFIX: &str = "MUXPOOL";

/// Channel pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Protocol to prefer when negotiating with the peer
    pub protocol: Protocol,
    /// Total concurrent channels: connections for HTTP/1.1, streams for HTTP/2
    pub max_concurrency: usize,
    /// Maximum acquires allowed to wait for a free channel
    pub max_pending_acquires: usize,
    /// Maximum time an acquire may wait, in milliseconds
    pub acquire_timeout_ms: u64,
    /// Maximum time to establish a parent connection, in milliseconds
    pub connect_timeout_ms: u64,
    /// Local cap on concurrent streams per connection
    pub max_streams_per_connection: u32,
    /// Interval between PINGs; `None` or 0 disables health checks
    pub health_check_ping_period_ms: Option<u64>,
    /// Idle time before an unused connection is closed; `None` disables reaping
    pub idle_connection_timeout_ms: Option<u64>,
    /// Upper bound on multiplexed pool shutdown, in milliseconds
    pub close_timeout_ms: u64,
    /// Log level used by the simulator
    pub log_level: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Http2,
            max_concurrency: 50,
            max_pending_acquires: 10_000,
            acquire_timeout_ms: 10_000,   // 10 seconds
            connect_timeout_ms: 2_000,    // 2 seconds
            max_streams_per_connection: u32::MAX,
            health_check_ping_period_ms: Some(5_000),
            idle_connection_timeout_ms: Some(60_000),
            close_timeout_ms: 10_000,
            log_level: "info".to_string(),
        }
    }
}

impl PoolConfig {
    /// Load configuration from file (format picked by extension)
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config: Self = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(|e| PoolError::Config(format!("Failed to read config file {}: {}", path.display(), e)))?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `MUXPOOL_*` environment variables
    pub fn load_from_env() -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(PoolError::Config("max_concurrency must be greater than 0".to_string()));
        }

        if self.max_streams_per_connection == 0 {
            return Err(PoolError::Config(
                "max_streams_per_connection must be greater than 0".to_string(),
            ));
        }

        if self.close_timeout_ms == 0 {
            return Err(PoolError::Config("close_timeout_ms must be greater than 0".to_string()));
        }

        if self.acquire_timeout_ms == 0 {
            return Err(PoolError::Config("acquire_timeout_ms must be greater than 0".to_string()));
        }

        Ok(())
    }

    /// Get duration values
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn health_check_ping_period(&self) -> Option<Duration> {
        self.health_check_ping_period_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn idle_connection_timeout(&self) -> Option<Duration> {
        self.idle_connection_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Get tracing level
    pub fn tracing_level(&self) -> Level {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

/// Configuration builder for easier setup
pub struct ConfigBuilder {
    config: PoolConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: PoolConfig::default(),
        }
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.config.protocol = protocol;
        self
    }

    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.config.max_concurrency = max;
        self
    }

    pub fn max_pending_acquires(mut self, max: usize) -> Self {
        self.config.max_pending_acquires = max;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn max_streams_per_connection(mut self, max: u32) -> Self {
        self.config.max_streams_per_connection = max;
        self
    }

    /// Set the PING period; `None` disables health checks
    pub fn health_check_ping_period(mut self, period: Option<Duration>) -> Self {
        self.config.health_check_ping_period_ms = period.map(|p| p.as_millis() as u64);
        self
    }

    /// Set the idle timeout; `None` disables reaping
    pub fn idle_connection_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.idle_connection_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn log_level<S: Into<String>>(mut self, level: S) -> Self {
        self.config.log_level = level.into();
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<PoolConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.protocol, Protocol::Http2);
        assert_eq!(config.max_streams_per_connection, u32::MAX);
        assert_eq!(config.health_check_ping_period(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .protocol(Protocol::Http1)
            .max_concurrency(8)
            .health_check_ping_period(None)
            .idle_connection_timeout(Some(Duration::from_secs(2)))
            .log_level("debug")
            .build()
            .unwrap();

        assert_eq!(config.protocol, Protocol::Http1);
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.health_check_ping_period(), None);
        assert_eq!(config.idle_connection_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(config.tracing_level(), Level::DEBUG);
    }

    #[test]
    fn test_config_validation() {
        let mut config = PoolConfig::default();
        config.max_streams_per_connection = 0;
        assert!(matches!(config.validate(), Err(PoolError::Config(_))));

        let config = ConfigBuilder::new().max_concurrency(0).build();
        assert!(config.is_err());
    }

    #[test]
    fn test_zero_period_disables_health_checks() {
        let mut config = PoolConfig::default();
        config.health_check_ping_period_ms = Some(0);
        assert_eq!(config.health_check_ping_period(), None);
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("muxpool-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "protocol = \"http1\"").unwrap();
        writeln!(file, "max_concurrency = 12").unwrap();
        drop(file);

        let config = PoolConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.protocol, Protocol::Http1);
        assert_eq!(config.max_concurrency, 12);
        assert_eq!(config.close_timeout_ms, 10_000);
    }
}
