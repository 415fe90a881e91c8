//! Configuration management for printfleet
//!
//! Configuration comes from `PRINTFLEET_*` environment variables or a TOML
//! file. Every section has defaults, so a TOML file only needs the keys it
//! overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::server::ServerConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Device polling configuration
    pub tracker: TrackerConfig,

    /// Load sampling configuration
    pub energy: EnergyConfig,

    /// Matching loop configuration
    pub scheduler: SchedulerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database path
    pub sqlite_path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("data/printfleet.db"),
        }
    }
}

/// Device tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Seconds between polling rounds
    pub poll_interval_secs: u64,

    /// Upper bound on a single status query
    pub poll_timeout_secs: u64,

    /// Readings kept per device
    pub history_cap: usize,

    /// Consecutive idle readings before a printing job is flagged stale
    pub stale_idle_readings: u32,

    /// Maximum concurrent device queries per round
    pub max_concurrent_polls: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            poll_timeout_secs: 5,
            history_cap: 1000,
            stale_idle_readings: 3,
            max_concurrent_polls: 16,
        }
    }
}

/// Energy controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyConfig {
    /// Seconds between load samples
    pub sample_interval_secs: u64,

    /// Load samples kept
    pub history_cap: usize,

    /// External meter endpoint (optional)
    pub meter_url: Option<String>,

    /// Upper bound on a meter query
    pub meter_timeout_secs: u64,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 15,
            history_cap: 1000,
            meter_url: None,
            meter_timeout_secs: 3,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between matching ticks
    pub tick_interval_secs: u64,

    /// Run startup reconciliation before the first tick
    pub recover_on_start: bool,

    /// Capacity of the event broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
            recover_on_start: true,
            event_channel_capacity: 256,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let mut server = defaults.server;
        if let Ok(addr) = std::env::var("PRINTFLEET_BIND_ADDRESS") {
            server.bind_address = addr
                .parse()
                .with_context(|| format!("Invalid PRINTFLEET_BIND_ADDRESS: {addr}"))?;
        }
        server.enable_cors = env_or("PRINTFLEET_ENABLE_CORS", server.enable_cors);

        let sqlite_path = std::env::var("PRINTFLEET_SQLITE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.database.sqlite_path);

        let tracker = TrackerConfig {
            poll_interval_secs: env_or(
                "PRINTFLEET_POLL_INTERVAL",
                defaults.tracker.poll_interval_secs,
            ),
            poll_timeout_secs: env_or("PRINTFLEET_POLL_TIMEOUT", defaults.tracker.poll_timeout_secs),
            history_cap: env_or("PRINTFLEET_HISTORY_CAP", defaults.tracker.history_cap),
            stale_idle_readings: env_or(
                "PRINTFLEET_STALE_IDLE_READINGS",
                defaults.tracker.stale_idle_readings,
            ),
            max_concurrent_polls: env_or(
                "PRINTFLEET_MAX_CONCURRENT_POLLS",
                defaults.tracker.max_concurrent_polls,
            ),
        };

        let energy = EnergyConfig {
            sample_interval_secs: env_or(
                "PRINTFLEET_SAMPLE_INTERVAL",
                defaults.energy.sample_interval_secs,
            ),
            history_cap: env_or("PRINTFLEET_ENERGY_HISTORY_CAP", defaults.energy.history_cap),
            meter_url: std::env::var("PRINTFLEET_METER_URL").ok(),
            meter_timeout_secs: env_or(
                "PRINTFLEET_METER_TIMEOUT",
                defaults.energy.meter_timeout_secs,
            ),
        };

        let scheduler = SchedulerConfig {
            tick_interval_secs: env_or(
                "PRINTFLEET_TICK_INTERVAL",
                defaults.scheduler.tick_interval_secs,
            ),
            recover_on_start: env_or(
                "PRINTFLEET_RECOVER_ON_START",
                defaults.scheduler.recover_on_start,
            ),
            event_channel_capacity: env_or(
                "PRINTFLEET_EVENT_CAPACITY",
                defaults.scheduler.event_channel_capacity,
            ),
        };

        let logging = LoggingConfig {
            level: std::env::var("PRINTFLEET_LOG_LEVEL").unwrap_or(defaults.logging.level),
            format: std::env::var("PRINTFLEET_LOG_FORMAT").unwrap_or(defaults.logging.format),
        };

        Ok(Self {
            server,
            database: DatabaseConfig { sqlite_path },
            tracker,
            energy,
            scheduler,
            logging,
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.server.validate().context("Invalid server configuration")?;

        if self.tracker.poll_interval_secs == 0 {
            anyhow::bail!("tracker.poll_interval_secs must be greater than 0");
        }

        if self.tracker.poll_timeout_secs == 0 {
            anyhow::bail!("tracker.poll_timeout_secs must be greater than 0");
        }

        if self.tracker.history_cap == 0 {
            anyhow::bail!("tracker.history_cap must be greater than 0");
        }

        if self.tracker.stale_idle_readings == 0 {
            anyhow::bail!("tracker.stale_idle_readings must be greater than 0");
        }

        if self.tracker.max_concurrent_polls == 0 {
            anyhow::bail!("tracker.max_concurrent_polls must be greater than 0");
        }

        if self.energy.sample_interval_secs == 0 {
            anyhow::bail!("energy.sample_interval_secs must be greater than 0");
        }

        if self.energy.history_cap == 0 {
            anyhow::bail!("energy.history_cap must be greater than 0");
        }

        if self.scheduler.tick_interval_secs == 0 {
            anyhow::bail!("scheduler.tick_interval_secs must be greater than 0");
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("logging.format must be 'text' or 'json'");
        }

        Ok(())
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.tracker.poll_interval_secs)
    }

    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.tracker.poll_timeout_secs)
    }

    #[must_use]
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.energy.sample_interval_secs)
    }

    #[must_use]
    pub fn meter_timeout(&self) -> Duration {
        Duration::from_secs(self.energy.meter_timeout_secs)
    }

    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.tick_interval_secs)
    }
}
