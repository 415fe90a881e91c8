//! HTTP server configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Configuration for the fleet HTTP server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_address: SocketAddr,

    /// Enable CORS for API
    pub enable_cors: bool,

    /// Enable request logging
    pub enable_request_logging: bool,

    /// Keep-alive interval for the event stream in seconds
    pub sse_keep_alive_secs: u64,

    /// Default page size for history listings
    pub default_history_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            enable_cors: true,
            enable_request_logging: true,
            sse_keep_alive_secs: 15,
            default_history_limit: 100,
        }
    }
}

impl ServerConfig {
    /// Create a new config builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sse_keep_alive_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sse_keep_alive_secs".to_string(),
                reason: "Keep-alive interval must be positive".to_string(),
            });
        }

        if self.default_history_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "default_history_limit".to_string(),
                reason: "Must return at least 1 row".to_string(),
            });
        }

        Ok(())
    }
}

/// Builder for ServerConfig
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    bind_address: Option<SocketAddr>,
    enable_cors: Option<bool>,
    enable_request_logging: Option<bool>,
    sse_keep_alive_secs: Option<u64>,
    default_history_limit: Option<usize>,
}

impl ServerConfigBuilder {
    /// Set bind address
    pub fn bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = Some(addr);
        self
    }

    /// Set bind address from string
    pub fn bind_address_str(mut self, addr: &str) -> Result<Self, ConfigError> {
        self.bind_address = Some(addr.parse().map_err(|_| ConfigError::InvalidValue {
            field: "bind_address".to_string(),
            reason: format!("Invalid address: {}", addr),
        })?);
        Ok(self)
    }

    /// Enable/disable CORS
    pub fn enable_cors(mut self, enable: bool) -> Self {
        self.enable_cors = Some(enable);
        self
    }

    /// Enable/disable request logging
    pub fn enable_request_logging(mut self, enable: bool) -> Self {
        self.enable_request_logging = Some(enable);
        self
    }

    pub fn sse_keep_alive_secs(mut self, secs: u64) -> Self {
        self.sse_keep_alive_secs = Some(secs);
        self
    }

    pub fn default_history_limit(mut self, limit: usize) -> Self {
        self.default_history_limit = Some(limit);
        self
    }

    /// Build the config
    pub fn build(self) -> Result<ServerConfig, ConfigError> {
        let defaults = ServerConfig::default();
        let config = ServerConfig {
            bind_address: self.bind_address.unwrap_or(defaults.bind_address),
            enable_cors: self.enable_cors.unwrap_or(defaults.enable_cors),
            enable_request_logging: self
                .enable_request_logging
                .unwrap_or(defaults.enable_request_logging),
            sse_keep_alive_secs: self
                .sse_keep_alive_secs
                .unwrap_or(defaults.sse_keep_alive_secs),
            default_history_limit: self
                .default_history_limit
                .unwrap_or(defaults.default_history_limit),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Configuration errors
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}
