//! Fleet server implementation
//!
//! This module provides the HTTP server that exposes the fleet
//! components and drives their background loops.

use std::net::SocketAddr;
use std::time::Instant;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::fleet::Fleet;

use super::api::create_router;
use super::config::ServerConfig;

// ============================================================================
// App State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Tracker, energy controller and scheduler over one store
    pub fleet: Fleet,

    /// Server start time
    pub start_time: Instant,

    /// Configuration
    pub config: ServerConfig,
}

// ============================================================================
// Fleet Server
// ============================================================================

/// Main fleet server
pub struct FleetServer {
    config: ServerConfig,
    state: AppState,
}

impl FleetServer {
    /// Create a new fleet server
    pub fn new(fleet: Fleet) -> Result<Self, ServerError> {
        let config = fleet.context.config.server.clone();
        config
            .validate()
            .map_err(|e| ServerError::ConfigError(e.to_string()))?;

        let state = AppState {
            fleet,
            start_time: Instant::now(),
            config: config.clone(),
        };

        Ok(Self { config, state })
    }

    /// Get the application state
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let mut router = create_router(self.state.clone());

        // Add CORS layer if enabled
        if self.config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }

        // Add tracing layer if enabled
        if self.config.enable_request_logging {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Start the fleet loops and serve until `shutdown_signal` resolves
    pub async fn start_with_shutdown(
        &self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let router = self.build_router();
        let addr = self.config.bind_address;

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(e.to_string()))?;

        let handle = self
            .state
            .fleet
            .start()
            .await
            .map_err(|e| ServerError::InitError(format!("{e:#}")))?;
        if !handle.recovery.is_empty() {
            tracing::warn!(
                replayed = handle.recovery.replayed.len(),
                reverted = handle.recovery.reverted.len(),
                unsignaled = handle.recovery.unsignaled.len(),
                "Reconciled interrupted assignments"
            );
        }

        tracing::info!("Starting fleet server on {} (with graceful shutdown)", addr);

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::ServeError(e.to_string()));

        handle.shutdown().await;
        self.state.fleet.scheduler.cancel_starts().await;

        served?;
        tracing::info!("Fleet server shutdown complete");
        Ok(())
    }

    /// Get server info
    pub fn info(&self) -> ServerInfo {
        let config = &self.state.fleet.context.config;
        ServerInfo {
            bind_address: self.config.bind_address,
            database: config.database.sqlite_path.display().to_string(),
            poll_interval_secs: config.tracker.poll_interval_secs,
            tick_interval_secs: config.scheduler.tick_interval_secs,
            meter_url: config.energy.meter_url.clone(),
            cors_enabled: self.config.enable_cors,
            request_logging_enabled: self.config.enable_request_logging,
        }
    }
}

/// Server information
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub bind_address: SocketAddr,
    pub database: String,
    pub poll_interval_secs: u64,
    pub tick_interval_secs: u64,
    pub meter_url: Option<String>,
    pub cors_enabled: bool,
    pub request_logging_enabled: bool,
}

impl ServerInfo {
    /// Format as display string
    pub fn display(&self) -> String {
        format!(
            "Fleet Server\n\
             {:-<40}\n\
             Bind Address: {}\n\
             Database: {}\n\
             Poll Interval: {}s\n\
             Tick Interval: {}s\n\
             Meter: {}\n\
             CORS: {}\n\
             Request Logging: {}",
            "",
            self.bind_address,
            self.database,
            self.poll_interval_secs,
            self.tick_interval_secs,
            self.meter_url.as_deref().unwrap_or("estimate only"),
            if self.cors_enabled { "enabled" } else { "disabled" },
            if self.request_logging_enabled { "enabled" } else { "disabled" }
        )
    }
}

// ============================================================================
// Server Errors
// ============================================================================

/// Server errors
#[derive(Debug, Clone)]
pub enum ServerError {
    /// Configuration error
    ConfigError(String),

    /// Initialization error
    InitError(String),

    /// Failed to bind to address
    BindError(String),

    /// Server error
    ServeError(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            Self::InitError(msg) => write!(f, "Initialization error: {}", msg),
            Self::BindError(msg) => write!(f, "Failed to bind: {}", msg),
            Self::ServeError(msg) => write!(f, "Server error: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fleet::FleetContext;

    fn fleet(config: Config) -> Fleet {
        let context = FleetContext::in_memory(config).unwrap();
        Fleet::init(context).unwrap()
    }

    #[test]
    fn test_server_creation() {
        let server = FleetServer::new(fleet(Config::default()));
        assert!(server.is_ok());
    }

    #[test]
    fn test_server_info() {
        let server = FleetServer::new(fleet(Config::default())).unwrap();
        let info = server.info();

        assert_eq!(info.poll_interval_secs, 10);
        assert!(info.cors_enabled);
        assert!(info.display().contains("estimate only"));
    }

    #[test]
    fn test_invalid_server_config_rejected() {
        let mut config = Config::default();
        config.server.sse_keep_alive_secs = 0;

        let err = FleetServer::new(fleet(config)).err().unwrap();
        assert!(matches!(err, ServerError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_app_state_components() {
        let server = FleetServer::new(fleet(Config::default())).unwrap();
        let state = server.state();

        assert!(state.fleet.list_devices(true).unwrap().is_empty());
        assert!(state.fleet.scheduler.list_queue().unwrap().is_empty());
    }
}
