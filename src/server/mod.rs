//! HTTP surface for the printer fleet
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              Fleet Server                │
//! │                                          │
//! │  ┌───────────────────────────────────┐   │
//! │  │  Background loops (Fleet::start)  │   │
//! │  │  - Device polling                 │   │
//! │  │  - Load sampling                  │   │
//! │  │  - Matching tick                  │   │
//! │  └───────────────────────────────────┘   │
//! │                                          │
//! │  ┌───────────────────────────────────┐   │
//! │  │            REST API               │   │
//! │  │  GET  /api/health                 │   │
//! │  │  GET  /api/devices                │   │
//! │  │  GET  /api/devices/{id}/history   │   │
//! │  │  POST /api/queue                  │   │
//! │  │  POST /api/queue/{id}/assign      │   │
//! │  │  PUT  /api/queue/{id}/priority    │   │
//! │  │  GET  /api/energy                 │   │
//! │  │  PUT  /api/energy/settings        │   │
//! │  │  GET  /api/conflicts              │   │
//! │  │  GET  /api/events  (SSE)          │   │
//! │  │  GET  /metrics                    │   │
//! │  └───────────────────────────────────┘   │
//! └──────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use printfleet::fleet::{Fleet, FleetContext};
//! use printfleet::server::FleetServer;
//!
//! let fleet = Fleet::init(FleetContext::init(config)?)?;
//! let server = FleetServer::new(fleet)?;
//! server.start_with_shutdown(shutdown_signal()).await?;
//! ```

pub mod api;
pub mod config;
pub mod server;

// Re-export main types
pub use api::{create_router, ApiError, ApiResponse, ErrorResponse};
pub use config::ServerConfig;
pub use server::{AppState, FleetServer, ServerError, ServerInfo};
