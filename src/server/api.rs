//! REST API handlers for the fleet server
//!
//! This module defines the API routes, the response envelope and the
//! mapping from domain errors to HTTP status codes.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use crate::energy::{EnergyState, SettingsUpdate};
use crate::error::{Error, ErrorCategory, FleetErrorTrait};
use crate::fleet::FleetSummary;
use crate::metrics;
use crate::models::{
    Conflict, Device, DeviceReading, EnergyReading, EnergySettings, JobStatus, NewDevice,
    NewWorkUnit, PowerEvent, Priority, QueueEntry, Resolution, WorkUnit,
};
use crate::scheduler::{Assignment, SchedulerError};

use super::server::AppState;

// ============================================================================
// API Response Types
// ============================================================================

/// Generic API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Error body; `details` carries structured context such as the load reading
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
            category: None,
            details: None,
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub fleet: FleetSummary,
}

/// Admission refusal details
#[derive(Debug, Serialize)]
struct AdmissionDetails<'a> {
    reading: &'a EnergyReading,
    threshold_kw: f64,
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::success(data)))
}

// ============================================================================
// Error mapping
// ============================================================================

/// Handler error; renders as [`ErrorResponse`] with a category-derived status
#[derive(Debug)]
pub struct ApiError(Error);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0.category() {
            ErrorCategory::NotFound => StatusCode::NOT_FOUND,
            ErrorCategory::Conflict => StatusCode::CONFLICT,
            ErrorCategory::Admission => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCategory::Validation => StatusCode::BAD_REQUEST,
            ErrorCategory::Transport => StatusCode::BAD_GATEWAY,
            ErrorCategory::Storage => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match &self.0 {
            Error::Scheduler(SchedulerError::EnergyThreshold {
                reading,
                threshold_kw,
            }) => serde_json::to_value(AdmissionDetails {
                reading,
                threshold_kw: *threshold_kw,
            })
            .ok(),
            Error::Scheduler(SchedulerError::AlreadyAssigned { device_id, status, .. }) => {
                Some(serde_json::json!({ "status": status, "device_id": device_id }))
            }
            _ => None,
        }
    }
}

impl<E: Into<Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(error = %self.0, "Request failed");
        } else {
            tracing::debug!(error = %self.0, status = status.as_u16(), "Request rejected");
        }

        let body = ErrorResponse {
            success: false,
            error: self.0.to_string(),
            category: Some(self.0.category().as_str()),
            details: self.details(),
        };
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListDevicesQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub device_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PriorityRequest {
    pub priority: Priority,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: JobStatus,
}

#[derive(Debug, Deserialize)]
pub struct ConflictsQuery {
    #[serde(default)]
    pub open: bool,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub resolution: Resolution,
}

/// Comma-separated topic filter for the event stream
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub topics: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub job: WorkUnit,
    pub entry: QueueEntry,
}

// ============================================================================
// API Routes
// ============================================================================

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/api/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        // Device endpoints
        .route("/api/devices", get(list_devices).post(create_device))
        .route("/api/devices/{id}", get(get_device).delete(deactivate_device))
        .route("/api/devices/{id}/history", get(device_history))
        // Queue endpoints
        .route("/api/queue", get(list_queue).post(enqueue))
        .route("/api/queue/{id}", axum::routing::delete(remove_entry))
        .route("/api/queue/{id}/assign", post(assign))
        .route("/api/queue/{id}/priority", put(change_priority))
        // Job endpoints
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/status", post(update_job_status))
        // Energy endpoints
        .route("/api/energy", get(energy_state))
        .route("/api/energy/settings", put(update_energy_settings))
        .route("/api/energy/history", get(energy_history))
        .route("/api/energy/events", get(power_events))
        // Conflict endpoints
        .route("/api/conflicts", get(list_conflicts))
        .route("/api/conflicts/{id}/resolve", post(resolve_conflict))
        // Event stream
        .route("/api/events", get(event_stream))
        .with_state(state)
}

// ============================================================================
// Health Handlers
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> ApiResult<HealthResponse> {
    let fleet = state.fleet.summary()?;
    ok(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        fleet,
    })
}

/// Prometheus text exposition
async fn metrics_handler() -> Response {
    match metrics::encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new(format!("Failed to encode metrics: {e}"))),
        )
            .into_response(),
    }
}

// ============================================================================
// Device Handlers
// ============================================================================

async fn list_devices(
    State(state): State<AppState>,
    Query(query): Query<ListDevicesQuery>,
) -> ApiResult<Vec<Device>> {
    ok(state.fleet.list_devices(query.include_inactive)?)
}

async fn create_device(
    State(state): State<AppState>,
    Json(request): Json<NewDevice>,
) -> Result<(StatusCode, Json<ApiResponse<Device>>), ApiError> {
    let device = state.fleet.create_device(&request)?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(device))))
}

async fn get_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Device> {
    ok(state.fleet.get_device(&id)?)
}

async fn deactivate_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Device> {
    ok(state.fleet.deactivate_device(&id)?)
}

async fn device_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<DeviceReading>> {
    let limit = query.limit.unwrap_or(state.config.default_history_limit);
    ok(state.fleet.get_device_history(&id, limit)?)
}

// ============================================================================
// Queue Handlers
// ============================================================================

async fn list_queue(State(state): State<AppState>) -> ApiResult<Vec<QueueEntry>> {
    ok(state.fleet.scheduler.list_queue()?)
}

async fn enqueue(
    State(state): State<AppState>,
    Json(request): Json<NewWorkUnit>,
) -> Result<(StatusCode, Json<ApiResponse<EnqueueResponse>>), ApiError> {
    let (job, entry) = state.fleet.scheduler.enqueue(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(EnqueueResponse { job, entry })),
    ))
}

/// Manual assignment; goes through the same admission gate as a tick
async fn assign(
    State(state): State<AppState>,
    Path(entry_id): Path<String>,
    Json(request): Json<AssignRequest>,
) -> ApiResult<Assignment> {
    ok(state
        .fleet
        .scheduler
        .assign(&entry_id, &request.device_id)
        .await?)
}

async fn change_priority(
    State(state): State<AppState>,
    Path(entry_id): Path<String>,
    Json(request): Json<PriorityRequest>,
) -> ApiResult<QueueEntry> {
    ok(state
        .fleet
        .scheduler
        .change_priority(&entry_id, request.priority)
        .await?)
}

async fn remove_entry(
    State(state): State<AppState>,
    Path(entry_id): Path<String>,
) -> ApiResult<QueueEntry> {
    ok(state.fleet.scheduler.remove(&entry_id).await?)
}

// ============================================================================
// Job Handlers
// ============================================================================

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<WorkUnit> {
    ok(state.fleet.scheduler.get_job(&id)?)
}

async fn update_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<StatusRequest>,
) -> ApiResult<WorkUnit> {
    ok(state
        .fleet
        .scheduler
        .update_job_status(&id, request.status)
        .await?)
}

// ============================================================================
// Energy Handlers
// ============================================================================

async fn energy_state(State(state): State<AppState>) -> ApiResult<EnergyState> {
    ok(state.fleet.energy.get_energy_state()?)
}

async fn update_energy_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> ApiResult<EnergySettings> {
    ok(state.fleet.energy.patch_settings(&update)?)
}

async fn energy_history(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<EnergyReading>> {
    let limit = query.limit.unwrap_or(state.config.default_history_limit);
    ok(state.fleet.energy.energy_history(limit)?)
}

async fn power_events(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<PowerEvent>> {
    let limit = query.limit.unwrap_or(state.config.default_history_limit);
    ok(state.fleet.energy.list_power_events(limit)?)
}

// ============================================================================
// Conflict Handlers
// ============================================================================

async fn list_conflicts(
    State(state): State<AppState>,
    Query(query): Query<ConflictsQuery>,
) -> ApiResult<Vec<Conflict>> {
    ok(state.fleet.scheduler.list_conflicts(query.open)?)
}

async fn resolve_conflict(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> ApiResult<Conflict> {
    ok(state
        .fleet
        .scheduler
        .resolve_conflict(&id, request.resolution)
        .await?)
}

// ============================================================================
// Event Stream
// ============================================================================

/// Server-Sent Events over the fleet bus; slow clients skip what they missed
async fn event_stream(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let topics = parse_topics(query.topics.as_deref());
    let rx = state.fleet.context.events.subscribe();

    let stream = stream::unfold((rx, topics), |(mut rx, topics)| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let topic = event.topic();
                    if !topics.is_empty() && !topics.iter().any(|t| t == topic) {
                        continue;
                    }
                    match Event::default().event(topic).json_data(&event) {
                        Ok(sse) => return Some((Ok(sse), (rx, topics))),
                        Err(e) => {
                            tracing::warn!(topic, error = %e, "Failed to encode event");
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new().interval(Duration::from_secs(state.config.sse_keep_alive_secs)),
    )
}

fn parse_topics(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

// ============================================================================
// Tests
// ============================================================================
