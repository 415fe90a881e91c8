//! HTTP client for printer status queries and start signals
//!
//! Devices expose a small JSON API:
//!
//! ```text
//! GET  {base}/api/status     -> {"state": "printing", "temperature": {"extruder": 210.0, "bed": 60.0},
//!                                "progress": 42.5, "fan_speed": 100.0}
//! POST {base}/api/job/start  <- {"job_id": "...", "name": "..."}
//! ```

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::models::{Device, WorkUnit};

// ============================================================================
// Wire Types
// ============================================================================

/// Raw status payload reported by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorStatus {
    /// Vendor state string, mapped with `DeviceStatus::from_vendor`
    pub state: String,
    #[serde(default)]
    pub temperature: Temperatures,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub fan_speed: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Temperatures {
    #[serde(default)]
    pub extruder: f64,
    #[serde(default)]
    pub bed: f64,
}

#[derive(Debug, Serialize)]
struct StartRequest<'a> {
    job_id: &'a str,
    name: &'a str,
}

// ============================================================================
// Probe Errors
// ============================================================================

/// Transport-level failures talking to a device or meter
#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    #[error("HTTP client initialization failed: {0}")]
    Init(String),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected HTTP status {status}")]
    HttpStatus { status: u16 },

    #[error("malformed response: {0}")]
    Decode(String),
}

impl ProbeError {
    /// Transport errors clear up on their own; a broken client does not
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Init(_))
    }
}

impl From<reqwest::Error> for ProbeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

// ============================================================================
// Device Client
// ============================================================================

/// Status query and start signal for one device
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Fetch the device's current status
    async fn query_status(&self, device: &Device) -> Result<VendorStatus, ProbeError>;

    /// Tell the device to begin a job
    async fn start_job(&self, device: &Device, job: &WorkUnit) -> Result<(), ProbeError>;
}

/// reqwest-backed device client
#[derive(Debug, Clone)]
pub struct HttpDeviceClient {
    http_client: Client,
}

impl HttpDeviceClient {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("printfleet/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProbeError::Init(e.to_string()))?;

        Ok(Self { http_client })
    }
}

#[async_trait]
impl DeviceClient for HttpDeviceClient {
    async fn query_status(&self, device: &Device) -> Result<VendorStatus, ProbeError> {
        let url = format!("{}/api/status", device.base_url());
        let response = self.http_client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(ProbeError::HttpStatus {
                status: response.status().as_u16(),
            });
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| ProbeError::Decode(e.to_string()))
    }

    async fn start_job(&self, device: &Device, job: &WorkUnit) -> Result<(), ProbeError> {
        let url = format!("{}/api/job/start", device.base_url());
        let response = self
            .http_client
            .post(&url)
            .json(&StartRequest {
                job_id: &job.id,
                name: &job.name,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProbeError::HttpStatus {
                status: response.status().as_u16(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_status_lenient_fields() {
        let status: VendorStatus = serde_json::from_str(r#"{"state": "Operational"}"#).unwrap();
        assert_eq!(status.state, "Operational");
        assert_eq!(status.temperature, Temperatures::default());
        assert_eq!(status.progress, 0.0);
    }

    #[test]
    fn test_vendor_status_requires_state() {
        let result = serde_json::from_str::<VendorStatus>(r#"{"progress": 10.0}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_probe_error_recoverable() {
        assert!(ProbeError::Timeout.is_recoverable());
        assert!(ProbeError::HttpStatus { status: 500 }.is_recoverable());
        assert!(!ProbeError::Init("tls".to_string()).is_recoverable());
    }

    #[test]
    fn test_client_creation() {
        assert!(HttpDeviceClient::new(Duration::from_secs(2)).is_ok());
    }
}
