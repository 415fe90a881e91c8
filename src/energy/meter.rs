//! External power meter client
//!
//! A meter answers `GET {url}` with `{"power_kw": 3.2}` (`current_kw` is
//! accepted as an alias).

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::tracker::ProbeError;

/// Source of whole-site load measurements
#[async_trait]
pub trait MeterClient: Send + Sync {
    /// Current aggregate draw in kW
    async fn read_kw(&self) -> Result<f64, ProbeError>;
}

#[derive(Debug, Deserialize)]
struct MeterPayload {
    #[serde(alias = "current_kw")]
    power_kw: f64,
}

/// reqwest-backed meter client
#[derive(Debug, Clone)]
pub struct HttpMeterClient {
    url: String,
    http_client: Client,
}

impl HttpMeterClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ProbeError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Init(e.to_string()))?;

        Ok(Self {
            url: url.into(),
            http_client,
        })
    }
}

#[async_trait]
impl MeterClient for HttpMeterClient {
    async fn read_kw(&self) -> Result<f64, ProbeError> {
        let response = self.http_client.get(&self.url).send().await?;

        if !response.status().is_success() {
            return Err(ProbeError::HttpStatus {
                status: response.status().as_u16(),
            });
        }

        let body = response.text().await?;
        let payload: MeterPayload =
            serde_json::from_str(&body).map_err(|e| ProbeError::Decode(e.to_string()))?;

        if !payload.power_kw.is_finite() || payload.power_kw < 0.0 {
            return Err(ProbeError::Decode(format!(
                "implausible meter value {}",
                payload.power_kw
            )));
        }

        Ok(payload.power_kw)
    }
}
