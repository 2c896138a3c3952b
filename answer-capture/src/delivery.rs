//! HTTP delivery of new units to the processing endpoint.

use crate::config::DeliveryConfig;
use crate::types::{ContentUnit, DeliveryPayload};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("endpoint returned HTTP {0}")]
    HttpStatus(u16),

    #[error("request failed: {0}")]
    Network(#[source] reqwest::Error),

    #[error("response body is not JSON: {0}")]
    Decode(#[source] reqwest::Error),
}

/// Posts one JSON payload per unit
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    http: reqwest::Client,
    endpoint: String,
    source: String,
}

impl DeliveryClient {
    pub fn new(endpoint: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            source: source.into(),
        }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(&config.endpoint, &config.source)
    }

    pub fn payload_for(&self, unit: &ContentUnit) -> DeliveryPayload {
        DeliveryPayload {
            source: self.source.clone(),
            content: unit.text.clone(),
        }
    }

    /// POST the unit and decode the JSON response.
    ///
    /// Any non-2xx status is an error regardless of body.
    pub async fn deliver(&self, unit: &ContentUnit) -> Result<Value, DeliveryError> {
        let payload = self.payload_for(unit);
        debug!(
            "Delivering unit {} ({} chars) to {}",
            unit.source_index,
            unit.char_count(),
            self.endpoint
        );

        let response = self
            .http
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(DeliveryError::Network)?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::HttpStatus(status.as_u16()));
        }

        response.json::<Value>().await.map_err(DeliveryError::Decode)
    }
}

/// Outcome of one delivery attempt
#[derive(Debug)]
pub struct DeliveryReport {
    pub source_index: usize,
    pub result: Result<Value, DeliveryError>,
}

impl DeliveryReport {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Deliveries spawned by one run.
///
/// Dropping the handle leaves the tasks running to completion.
#[derive(Debug, Default)]
pub struct DeliveryHandle {
    tasks: Vec<JoinHandle<DeliveryReport>>,
}

impl DeliveryHandle {
    /// Start one independent delivery per unit. Failures are logged and
    /// never reach the caller.
    pub fn spawn_all(client: &Arc<DeliveryClient>, units: &[ContentUnit]) -> Self {
        let tasks = units
            .iter()
            .cloned()
            .map(|unit| {
                let client = Arc::clone(client);
                tokio::spawn(async move {
                    let result = client.deliver(&unit).await;
                    match &result {
                        Ok(_) => info!("Delivered unit {}: {}", unit.source_index, unit.preview(100)),
                        Err(e) => error!("Delivery of unit {} failed: {}", unit.source_index, e),
                    }
                    DeliveryReport {
                        source_index: unit.source_index,
                        result,
                    }
                })
            })
            .collect();
        Self { tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every delivery; reports keep the order units were spawned in
    pub async fn wait(self) -> Vec<DeliveryReport> {
        let mut reports = Vec::with_capacity(self.tasks.len());
        for task in self.tasks {
            match task.await {
                Ok(report) => reports.push(report),
                Err(e) => warn!("Delivery task did not complete: {}", e),
            }
        }
        reports
    }
}
