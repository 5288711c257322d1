//! Production control-plane transport backed by reqwest.

use crate::error::EnvError;
use crate::routes::{self, NO_SCENARIO};
use crate::transport::ControlTransport;
use crate::types::{ControlResponse, ScenarioDescriptor, StartResponse};
use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// HTTP client for the scenario control API.
///
/// All routes are resolved against `base_url`; the stream URL uses the
/// same host.
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpTransport {
    /// Default per-request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a transport for the server at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, EnvError> {
        Self::with_timeout(base_url, Self::DEFAULT_TIMEOUT)
    }

    /// Creates a transport with a custom request timeout.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, EnvError> {
        let base_url = Url::parse(base_url).map_err(EnvError::invalid_url)?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EnvError::network(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, EnvError> {
        self.base_url.join(path).map_err(EnvError::invalid_url)
    }

    fn request_failed(&self, op: &str, err: reqwest::Error) -> EnvError {
        error!("{} request failed: {}", op, err);
        if err.is_timeout() {
            EnvError::Timeout(self.timeout.as_millis() as u64)
        } else {
            EnvError::network(err.to_string())
        }
    }

    async fn control_response(&self, op: &str, response: Response) -> Result<ControlResponse, EnvError> {
        let status = response.status();
        let body = read_body(response).await.map_err(|e| self.request_failed(op, e))?;
        if !status.is_success() {
            warn!("{} rejected with status {}", op, status);
        }

        Ok(ControlResponse {
            status: status.as_u16(),
            ok: status.is_success(),
            body,
        })
    }
}

/// Reads a body as JSON; empty bodies become `null`, non-JSON text a string.
async fn read_body(response: Response) -> Result<Value, reqwest::Error> {
    let text = response.text().await?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

#[async_trait]
impl ControlTransport for HttpTransport {
    async fn start(&self, options: &Value) -> Result<StartResponse, EnvError> {
        let url = self.endpoint(routes::START_PATH)?;
        debug!("POST {}", url);

        let response = self
            .client
            .post(url)
            .json(options)
            .send()
            .await
            .map_err(|e| self.request_failed("start", e))?;

        let status = response.status();
        let stream_locator = routes::locator_from_headers(response.headers());
        let body = read_body(response).await.map_err(|e| self.request_failed("start", e))?;

        if !status.is_success() {
            warn!("start rejected with status {}", status);
        } else if stream_locator.is_none() {
            info!("start succeeded without a {} header", routes::STREAM_HEADER);
        }

        let descriptor = ScenarioDescriptor::from_body(&body);

        Ok(StartResponse {
            status: status.as_u16(),
            ok: status.is_success(),
            stream_locator,
            descriptor,
            body,
        })
    }

    async fn stop(&self, descriptor: Option<&ScenarioDescriptor>) -> Result<ControlResponse, EnvError> {
        if descriptor.is_none() {
            warn!("stop requested with no active scenario, using {}", NO_SCENARIO);
        }

        let url = self.endpoint(&routes::stop_path(descriptor.map(|d| &d.id)))?;
        let body = match descriptor {
            Some(d) => serde_json::to_value(d)?,
            None => json!({}),
        };
        debug!("PATCH {}", url);

        let response = self
            .client
            .patch(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.request_failed("stop", e))?;

        self.control_response("stop", response).await
    }

    async fn panic(&self) -> Result<ControlResponse, EnvError> {
        let url = self.endpoint(routes::PANIC_PATH)?;
        warn!("PUT {} (emergency stop)", url);

        let response = self
            .client
            .put(url)
            .send()
            .await
            .map_err(|e| self.request_failed("panic", e))?;

        self.control_response("panic", response).await
    }

    fn stream_url(&self, locator: &str) -> Result<String, EnvError> {
        routes::stream_url(&self.base_url, locator)
    }
}
