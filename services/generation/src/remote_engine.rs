//! Engine backend that drives a model hosted by an HTTP inference worker.
//!
//! Worker API:
//!
//! - `GET  /v1/devices` → `{"accelerator": bool}`
//! - `POST /v1/engines` `{model_id, device, precision}` → `{"engine_id": str}`
//! - `POST /v1/engines/{engine_id}/render` → image bytes
//!
//! Failures carry `{"kind", "message"}`. HTTP 507 always means the device
//! ran out of memory.

use crate::config::RemoteEngineConfig;
use crate::engine::{
    Device, EngineError, EngineFactory, EngineSpec, InferenceEngine, MemorySaver, Precision,
    RenderParams,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client as HttpClient, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct DevicesResponse {
    accelerator: bool,
}

#[derive(Debug, Serialize)]
struct CreateEngineRequest<'a> {
    model_id: &'a str,
    device: Device,
    precision: Precision,
}

#[derive(Debug, Deserialize)]
struct CreateEngineResponse {
    engine_id: String,
}

#[derive(Debug, Serialize)]
struct RenderRequest<'a> {
    prompt: &'a str,
    negative_prompt: Option<&'a str>,
    width: u32,
    height: u32,
    steps: u32,
    guidance: f32,
    seed: Option<u64>,
    memory_savers: &'a [MemorySaver],
}

#[derive(Debug, Deserialize)]
struct WorkerError {
    kind: Option<String>,
    message: String,
}

pub struct RemoteEngineFactory {
    http: HttpClient,
    endpoint: String,
}

impl RemoteEngineFactory {
    pub fn new(config: &RemoteEngineConfig) -> Result<Self> {
        let endpoint = config
            .endpoint_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .context("engine.remote.endpoint_url is required for the remote backend")?;

        let http = HttpClient::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl EngineFactory for RemoteEngineFactory {
    async fn accelerator_available(&self) -> bool {
        let url = format!("{}/v1/devices", self.endpoint);
        let response = match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(status = %response.status(), "Device probe rejected, assuming no accelerator");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Inference worker unreachable, assuming no accelerator");
                return false;
            }
        };

        match response.json::<DevicesResponse>().await {
            Ok(devices) => devices.accelerator,
            Err(e) => {
                warn!(error = %e, "Malformed device probe response, assuming no accelerator");
                false
            }
        }
    }

    async fn build(&self, spec: &EngineSpec) -> Result<Box<dyn InferenceEngine>, EngineError> {
        let response = self
            .http
            .post(format!("{}/v1/engines", self.endpoint))
            .json(&CreateEngineRequest {
                model_id: &spec.model_id,
                device: spec.device,
                precision: spec.precision,
            })
            .send()
            .await
            .map_err(transport_error)?;

        let created: CreateEngineResponse = checked(response)
            .await?
            .json()
            .await
            .map_err(transport_error)?;

        info!(
            engine_id = %created.engine_id,
            device = %spec.device,
            precision = %spec.precision,
            "Remote engine loaded"
        );

        Ok(Box::new(RemoteEngine {
            http: self.http.clone(),
            render_url: format!("{}/v1/engines/{}/render", self.endpoint, created.engine_id),
            spec: spec.clone(),
            savers: Vec::new(),
        }))
    }
}

pub struct RemoteEngine {
    http: HttpClient,
    render_url: String,
    spec: EngineSpec,
    savers: Vec<MemorySaver>,
}

#[async_trait]
impl InferenceEngine for RemoteEngine {
    fn spec(&self) -> &EngineSpec {
        &self.spec
    }

    fn enable_memory_saver(&mut self, saver: MemorySaver) -> Result<(), EngineError> {
        // The worker applies savers per render; xformers only exists on CUDA builds
        if saver == MemorySaver::XformersAttention && self.spec.device != Device::Cuda {
            return Err(EngineError::Incompatible(
                "xformers attention requires a CUDA engine".to_string(),
            ));
        }
        if !self.savers.contains(&saver) {
            self.savers.push(saver);
        }
        Ok(())
    }

    async fn render(&self, params: &RenderParams) -> Result<Vec<u8>, EngineError> {
        debug!(url = %self.render_url, width = params.width, height = params.height, "Remote render");

        let response = self
            .http
            .post(&self.render_url)
            .json(&RenderRequest {
                prompt: &params.prompt,
                negative_prompt: params.negative_prompt.as_deref(),
                width: params.width,
                height: params.height,
                steps: params.steps,
                guidance: params.guidance,
                seed: params.seed,
                memory_savers: &self.savers,
            })
            .send()
            .await
            .map_err(transport_error)?;

        let bytes = checked(response)
            .await?
            .bytes()
            .await
            .map_err(transport_error)?;

        Ok(bytes.to_vec())
    }
}

fn transport_error(e: reqwest::Error) -> EngineError {
    EngineError::Other(format!("inference worker request failed: {e}"))
}

/// Pass successful responses through, classify the rest
async fn checked(response: Response) -> Result<Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify_failure(status, &body))
}

fn classify_failure(status: StatusCode, body: &str) -> EngineError {
    let (kind, message) = match serde_json::from_str::<WorkerError>(body) {
        Ok(error) => (error.kind, error.message),
        Err(_) if body.is_empty() => (None, format!("inference worker returned {status}")),
        Err(_) => (None, body.to_string()),
    };

    match kind.as_deref() {
        Some("resource_exhausted") => EngineError::ResourceExhausted(message),
        Some("incompatible") => EngineError::Incompatible(message),
        _ if status == StatusCode::INSUFFICIENT_STORAGE => EngineError::ResourceExhausted(message),
        _ => EngineError::classify(message),
    }
}
