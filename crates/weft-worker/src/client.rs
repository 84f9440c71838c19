//! HTTP client for the worker protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use weft_core::{CwlValue, Error, Result, ResourceId, Task, TaskError};

/// Response envelope shared by every endpoint.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    #[serde(default)]
    data: Option<T>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    /// Report retries on 5xx.
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Disable TLS verification; testing only.
    pub insecure_skip_verify: bool,
    pub ca_bundle: Option<std::path::PathBuf>,
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    max_retries: u32,
    retry_delay: Duration,
}

#[derive(Debug, Serialize)]
pub struct RegisterRequest {
    pub name: String,
    pub hostname: String,
    pub runtime: String,
    pub group: String,
    pub key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RegisterData {
    worker_id: ResourceId,
}

#[derive(Debug, Serialize)]
pub struct ReportRequest {
    pub task_id: ResourceId,
    pub outputs: BTreeMap<String, CwlValue>,
    pub exit_code: Option<i32>,
    pub logs_ref: Option<String>,
    pub error: Option<TaskError>,
}

#[derive(Debug, Default, Deserialize)]
struct HeartbeatData {
    renewed: bool,
}

/// Build a reqwest client honouring the TLS knobs.
pub fn build_http_client(config: &ClientConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(config.timeout);
    if config.insecure_skip_verify {
        warn!("TLS verification disabled; use only for testing");
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(bundle) = &config.ca_bundle {
        let pem = read_bundle(bundle)?;
        builder = builder.add_root_certificate(pem);
    }
    builder
        .build()
        .map_err(|e| Error::System(format!("http client: {e}")))
}

fn read_bundle(path: &Path) -> Result<reqwest::Certificate> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::System(format!("reading {}: {e}", path.display())))?;
    reqwest::Certificate::from_pem(&bytes)
        .map_err(|e| Error::Validation(format!("ca bundle {}: {e}", path.display())))
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = build_http_client(&config)?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
        })
    }

    /// Register this agent. A 401 means the key was rejected; the agent
    /// must exit.
    pub async fn register(&self, request: &RegisterRequest) -> Result<ResourceId> {
        let url = format!("{}/api/v1/workers/register", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::System(format!("register: {e}")))?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Validation("registration rejected (401)".into()));
        }
        let envelope: Envelope<RegisterData> = response
            .json()
            .await
            .map_err(|e| Error::System(format!("register body: {e}")))?;
        envelope
            .data
            .map(|d| d.worker_id)
            .ok_or_else(|| Error::System("register: empty response".into()))
    }

    /// Long-poll for a task; `None` means the window elapsed empty.
    pub async fn lease(
        &self,
        worker_id: ResourceId,
        groups: &[String],
        poll: Duration,
    ) -> Result<Option<Task>> {
        let mut url = format!(
            "{}/api/v1/workers/{worker_id}/lease?poll={}",
            self.base_url,
            poll.as_secs()
        );
        if !groups.is_empty() {
            url.push_str(&format!("&groups={}", urlencoding::encode(&groups.join(","))));
        }
        let response = self
            .http
            .post(&url)
            // The server holds the request up to the poll window.
            .timeout(poll + Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Error::System(format!("lease: {e}")))?
            .error_for_status()
            .map_err(|e| Error::System(format!("lease: {e}")))?;
        let envelope: Envelope<Option<Task>> = response
            .json()
            .await
            .map_err(|e| Error::System(format!("lease body: {e}")))?;
        Ok(envelope.data.flatten())
    }

    /// Report a task result, retrying 5xx with exponential backoff.
    pub async fn report(&self, worker_id: ResourceId, request: &ReportRequest) -> Result<()> {
        let url = format!("{}/api/v1/workers/{worker_id}/report", self.base_url);
        let mut delay = self.retry_delay;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self.http.post(&url).json(request).send().await;
            match result {
                Ok(response) if response.status().is_success() => {
                    let _: Envelope<Json> = response
                        .json()
                        .await
                        .map_err(|e| Error::System(format!("report body: {e}")))?;
                    return Ok(());
                }
                Ok(response) if response.status().is_server_error() => {
                    warn!(status = %response.status(), attempt, "report failed");
                }
                Ok(response) => {
                    return Err(Error::System(format!(
                        "report rejected with {}",
                        response.status()
                    )));
                }
                Err(e) => warn!(error = %e, attempt, "report transport error"),
            }
            if attempt > self.max_retries {
                return Err(Error::System(format!(
                    "report gave up after {attempt} attempts"
                )));
            }
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    /// Renew the lease on a running task; false means the lease is gone
    /// and the task will be re-queued.
    pub async fn heartbeat(&self, worker_id: ResourceId, task_id: ResourceId) -> Result<bool> {
        let url = format!("{}/api/v1/workers/{worker_id}/heartbeat", self.base_url);
        let envelope: Envelope<HeartbeatData> = self
            .http
            .post(&url)
            .json(&serde_json::json!({"task_id": task_id}))
            .send()
            .await
            .map_err(|e| Error::System(format!("heartbeat: {e}")))?
            .json()
            .await
            .map_err(|e| Error::System(format!("heartbeat body: {e}")))?;
        if envelope.status != "ok" {
            return Ok(false);
        }
        Ok(envelope.data.map(|d| d.renewed).unwrap_or(false))
    }
}
