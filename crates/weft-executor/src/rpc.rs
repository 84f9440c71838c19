//! Remote-service executor: JSON-RPC 1.1 over HTTP POST.
//!
//! Submits the task to an external application service, polls task
//! status, and returns on a terminal state. Retryable failures follow
//! the shared `RpcError` code list.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use weft_core::{
    CwlValue, DispatchMode, Error, ExecError, ExecErrorKind, Executor, Result, RpcError,
    RunContext, RunOutcome, Task, TaskHints,
};

use crate::token::discover_token;

pub const RPC_EXECUTOR_NAME: &str = "bvbrc";

#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Endpoint of the application service.
    pub url: String,
    /// Status poll cadence.
    pub poll_interval: Duration,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// Explicit token; discovery runs when absent.
    pub token: Option<String>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: "https://p3.theseed.org/services/app_service".to_string(),
            poll_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            token: None,
        }
    }
}

pub struct RpcExecutor {
    client: reqwest::Client,
    url: String,
    poll_interval: Duration,
    token: Option<String>,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    id: String,
    method: &'a str,
    version: &'static str,
    params: Json,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Json>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    name: String,
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

impl RpcExecutor {
    pub fn new(config: RpcConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::System(format!("http client: {e}")))?;
        let token = config
            .token
            .clone()
            .or_else(|| discover_token("BVBRC", "bvbrc"));
        Ok(Self {
            client,
            url: config.url,
            poll_interval: config.poll_interval,
            token,
        })
    }

    async fn call(&self, method: &str, params: Json) -> Result<Json> {
        let request = RpcRequest {
            id: Uuid::new_v4().to_string(),
            method,
            version: "1.1",
            params,
        };
        let mut builder = self.client.post(&self.url).json(&request);
        if let Some(token) = &self.token {
            builder = builder.header(reqwest::header::AUTHORIZATION, token.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ExecError::transport(format!("{method}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(RpcError {
                code: status.as_u16() as i64,
                name: "HttpError".to_string(),
                message: format!("{method} returned {status}"),
            }
            .into());
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| ExecError::transport(format!("{method} body: {e}")))?;
        if let Some(error) = body.error {
            return Err(RpcError {
                code: error.code,
                name: error.name,
                message: error.message,
            }
            .into());
        }
        body.result
            .ok_or_else(|| Error::System(format!("{method}: response had no result")))
    }

    /// Submit the task; returns the remote task id.
    async fn start_app(&self, app_id: &str, task: &Task) -> Result<String> {
        let inputs: Json = task
            .inputs
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect::<serde_json::Map<String, Json>>()
            .into();
        let result = self
            .call("AppService.start_app", json!([app_id, inputs, {}]))
            .await?;
        extract_remote_id(&result)
            .ok_or_else(|| Error::System(format!("start_app returned no task id: {result}")))
    }

    async fn query_status(&self, remote_id: &str) -> Result<String> {
        let result = self
            .call("AppService.query_tasks", json!([[remote_id]]))
            .await?;
        // Result is a map (possibly wrapped in a one-element array) from
        // task id to its record.
        let record = match &result {
            Json::Array(items) => items.first().and_then(|m| m.get(remote_id)),
            other => other.get(remote_id),
        };
        Ok(record
            .and_then(|r| r.get("status"))
            .and_then(Json::as_str)
            .unwrap_or("unknown")
            .to_string())
    }
}

fn extract_remote_id(result: &Json) -> Option<String> {
    let record = match result {
        Json::Array(items) => items.first()?,
        other => other,
    };
    record
        .get("id")
        .map(|id| match id {
            Json::String(s) => s.clone(),
            other => other.to_string(),
        })
}

#[async_trait]
impl Executor for RpcExecutor {
    fn name(&self) -> &'static str {
        RPC_EXECUTOR_NAME
    }

    fn supports(&self, hints: &TaskHints) -> bool {
        hints.executor.as_deref() == Some(RPC_EXECUTOR_NAME) || hints.bvbrc_app_id.is_some()
    }

    fn dispatch_mode(&self) -> DispatchMode {
        DispatchMode::Pooled
    }

    async fn run(&self, ctx: RunContext, task: &Task) -> Result<RunOutcome> {
        let app_id = task
            .hints
            .bvbrc_app_id
            .clone()
            .ok_or_else(|| Error::Validation("remote-service task has no bvbrc_app_id".into()))?;

        let remote_id = self.start_app(&app_id, task).await?;
        info!(task_id = %task.id, remote_id = %remote_id, app_id = %app_id, "submitted to app service");

        let started = tokio::time::Instant::now();
        let mut cancel = ctx.cancel.clone();
        loop {
            let status = self.query_status(&remote_id).await?;
            debug!(remote_id = %remote_id, status = %status, "remote task status");
            match status.as_str() {
                "completed" => {
                    let outputs = std::collections::BTreeMap::from([(
                        "remote_task_id".to_string(),
                        CwlValue::String(remote_id.clone()),
                    )]);
                    return Ok(RunOutcome {
                        outputs,
                        exit_code: 0,
                        logs_ref: Some(format!("{}#{remote_id}", self.url)),
                    });
                }
                "failed" | "deleted" => {
                    return Err(ExecError::new(
                        ExecErrorKind::NonZeroExit,
                        format!("remote task {remote_id} ended as {status}"),
                    )
                    .into());
                }
                _ => {}
            }

            if let Some(limit) = ctx.timeout {
                if started.elapsed() >= limit {
                    return Err(ExecError::new(
                        ExecErrorKind::Timeout,
                        format!("remote task {remote_id} exceeded {}s", limit.as_secs()),
                    )
                    .into());
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = rpc_cancelled(&mut cancel) => {
                    return Err(
                        ExecError::new(ExecErrorKind::Cancelled, "task cancelled").into()
                    );
                }
            }
        }
    }
}

async fn rpc_cancelled(cancel: &mut watch::Receiver<bool>) {
    if *cancel.borrow() {
        return;
    }
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}
