//! Worker protocol endpoints: register, lease, report, heartbeat.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use weft_core::{ResourceId, Store, Task, TaskCompletion, TaskError, WorkerRecord};

use crate::envelope::{ok, ApiError, ApiResult, Envelope};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub hostname: String,
    pub runtime: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub worker_id: ResourceId,
}

pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<Json<Envelope<RegisterResponse>>> {
    if let Some(expected) = &state.worker_key {
        if request.key.as_deref() != Some(expected.as_str()) {
            return Err(ApiError::Unauthorized);
        }
    }
    let now = Utc::now();
    let worker = WorkerRecord {
        id: ResourceId::new(),
        name: request.name,
        hostname: request.hostname,
        runtime: request.runtime,
        group: request.group,
        registered_at: now,
        last_seen: now,
    };
    state.store.register_worker(&worker).await?;
    info!(worker_id = %worker.id, name = %worker.name, group = %worker.group, "worker registered");
    Ok(ok(RegisterResponse { worker_id: worker.id }))
}

#[derive(Debug, Deserialize)]
pub struct LeaseQuery {
    /// Comma-separated worker groups offered by the agent.
    #[serde(default)]
    pub groups: Option<String>,
    /// Client-requested poll window in seconds, capped by the server.
    #[serde(default)]
    pub poll: Option<u64>,
}

pub async fn lease(
    State(state): State<AppState>,
    Path(worker_id): Path<Uuid>,
    Query(query): Query<LeaseQuery>,
) -> ApiResult<Json<Envelope<Option<Task>>>> {
    let worker_id = ResourceId::from_uuid(worker_id);
    let worker = state.store.get_worker(worker_id).await?;
    state.store.touch_worker(worker_id, Utc::now()).await?;

    let mut groups: Vec<String> = query
        .groups
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(String::from)
        .collect();
    if groups.is_empty() && !worker.group.is_empty() {
        groups.push(worker.group.clone());
    }

    let window = query
        .poll
        .map(Duration::from_secs)
        .unwrap_or(state.poll_window)
        .min(state.poll_window);
    let deadline = tokio::time::Instant::now() + window;
    let owner = worker_id.to_string();

    // Long-poll: re-check the queue on a short cadence until the window
    // closes or a task shows up.
    loop {
        if let Some(task) = state
            .store
            .claim_next_task("worker", &owner, &groups, state.lease_ttl)
            .await?
        {
            info!(worker_id = %worker_id, task_id = %task.id, "task leased");
            return Ok(ok(Some(task)));
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(ok(None));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[derive(Debug, Deserialize)]
pub struct ReportRequest {
    pub task_id: ResourceId,
    #[serde(default)]
    pub outputs: std::collections::BTreeMap<String, weft_core::CwlValue>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub logs_ref: Option<String>,
    #[serde(default)]
    pub error: Option<TaskError>,
}

#[derive(Debug, Serialize)]
pub struct ReportResponse {
    pub completed: bool,
}

pub async fn report(
    State(state): State<AppState>,
    Path(worker_id): Path<Uuid>,
    Json(request): Json<ReportRequest>,
) -> ApiResult<Json<Envelope<ReportResponse>>> {
    let worker_id = ResourceId::from_uuid(worker_id);
    state.store.get_worker(worker_id).await?;
    state.store.touch_worker(worker_id, Utc::now()).await?;

    let completion = TaskCompletion {
        outputs: request.outputs,
        exit_code: request.exit_code,
        logs_ref: request.logs_ref,
        error: request.error,
    };
    let completed = state.store.complete_task(request.task_id, &completion).await?;
    info!(worker_id = %worker_id, task_id = %request.task_id, completed, "worker report");
    state.wake.notify_one();
    Ok(ok(ReportResponse { completed }))
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub task_id: ResourceId,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub renewed: bool,
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(worker_id): Path<Uuid>,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResult<Json<Envelope<HeartbeatResponse>>> {
    let worker_id = ResourceId::from_uuid(worker_id);
    state.store.get_worker(worker_id).await?;
    let now = Utc::now();
    state.store.touch_worker(worker_id, now).await?;

    let expiry = now
        + chrono::Duration::from_std(state.lease_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(90));
    let renewed = state
        .store
        .renew_lease(request.task_id, &worker_id.to_string(), expiry)
        .await?;
    Ok(ok(HeartbeatResponse { renewed }))
}
