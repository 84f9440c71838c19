//! Submission intake and lifecycle.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::info;
use uuid::Uuid;

use weft_core::{CwlValue, Error, ResourceId, Store, Submission, SubmissionState, Task};

use crate::envelope::{ok, ApiResult, Envelope};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSubmissionRequest {
    pub workflow_id: ResourceId,
    #[serde(default)]
    pub inputs: BTreeMap<String, CwlValue>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub owner: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateSubmissionRequest>,
) -> ApiResult<Json<Envelope<Submission>>> {
    // The workflow must exist before we accept a run of it.
    state.store.get_workflow(request.workflow_id).await?;

    let mut submission = Submission::new(request.workflow_id, request.inputs);
    submission.priority = request.priority;
    submission.owner = request.owner;
    state.store.create_submission(&submission).await?;
    info!(submission_id = %submission.id, workflow_id = %submission.workflow_id, "submission accepted");

    // Shorten the latency to first dispatch.
    state.wake.notify_one();
    Ok(ok(submission))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub state: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Envelope<Vec<Submission>>>> {
    let filter = match query.state.as_deref() {
        Some(text) => Some(
            SubmissionState::parse(text)
                .ok_or_else(|| Error::Validation(format!("unknown state {text:?}")))?,
        ),
        None => None,
    };
    Ok(ok(state.store.list_submissions(filter).await?))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Envelope<Submission>>> {
    let submission = state.store.get_submission(ResourceId::from_uuid(id)).await?;
    Ok(ok(submission))
}

pub async fn tasks(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Envelope<Vec<Task>>>> {
    let id = ResourceId::from_uuid(id);
    state.store.get_submission(id).await?;
    Ok(ok(state.store.list_tasks_by_submission(id).await?))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Envelope<Submission>>> {
    let id = ResourceId::from_uuid(id);
    state.store.cancel_submission(id).await?;
    state.wake.notify_one();
    let submission = state.store.get_submission(id).await?;
    Ok(ok(submission))
}
