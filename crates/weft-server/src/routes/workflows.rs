//! Workflow intake: the parsed documents the scheduler consumes.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use weft_core::{ResourceId, Store, Workflow, WorkflowGraph};

use crate::envelope::{ok, ApiResult, Envelope};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    /// Packed CWL document, kept for provenance.
    pub content: serde_json::Value,
    /// The executable graph as produced by the parser.
    pub graph: WorkflowGraph,
}

pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateWorkflowRequest>,
) -> ApiResult<Json<Envelope<Workflow>>> {
    let workflow = Workflow {
        id: ResourceId::new(),
        content: request.content,
        graph: request.graph,
    };
    state.store.create_workflow(&workflow).await?;
    Ok(ok(workflow))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Envelope<Workflow>>> {
    let workflow = state.store.get_workflow(ResourceId::from_uuid(id)).await?;
    Ok(ok(workflow))
}

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Envelope<Vec<Workflow>>>> {
    Ok(ok(state.store.list_workflows().await?))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Envelope<bool>>> {
    state.store.delete_workflow(ResourceId::from_uuid(id)).await?;
    Ok(ok(true))
}
