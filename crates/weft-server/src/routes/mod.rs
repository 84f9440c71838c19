//! HTTP routes.

pub mod submissions;
pub mod workers;
pub mod workflows;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/workflows", post(workflows::create).get(workflows::list))
        .route(
            "/api/v1/workflows/{id}",
            get(workflows::get).delete(workflows::delete),
        )
        .route(
            "/api/v1/submissions",
            post(submissions::create).get(submissions::list),
        )
        .route("/api/v1/submissions/{id}", get(submissions::get))
        .route("/api/v1/submissions/{id}/tasks", get(submissions::tasks))
        .route("/api/v1/submissions/{id}/cancel", post(submissions::cancel))
        .route("/api/v1/workers/register", post(workers::register))
        .route("/api/v1/workers/{id}/lease", post(workers::lease))
        .route("/api/v1/workers/{id}/report", post(workers::report))
        .route("/api/v1/workers/{id}/heartbeat", post(workers::heartbeat))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
