//! Standard response envelope and API error mapping.
//!
//! Every endpoint answers `{status, request_id, timestamp, data}`;
//! errors put `{kind, message}` in `data` with `status: "error"`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use weft_core::Error;

#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub status: &'static str,
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub data: T,
}

pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        status: "ok",
        request_id: Uuid::new_v4(),
        timestamp: Utc::now(),
        data,
    })
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Core(Error),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Core(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "invalid worker key".to_string(),
            ),
            ApiError::Core(err) => {
                let status = match &err {
                    Error::NotFound(_) => StatusCode::NOT_FOUND,
                    Error::Validation(_) => StatusCode::BAD_REQUEST,
                    Error::Conflict(_) => StatusCode::CONFLICT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let kind = match &err {
                    Error::NotFound(_) => "not_found",
                    Error::Validation(_) => "validation",
                    Error::Conflict(_) => "conflict",
                    _ => "internal",
                };
                (status, kind, err.to_string())
            }
        };
        let body = Json(Envelope {
            status: "error",
            request_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            data: json!({"kind": kind, "message": message}),
        });
        (status, body).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
