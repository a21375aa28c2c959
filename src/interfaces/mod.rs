pub mod ingest;
pub mod web;

use axum::Json;
use axum::http::StatusCode;

use crate::core::error::StoreError;

/// One JSON error shape for both the ingest boundary and the admin API.
pub(crate) fn error_response(err: &StoreError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err {
        StoreError::AuthenticationFailure => StatusCode::UNAUTHORIZED,
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::TerminalState { .. } => StatusCode::CONFLICT,
        StoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        StoreError::Sqlite(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({ "success": false, "error": err.to_string() })),
    )
}
