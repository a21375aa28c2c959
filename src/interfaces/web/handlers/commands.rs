use axum::{
    Json,
    extract::State,
    response::{IntoResponse, Response},
};

use crate::core::store::types::now_ts;
use crate::interfaces::error_response;
use crate::interfaces::web::AppState;

#[derive(serde::Deserialize)]
pub struct EnqueueCommandRequest {
    pub agent_id: String,
    pub action_type: Option<String>,
    pub payload: Option<serde_json::Value>,
}

/// Direct enqueue, for one-off operator commands outside any scheduled job.
pub async fn enqueue_command(
    State(state): State<AppState>,
    Json(req): Json<EnqueueCommandRequest>,
) -> Response {
    match state
        .store
        .enqueue_command(
            req.agent_id.trim(),
            req.action_type.as_deref().unwrap_or("command"),
            req.payload.unwrap_or_else(|| serde_json::json!({})),
            None,
        )
        .await
    {
        Ok(command) => {
            Json(serde_json::json!({ "success": true, "command": command })).into_response()
        }
        Err(e) => error_response(&e).into_response(),
    }
}

pub async fn list_commands(State(state): State<AppState>) -> Response {
    match state.store.list_commands().await {
        Ok(commands) => {
            Json(serde_json::json!({ "success": true, "commands": commands })).into_response()
        }
        Err(e) => error_response(&e).into_response(),
    }
}

#[derive(serde::Deserialize, Default)]
pub struct ExpireCommandsRequest {
    pub ttl_minutes: Option<u32>,
}

pub async fn expire_commands(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> Response {
    // The body is optional; an empty POST expires with the configured TTL.
    let req: ExpireCommandsRequest = if body.is_empty() {
        ExpireCommandsRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(e) => {
                return (
                    axum::http::StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "success": false, "error": e.to_string() })),
                )
                    .into_response();
            }
        }
    };
    let ttl = req.ttl_minutes.unwrap_or(state.config.command_ttl_minutes);
    match state.store.expire_commands(&now_ts(), ttl).await {
        Ok(expired) => {
            Json(serde_json::json!({ "success": true, "expired": expired })).into_response()
        }
        Err(e) => error_response(&e).into_response(),
    }
}
