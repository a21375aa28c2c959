use axum::{
    Json,
    extract::{Path, State},
    response::{IntoResponse, Response},
};

use crate::interfaces::error_response;
use crate::interfaces::web::AppState;

#[derive(serde::Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
    pub description: Option<String>,
    pub default_principal: Option<String>,
}

pub async fn create_key(
    State(state): State<AppState>,
    Json(req): Json<CreateKeyRequest>,
) -> Response {
    match state
        .store
        .create_agent_key(
            req.name.trim(),
            req.description.as_deref(),
            req.default_principal.as_deref(),
        )
        .await
    {
        Ok((plain, record)) => Json(serde_json::json!({
            "success": true,
            "key": plain,
            "record": record,
            "message": "Save the key now - it will not be shown again."
        }))
        .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

pub async fn list_keys(State(state): State<AppState>) -> Response {
    match state.store.list_agent_keys().await {
        Ok(keys) => Json(serde_json::json!({ "success": true, "keys": keys })).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

pub async fn revoke_key(State(state): State<AppState>, Path(key_id): Path<String>) -> Response {
    match state.store.revoke_agent_key(&key_id).await {
        Ok(()) => Json(serde_json::json!({ "success": true, "message": "Key revoked" }))
            .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

pub async fn rotate_key(State(state): State<AppState>, Path(key_id): Path<String>) -> Response {
    match state.store.rotate_agent_key(&key_id).await {
        Ok((plain, record)) => Json(serde_json::json!({
            "success": true,
            "key": plain,
            "record": record,
            "message": "Key rotated. The previous key is no longer valid."
        }))
        .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}
