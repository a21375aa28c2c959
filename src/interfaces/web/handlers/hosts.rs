use axum::{
    Json,
    extract::State,
    response::{IntoResponse, Response},
};

use crate::interfaces::error_response;
use crate::interfaces::web::AppState;

pub async fn list_hosts(State(state): State<AppState>) -> Response {
    match state.store.list_agent_hosts().await {
        Ok(hosts) => Json(serde_json::json!({ "success": true, "hosts": hosts })).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}
