use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::core::store::types::{Recurrence, now_ts, parse_ts};
use crate::interfaces::error_response;
use crate::interfaces::web::AppState;

#[derive(serde::Deserialize)]
pub struct CreateJobRequest {
    pub name: String,
    pub action_type: Option<String>,
    pub run_at: String,
    pub recurrence: Option<String>,
    pub target_hosts: Vec<String>,
    pub payload: Option<serde_json::Value>,
    pub created_by: Option<String>,
}

pub async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> Response {
    if parse_ts(req.run_at.trim()).is_err() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "success": false,
                "error": "run_at must be formatted as YYYY-MM-DD HH:MM:SS (UTC)"
            })),
        )
            .into_response();
    }

    let recurrence = match req.recurrence.as_deref() {
        None => Recurrence::Once,
        Some(raw) => match Recurrence::from_status(raw.trim()) {
            Some(r) => r,
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({
                        "success": false,
                        "error": "recurrence must be one of: once, daily, weekly, monthly"
                    })),
                )
                    .into_response();
            }
        },
    };

    match state
        .store
        .create_scheduled_job(
            req.name.trim(),
            req.action_type.as_deref().unwrap_or("command"),
            req.run_at.trim(),
            recurrence,
            &req.target_hosts,
            req.payload.unwrap_or_else(|| serde_json::json!({})),
            req.created_by.as_deref().unwrap_or("operator"),
        )
        .await
    {
        Ok(job) => Json(serde_json::json!({ "success": true, "job": job })).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

pub async fn list_jobs(State(state): State<AppState>) -> Response {
    match state.store.list_scheduled_jobs().await {
        Ok(jobs) => Json(serde_json::json!({ "success": true, "jobs": jobs })).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

pub async fn cancel_job(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    match state.store.cancel_scheduled_job(&job_id).await {
        Ok(job) => Json(serde_json::json!({ "success": true, "job": job })).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

/// Explicit sweep trigger. Safe to race with the periodic tick: each due job
/// is claimed exactly once no matter who sweeps.
pub async fn sweep_jobs(State(state): State<AppState>) -> Response {
    match state.sweeper.sweep(&now_ts()).await {
        Ok(outcomes) => Json(serde_json::json!({
            "success": true,
            "processed": outcomes.len(),
            "outcomes": outcomes
        }))
        .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

/// Traceability: every command this job has fanned out.
pub async fn job_commands(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    match state.store.commands_for_job(&job_id).await {
        Ok(commands) => {
            Json(serde_json::json!({ "success": true, "commands": commands })).into_response()
        }
        Err(e) => error_response(&e).into_response(),
    }
}
