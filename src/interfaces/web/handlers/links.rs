use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};

use crate::core::store::types::LinkVisibility;
use crate::interfaces::error_response;
use crate::interfaces::web::AppState;
use crate::interfaces::web::auth::{OPERATOR_TOKEN_HEADER, constant_time_eq};

#[derive(serde::Deserialize)]
pub struct CreateLinkRequest {
    pub created_by: Option<String>,
    pub expires_in_minutes: Option<u32>,
    pub visibility: Option<String>,
}

pub async fn create_link(
    State(state): State<AppState>,
    Json(req): Json<CreateLinkRequest>,
) -> Response {
    let visibility = match req.visibility.as_deref() {
        None => LinkVisibility::Public,
        Some(raw) => match LinkVisibility::from_status(raw.trim()) {
            Some(v) => v,
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({
                        "success": false,
                        "error": "visibility must be public or restricted"
                    })),
                )
                    .into_response();
            }
        },
    };

    match state
        .store
        .create_download_link(
            req.created_by.as_deref().unwrap_or("operator"),
            req.expires_in_minutes,
            visibility,
        )
        .await
    {
        Ok(link) => {
            let url = format!("/download/{}", link.token);
            Json(serde_json::json!({ "success": true, "link": link, "url": url }))
                .into_response()
        }
        Err(e) => error_response(&e).into_response(),
    }
}

pub async fn list_links(State(state): State<AppState>) -> Response {
    match state.store.list_download_links().await {
        Ok(links) => Json(serde_json::json!({ "success": true, "links": links })).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

pub async fn revoke_link(State(state): State<AppState>, Path(link_id): Path<String>) -> Response {
    match state.store.revoke_download_link(&link_id).await {
        Ok(()) => Json(serde_json::json!({ "success": true, "message": "Link revoked" }))
            .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

/// Public token resolution: the token is the URL component. An unknown,
/// expired or revoked token is indistinguishable from a missing one.
/// Restricted links additionally demand the operator token, standing in for
/// the authenticated session owned by the surrounding web application.
pub async fn download_by_token(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Response {
    let link = match state.store.find_download_link(&token).await {
        Ok(Some(link)) => link,
        Ok(None) => return not_found(),
        Err(e) => return error_response(&e).into_response(),
    };
    if !link.is_active() {
        return not_found();
    }

    if link.require_login() {
        let presented = headers
            .get(OPERATOR_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let authorized = state
            .config
            .operator_token
            .as_deref()
            .is_some_and(|expected| constant_time_eq(presented.as_bytes(), expected.as_bytes()));
        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({
                    "success": false,
                    "error": "This link requires an authenticated session"
                })),
            )
                .into_response();
        }
    }

    Json(serde_json::json!({
        "success": true,
        "granted": true,
        "visibility": link.visibility,
        "expires_at": link.expires_at
    }))
    .into_response()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "success": false, "error": "Not found" })),
    )
        .into_response()
}
