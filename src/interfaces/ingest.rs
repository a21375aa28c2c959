//! Agent-facing ingestion service.
//!
//! The same router runs in two topologies: embedded in the main process
//! (small deployments, one process to operate) or as the standalone
//! `fleetd ingest` listener (isolates agent traffic from the admin API).
//! Both adapters share this module's logic and the same store file; nothing
//! here relies on being in a particular process.

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::error_response;
use crate::core::config::FleetConfig;
use crate::core::error::StoreError;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::store::FleetStore;
use crate::core::store::types::AgentKeyRecord;

#[derive(Clone)]
pub struct IngestState {
    pub store: Arc<FleetStore>,
}

pub fn build_ingest_router(state: IngestState) -> Router {
    Router::new()
        .route("/ingest", post(ingest_endpoint))
        .route("/health", get(health_endpoint))
        .route("/commands", get(pull_commands_endpoint))
        .route("/commands/{command_id}/result", post(command_result_endpoint))
        .with_state(state)
}

/// Resolve the `X-API-Key` header into a live credential. Any failure mode
/// (missing header, malformed key, unknown prefix, bad secret, revoked) is
/// one 401 with no side effects.
async fn authenticate(
    state: &IngestState,
    headers: &HeaderMap,
) -> Result<AgentKeyRecord, Response> {
    let raw = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if raw.is_empty() {
        return Err(error_response(&StoreError::AuthenticationFailure).into_response());
    }
    match state.store.verify_agent_key(raw).await {
        Ok(Some(key)) => Ok(key),
        Ok(None) => {
            warn!("Rejected agent request with invalid API key");
            Err(error_response(&StoreError::AuthenticationFailure).into_response())
        }
        Err(e) => {
            error!("Key verification error: {}", e);
            Err(error_response(&e).into_response())
        }
    }
}

fn agent_id_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-agent-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[derive(serde::Deserialize)]
struct IngestRequest {
    doc_key: Option<String>,
    agent: Option<String>,
    payload: serde_json::Value,
}

async fn ingest_endpoint(
    State(state): State<IngestState>,
    headers: HeaderMap,
    Json(req): Json<IngestRequest>,
) -> Response {
    let key = match authenticate(&state, &headers).await {
        Ok(key) => key,
        Err(resp) => return resp,
    };

    let agent_id = req.agent.or_else(|| agent_id_from(&headers));
    let payload = req.payload.to_string();
    let doc_key = req.doc_key.as_deref().map(str::trim).filter(|k| !k.is_empty());

    match state
        .store
        .record_message(&key.id, doc_key, agent_id.as_deref(), &payload)
        .await
    {
        Ok(stored) => {
            Json(serde_json::json!({ "success": true, "stored": stored })).into_response()
        }
        Err(e) => {
            error!("Ingest failed: {}", e);
            error_response(&e).into_response()
        }
    }
}

async fn health_endpoint(State(state): State<IngestState>) -> Response {
    match state.store.latest_message_at().await {
        Ok(last) => Json(serde_json::json!({ "lastPostUtc": last })).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

/// Agent pull: deliver every pending command for the calling host, marking
/// each one `sent` as it goes out the door.
async fn pull_commands_endpoint(
    State(state): State<IngestState>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authenticate(&state, &headers).await {
        return resp;
    }
    let Some(agent_id) = agent_id_from(&headers) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "success": false, "error": "Missing agent identifier" })),
        )
            .into_response();
    };

    match state.store.get_agent_host(&agent_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "success": false, "error": "Unknown agent" })),
            )
                .into_response();
        }
        Err(e) => return error_response(&e).into_response(),
    }

    match state.store.take_pending_commands_for_host(&agent_id).await {
        Ok(commands) => {
            Json(serde_json::json!({ "success": true, "commands": commands })).into_response()
        }
        Err(e) => error_response(&e).into_response(),
    }
}

#[derive(serde::Deserialize)]
struct CommandResultRequest {
    status: String,
    detail: Option<String>,
}

async fn command_result_endpoint(
    State(state): State<IngestState>,
    Path(command_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CommandResultRequest>,
) -> Response {
    if let Err(resp) = authenticate(&state, &headers).await {
        return resp;
    }
    let Some(agent_id) = agent_id_from(&headers) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "success": false, "error": "Missing agent identifier" })),
        )
            .into_response();
    };

    let command = match state.store.get_remote_command(&command_id).await {
        Ok(cmd) => cmd,
        Err(e) => return error_response(&e).into_response(),
    };
    if command.agent_id != agent_id {
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({
                "success": false,
                "error": "Command does not belong to this agent"
            })),
        )
            .into_response();
    }

    let detail = req.detail.as_deref();
    let result = match req.status.trim().to_lowercase().as_str() {
        "completed" | "acknowledged" => {
            state.store.mark_command_acknowledged(&command_id, detail).await
        }
        "failed" => state.store.mark_command_failed(&command_id, detail).await,
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "success": false,
                    "error": format!("Unknown result status: {other}")
                })),
            )
                .into_response();
        }
    };

    match result {
        Ok(command) => {
            Json(serde_json::json!({ "success": true, "command": command })).into_response()
        }
        Err(e) => error_response(&e).into_response(),
    }
}

// --- Hosting adapters ---

/// Embedded topology: the ingest listener rides inside the main process.
pub struct EmbeddedIngestServer {
    store: Arc<FleetStore>,
    host: String,
    port: u16,
}

impl EmbeddedIngestServer {
    pub fn new(store: Arc<FleetStore>, config: &FleetConfig) -> Self {
        Self {
            store,
            host: config.ingest_host.clone(),
            port: config.ingest_port,
        }
    }
}

#[async_trait]
impl LifecycleComponent for EmbeddedIngestServer {
    async fn on_start(&mut self) -> Result<()> {
        let state = IngestState {
            store: self.store.clone(),
        };
        let addr = format!("{}:{}", self.host, self.port);

        tokio::spawn(async move {
            let app = build_ingest_router(state);
            match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => {
                    info!("Embedded ingest listener on http://{addr}");
                    if let Err(e) = axum::serve(listener, app).await {
                        error!("Embedded ingest listener crashed: {}", e);
                    }
                }
                Err(e) => error!("Embedded ingest listener failed to bind {addr}: {}", e),
            }
        });
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("Embedded ingest listener shutting down");
        Ok(())
    }
}

/// Standalone topology: a dedicated process owning only the ingest listener.
/// Shares the store file with the main process; every invariant the two
/// topologies rely on lives in that store, so nothing else is coordinated.
pub async fn run_standalone(config: &FleetConfig) -> Result<()> {
    let store = Arc::new(FleetStore::open(&config.db_path)?);
    let state = IngestState { store };
    let app = build_ingest_router(state);

    let addr = format!("{}:{}", config.ingest_host, config.ingest_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Standalone ingest listener on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Ingest listener stopping");
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use tower::util::ServiceExt;

    async fn test_state() -> (IngestState, Arc<FleetStore>) {
        let store = Arc::new(crate::core::store::test_store());
        (IngestState { store: store.clone() }, store)
    }

    async fn send_json(
        app: Router,
        method: Method,
        path: &str,
        headers: Vec<(&str, &str)>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(path);
        for (k, v) in headers {
            builder = builder.header(k, v);
        }
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_string(&json).unwrap())
            }
            None => Body::empty(),
        };
        let resp = app.oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::json!({}));
        (status, json)
    }

    #[tokio::test]
    async fn missing_api_key_is_unauthorized() {
        let (state, _) = test_state().await;
        let app = build_ingest_router(state);
        let (status, _) = send_json(
            app,
            Method::POST,
            "/ingest",
            vec![],
            Some(serde_json::json!({ "payload": {} })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn forged_api_key_is_unauthorized_with_no_rows_written() {
        let (state, store) = test_state().await;
        let app = build_ingest_router(state);
        let (status, _) = send_json(
            app,
            Method::POST,
            "/ingest",
            vec![("x-api-key", "fd_000000000000_bogus")],
            Some(serde_json::json!({ "doc_key": "d", "payload": {} })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(store.message_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ingest_reports_stored_then_deduplicates() {
        let (state, _) = test_state().await;
        let (plain, _) = state
            .store
            .create_agent_key("agent-1", None, None)
            .await
            .unwrap();
        let body = serde_json::json!({
            "doc_key": "msg-42",
            "agent": "ws-01",
            "payload": { "cpu": 41.5 }
        });

        let app = build_ingest_router(state.clone());
        let (status, json) = send_json(
            app,
            Method::POST,
            "/ingest",
            vec![("x-api-key", plain.as_str())],
            Some(body.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["stored"], true);

        let app = build_ingest_router(state);
        let (status, json) = send_json(
            app,
            Method::POST,
            "/ingest",
            vec![("x-api-key", plain.as_str())],
            Some(body),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["stored"], false);
    }

    #[tokio::test]
    async fn both_topologies_share_one_dedup_scope() {
        // Two routers over two store handles on the same file, as when the
        // embedded and standalone listeners run side by side.
        let (state_a, store_a) = test_state().await;
        let store_b = Arc::new(FleetStore::open(store_a.db_path()).unwrap());
        let state_b = IngestState { store: store_b };

        let (plain, _) = store_a.create_agent_key("agent-1", None, None).await.unwrap();
        let body = serde_json::json!({ "doc_key": "cross", "payload": {} });

        let (_, first) = send_json(
            build_ingest_router(state_a),
            Method::POST,
            "/ingest",
            vec![("x-api-key", plain.as_str())],
            Some(body.clone()),
        )
        .await;
        let (_, second) = send_json(
            build_ingest_router(state_b),
            Method::POST,
            "/ingest",
            vec![("x-api-key", plain.as_str())],
            Some(body),
        )
        .await;

        assert_eq!(first["stored"], true);
        assert_eq!(second["stored"], false);
        assert_eq!(store_a.message_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn health_reports_latest_receipt() {
        let (state, store) = test_state().await;
        let app = build_ingest_router(state.clone());
        let (status, json) = send_json(app, Method::GET, "/health", vec![], None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["lastPostUtc"], serde_json::Value::Null);

        let (_, key) = store.create_agent_key("a", None, None).await.unwrap();
        store.record_message(&key.id, None, None, "{}").await.unwrap();

        let app = build_ingest_router(state);
        let (_, json) = send_json(app, Method::GET, "/health", vec![], None).await;
        assert!(json["lastPostUtc"].is_string());
    }

    #[tokio::test]
    async fn command_pull_delivers_once_and_reports_results() {
        let (state, store) = test_state().await;
        let (plain, _) = store.create_agent_key("agent-1", None, None).await.unwrap();
        store.touch_agent_host("ws-01").await.unwrap();
        let cmd = store
            .enqueue_command("ws-01", "command", serde_json::json!({"script": "hostname"}), None)
            .await
            .unwrap();

        let headers = vec![("x-api-key", plain.as_str()), ("x-agent-id", "ws-01")];

        let app = build_ingest_router(state.clone());
        let (status, json) =
            send_json(app, Method::GET, "/commands", headers.clone(), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["commands"].as_array().unwrap().len(), 1);
        assert_eq!(json["commands"][0]["status"], "sent");

        // Second pull finds nothing pending.
        let app = build_ingest_router(state.clone());
        let (_, json) = send_json(app, Method::GET, "/commands", headers.clone(), None).await;
        assert_eq!(json["commands"].as_array().unwrap().len(), 0);

        // Result callback acknowledges.
        let app = build_ingest_router(state.clone());
        let (status, json) = send_json(
            app,
            Method::POST,
            &format!("/commands/{}/result", cmd.id),
            headers.clone(),
            Some(serde_json::json!({ "status": "completed", "detail": "exit 0" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["command"]["status"], "acknowledged");

        // Re-reporting against the now-terminal command is rejected.
        let app = build_ingest_router(state);
        let (status, _) = send_json(
            app,
            Method::POST,
            &format!("/commands/{}/result", cmd.id),
            headers,
            Some(serde_json::json!({ "status": "failed" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn command_result_for_foreign_host_is_forbidden() {
        let (state, store) = test_state().await;
        let (plain, _) = store.create_agent_key("agent-1", None, None).await.unwrap();
        let cmd = store
            .enqueue_command("ws-01", "command", serde_json::json!({}), None)
            .await
            .unwrap();

        let app = build_ingest_router(state);
        let (status, _) = send_json(
            app,
            Method::POST,
            &format!("/commands/{}/result", cmd.id),
            vec![("x-api-key", plain.as_str()), ("x-agent-id", "ws-99")],
            Some(serde_json::json!({ "status": "completed" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unknown_host_pull_is_not_found() {
        let (state, store) = test_state().await;
        let (plain, _) = store.create_agent_key("agent-1", None, None).await.unwrap();
        let app = build_ingest_router(state);
        let (status, _) = send_json(
            app,
            Method::GET,
            "/commands",
            vec![("x-api-key", plain.as_str()), ("x-agent-id", "ghost")],
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn revoked_key_loses_access_end_to_end() {
        let (state, store) = test_state().await;
        let (plain, record) = store.create_agent_key("agent-1", None, None).await.unwrap();
        let body = serde_json::json!({ "doc_key": "msg-42", "payload": {} });

        let (status, json) = send_json(
            build_ingest_router(state.clone()),
            Method::POST,
            "/ingest",
            vec![("x-api-key", plain.as_str())],
            Some(body.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["stored"], true);

        let (_, json) = send_json(
            build_ingest_router(state.clone()),
            Method::POST,
            "/ingest",
            vec![("x-api-key", plain.as_str())],
            Some(body.clone()),
        )
        .await;
        assert_eq!(json["stored"], false);

        store.revoke_agent_key(&record.id).await.unwrap();
        assert!(store.verify_agent_key(&plain).await.unwrap().is_none());

        let (status, _) = send_json(
            build_ingest_router(state),
            Method::POST,
            "/ingest",
            vec![("x-api-key", plain.as_str())],
            Some(body),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
