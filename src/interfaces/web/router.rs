use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::auth;
use super::handlers::{commands, hosts, jobs, keys, links};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    // Token-gated download resolution is public; the token itself is the
    // credential.
    let public_routes = Router::new()
        .route("/download/{token}", get(links::download_by_token))
        .layer(middleware::from_fn(security_headers))
        .with_state(state.clone());

    let authed_routes = Router::new()
        .route("/api/keys", get(keys::list_keys).post(keys::create_key))
        .route("/api/keys/{key_id}/revoke", post(keys::revoke_key))
        .route("/api/keys/{key_id}/rotate", post(keys::rotate_key))
        .route("/api/jobs", get(jobs::list_jobs).post(jobs::create_job))
        .route("/api/jobs/sweep", post(jobs::sweep_jobs))
        .route("/api/jobs/{job_id}/cancel", post(jobs::cancel_job))
        .route("/api/jobs/{job_id}/commands", get(jobs::job_commands))
        .route(
            "/api/commands",
            get(commands::list_commands).post(commands::enqueue_command),
        )
        .route("/api/commands/expire", post(commands::expire_commands))
        .route("/api/links", get(links::list_links).post(links::create_link))
        .route("/api/links/{link_id}/revoke", post(links::revoke_link))
        .route("/api/hosts", get(hosts::list_hosts))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_operator,
        ))
        .layer(middleware::from_fn(security_headers))
        .layer(build_localhost_cors(state.config.api_port))
        .with_state(state);

    public_routes.merge(authed_routes)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    response
}
