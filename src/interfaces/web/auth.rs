use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::AppState;

pub const OPERATOR_TOKEN_HEADER: &str = "x-fleetd-operator-token";

/// Admin API gate. With an operator token configured the header must match;
/// without one, open access is tolerated only on a loopback bind so a bare
/// dev setup works but an exposed server fails closed.
pub async fn require_operator(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    match &state.config.operator_token {
        Some(expected) => {
            let presented = req
                .headers()
                .get(OPERATOR_TOKEN_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
                next.run(req).await
            } else {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(serde_json::json!({
                        "success": false,
                        "error": "Missing or invalid operator token"
                    })),
                )
                    .into_response()
            }
        }
        None => {
            if is_loopback_host(&state.config.api_host) {
                next.run(req).await
            } else {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(serde_json::json!({
                        "success": false,
                        "error": "No operator token configured. Set FLEETD_OPERATOR_TOKEN before exposing the API on a non-loopback address."
                    })),
                )
                    .into_response()
            }
        }
    }
}

pub(crate) fn is_loopback_host(host: &str) -> bool {
    host == "127.0.0.1" || host == "::1" || host == "localhost"
}

/// Constant-time comparison to prevent timing attacks.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::background::TaskPool;
    use crate::core::scheduler::JobSweeper;
    use axum::{Router, middleware, routing::get};
    use std::sync::Arc;
    use tower::util::ServiceExt;

    fn test_state(api_host: &str, operator_token: Option<&str>) -> AppState {
        let store = Arc::new(crate::core::store::test_store());
        let mut config = crate::core::config::FleetConfig::default();
        config.api_host = api_host.to_string();
        config.operator_token = operator_token.map(str::to_string);
        AppState {
            sweeper: Arc::new(JobSweeper::new(store.clone())),
            store,
            pool: TaskPool::new(1),
            config: Arc::new(config),
        }
    }

    fn protected_app(state: AppState) -> Router {
        Router::new()
            .route("/api/ping", get(|| async { Json(serde_json::json!({ "ok": true })) }))
            .layer(middleware::from_fn_with_state(state.clone(), require_operator))
            .with_state(state)
    }

    async fn ping_status(app: Router, headers: Vec<(&str, &str)>) -> StatusCode {
        let mut builder = Request::builder().uri("/api/ping");
        for (k, v) in headers {
            builder = builder.header(k, v);
        }
        app.oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[test]
    fn loopback_hosts_are_recognized() {
        assert!(is_loopback_host("127.0.0.1"));
        assert!(is_loopback_host("::1"));
        assert!(is_loopback_host("localhost"));
        assert!(!is_loopback_host("0.0.0.0"));
    }

    #[tokio::test]
    async fn no_token_on_loopback_allows_request() {
        let app = protected_app(test_state("127.0.0.1", None));
        assert_eq!(ping_status(app, vec![]).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn no_token_on_public_bind_rejects_request() {
        let app = protected_app(test_state("0.0.0.0", None));
        assert_eq!(ping_status(app, vec![]).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn configured_token_is_required_and_checked() {
        let state = test_state("127.0.0.1", Some("secret-1"));
        let app = protected_app(state.clone());
        assert_eq!(ping_status(app, vec![]).await, StatusCode::UNAUTHORIZED);

        let app = protected_app(state.clone());
        assert_eq!(
            ping_status(app, vec![(OPERATOR_TOKEN_HEADER, "wrong")]).await,
            StatusCode::UNAUTHORIZED
        );

        let app = protected_app(state);
        assert_eq!(
            ping_status(app, vec![(OPERATOR_TOKEN_HEADER, "secret-1")]).await,
            StatusCode::OK
        );
    }
}
