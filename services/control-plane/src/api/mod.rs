//! HTTP API handlers and routing.

pub mod error;
mod discovery;
mod health;
mod lifecycle;
mod scheduler;
mod sync;

use axum::{
    http::{header, Method},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(Any);

    Router::new()
        .merge(health::routes())
        .merge(discovery::routes())
        .merge(scheduler::routes())
        .merge(lifecycle::routes())
        .merge(sync::routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::db::Database;
    use crate::state::ApiSettings;

    async fn router() -> Router {
        let db = Database::in_memory().await.unwrap();
        create_router(AppState::new(db, ApiSettings::default()).unwrap())
    }

    async fn call(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn test_livez() {
        let request = Request::get("/livez").body(Body::empty()).unwrap();
        let (status, _) = call(router().await, request).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_schedule_without_selector_returns_template() {
        let request = Request::post("/scheduler")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"roles": ["etcd-member"]}"#))
            .unwrap();
        let (status, body) = call(router().await, request).await;
        assert_eq!(status, StatusCode::NOT_ACCEPTABLE);
        assert_eq!(body["selector"]["mac"], "");
        assert_eq!(body["roles"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_empty_store_lists() {
        let router = router().await;
        for (uri, expected) in [
            ("/scheduler", serde_json::json!({})),
            ("/scheduler/available", serde_json::json!([])),
            ("/discovery", serde_json::json!([])),
            ("/ignition/version", serde_json::json!({})),
        ] {
            let request = Request::get(uri).body(Body::empty()).unwrap();
            let (status, body) = call(router.clone(), request).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
            assert_eq!(body, expected, "{uri}");
        }
    }
}
