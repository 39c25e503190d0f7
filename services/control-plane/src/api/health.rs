//! Health check endpoints.
//!
//! `/healthz` checks the store and every configured boot-config path;
//! `/livez` only says the process is serving.

use std::collections::BTreeMap;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tracing::warn;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// True when every component passes.
    pub global: bool,

    /// Store reachability.
    pub db: bool,

    /// Reachability of each boot-config path.
    pub matchbox: BTreeMap<String, bool>,
}

/// Create health check routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/livez", get(livez))
}

/// Dependency check; 503 if anything fails.
async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let db = match state.db().health_check().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Store health check failed");
            false
        }
    };

    let mut matchbox = BTreeMap::new();
    for path in state.matchbox_health_paths() {
        let url = format!("{}{}", state.matchbox_uri(), path);
        let ok = match state.http().get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(url = %url, error = %e, "Boot-config health check failed");
                false
            }
        };
        matchbox.insert(path.clone(), ok);
    }

    let global = db && matchbox.values().all(|ok| *ok);
    let status = if global {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(HealthResponse { global, db, matchbox }))
}

/// Liveness check - is the service alive?
async fn livez() -> impl IntoResponse {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_livez_returns_ok() {
        let response = livez().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
