//! Discovery endpoints, called by machines during PXE boot.

use axum::{body::Bytes, extract::State, routing::get, Json, Router};
use metalcast_model::DiscoveryReport;
use serde::Serialize;
use tracing::warn;

use crate::api::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/discovery", get(list_discovery).post(post_discovery))
}

#[derive(Debug, Serialize)]
struct DiscoveryAck {
    #[serde(rename = "new-discovery")]
    new_discovery: bool,
}

async fn post_discovery(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<DiscoveryAck>, ApiError> {
    let report = serde_json::from_slice::<DiscoveryReport>(&body)
        .map_err(|e| {
            warn!(error = %e, "Unparseable discovery report");
            ApiError::not_acceptable("invalid_report", e.to_string())
        })?
        .normalized()
        .map_err(|e| {
            warn!(error = %e, "Rejected discovery report");
            ApiError::not_acceptable("invalid_report", e.to_string())
        })?;

    let new_discovery = state.db().discovery_store().upsert(&report).await?;
    Ok(Json(DiscoveryAck { new_discovery }))
}

async fn list_discovery(
    State(state): State<AppState>,
) -> Result<Json<Vec<DiscoveryReport>>, ApiError> {
    Ok(Json(state.db().discovery_store().fetch_all().await?))
}
