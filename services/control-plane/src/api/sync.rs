//! Endpoints written by the sync engine: ignition versions and the
//! sync-notify timestamp.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;

use crate::api::error::ApiError;
use crate::db::IgnitionVersion;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/ignition/version", get(list_ignition_versions))
        .route("/ignition/version/{name}", post(record_ignition_version))
        .route("/sync-notify", get(get_sync_notify).post(post_sync_notify))
}

/// Body is `{"<name>": "<template content>"}`.
async fn record_ignition_version(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<BTreeMap<String, String>>,
) -> Result<Json<IgnitionVersion>, ApiError> {
    let content = body.get(&name).ok_or_else(|| {
        ApiError::not_acceptable(
            "missing_ignition_content",
            format!("body must be an object with key {name:?}"),
        )
    })?;
    Ok(Json(state.db().ignition_store().record(&name, content).await?))
}

async fn list_ignition_versions(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<String, String>>, ApiError> {
    Ok(Json(state.db().ignition_store().hashes().await?))
}

#[derive(Debug, Serialize)]
struct SyncNotify {
    #[serde(rename = "sync-notify")]
    sync_notify: Option<f64>,
}

async fn post_sync_notify(State(state): State<AppState>) -> Result<Json<SyncNotify>, ApiError> {
    let at = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
    state.db().sync_notify_store().notify(at).await?;
    Ok(Json(SyncNotify {
        sync_notify: Some(at),
    }))
}

async fn get_sync_notify(State(state): State<AppState>) -> Result<Json<SyncNotify>, ApiError> {
    Ok(Json(SyncNotify {
        sync_notify: state.db().sync_notify_store().last().await?,
    }))
}
