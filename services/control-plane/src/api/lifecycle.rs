//! Lifecycle endpoints.
//!
//! Machines identify themselves with the raw query string they were booted
//! with (`mac=52-54-00-e8-32-5b&uuid=...&os=installed`), passed as the last
//! path segment.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use metalcast_model::{
    CoreosInstallStatus, IgnitionStatus, LifecycleQuery, RollingEntry, RollingStatus,
};
use metalcast_reconcile::ContentHash;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::error::ApiError;
use crate::lifecycle::InstallDecision;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/lifecycle/ignition", get(list_ignition))
        .route("/lifecycle/ignition/{raw_query}", post(report_ignition))
        .route("/lifecycle/coreos-install", get(list_coreos_install))
        .route(
            "/lifecycle/coreos-install/{status}/{raw_query}",
            post(report_coreos_install),
        )
        .route("/lifecycle/rolling", get(list_rolling))
        .route(
            "/lifecycle/rolling/{raw_query}",
            get(get_rolling).post(enable_rolling).delete(disable_rolling),
        )
        .route(
            "/install-authorization/{raw_query}",
            get(install_authorization),
        )
}

fn parse_query(raw: &str) -> Result<LifecycleQuery, ApiError> {
    LifecycleQuery::parse(raw).map_err(|e| {
        warn!(raw_query = %raw, error = %e, "Invalid lifecycle query");
        ApiError::not_acceptable("invalid_query", e.to_string())
    })
}

// =============================================================================
// Ignition
// =============================================================================

#[derive(Debug, Serialize)]
struct IgnitionReport {
    up_to_date: bool,
}

/// Compare the ignition a machine applied with the one currently served
/// for the same query.
async fn report_ignition(
    State(state): State<AppState>,
    Path(raw_query): Path<String>,
    body: Bytes,
) -> Result<Json<IgnitionReport>, ApiError> {
    let query = parse_query(&raw_query)?;
    let applied: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::not_acceptable("invalid_ignition", e.to_string()))?;

    let url = format!("{}/ignition?{}", state.matchbox_uri(), query.raw);
    let served = fetch_ignition(&state, &url).await?;

    let up_to_date = ContentHash::from_json(&applied) == ContentHash::from_json(&served);
    state.lifecycle().refresh_ignition(&query, up_to_date).await?;
    Ok(Json(IgnitionReport { up_to_date }))
}

async fn fetch_ignition(state: &AppState, url: &str) -> Result<serde_json::Value, ApiError> {
    let unreachable = |e: reqwest::Error| {
        warn!(url = %url, error = %e, "Boot-config service unreachable");
        ApiError::bad_gateway("matchbox_unreachable", e.to_string())
    };
    state
        .http()
        .get(url)
        .send()
        .await
        .and_then(|resp| resp.error_for_status())
        .map_err(unreachable)?
        .json()
        .await
        .map_err(unreachable)
}

async fn list_ignition(
    State(state): State<AppState>,
) -> Result<Json<Vec<IgnitionStatus>>, ApiError> {
    Ok(Json(state.lifecycle().get_all_ignition_status().await?))
}

// =============================================================================
// Install
// =============================================================================

async fn report_coreos_install(
    State(state): State<AppState>,
    Path((status, raw_query)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let success = match status.as_str() {
        "success" => true,
        "fail" => false,
        other => {
            return Err(ApiError::not_found(
                "unknown_install_status",
                format!("unknown install status {other:?}; expected success or fail"),
            ))
        }
    };
    let query = parse_query(&raw_query)?;
    state
        .lifecycle()
        .refresh_coreos_install(&query, success)
        .await?;
    Ok(StatusCode::OK)
}

async fn list_coreos_install(
    State(state): State<AppState>,
) -> Result<Json<Vec<CoreosInstallStatus>>, ApiError> {
    Ok(Json(state.lifecycle().get_all_coreos_install_status().await?))
}

#[derive(Debug, Serialize)]
struct InstallAuthorization {
    authorized: bool,
    request_raw_query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

/// 200 when an install may proceed, 403 otherwise.
async fn install_authorization(
    State(state): State<AppState>,
    Path(raw_query): Path<String>,
) -> Result<Response, ApiError> {
    let mac = LifecycleQuery::parse_mac(&raw_query)
        .map_err(|e| ApiError::not_acceptable("invalid_query", e.to_string()))?;

    let decision = state.install_lock().authorize(&mac, Utc::now()).await?;
    let (status, reason) = match decision {
        InstallDecision::Granted { .. } => (StatusCode::OK, None),
        InstallDecision::Locked { holder, expires_at } => (
            StatusCode::FORBIDDEN,
            Some(format!("install lock held by {holder} until {}", expires_at.to_rfc3339())),
        ),
        InstallDecision::NotAllowed => (
            StatusCode::FORBIDDEN,
            Some("machine is not allowed to install".to_string()),
        ),
    };

    Ok((
        status,
        Json(InstallAuthorization {
            authorized: status == StatusCode::OK,
            request_raw_query: raw_query,
            reason,
        }),
    )
        .into_response())
}

// =============================================================================
// Rolling
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RollingRequest {
    #[serde(default)]
    strategy: Option<String>,
}

async fn enable_rolling(
    State(state): State<AppState>,
    Path(raw_query): Path<String>,
    body: Bytes,
) -> Result<Json<RollingStatus>, ApiError> {
    let query = parse_query(&raw_query)?;
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        RollingRequest::default()
    } else {
        serde_json::from_slice::<RollingRequest>(&body)
            .map_err(|e| ApiError::not_acceptable("invalid_request", e.to_string()))?
    };

    let status = state
        .lifecycle()
        .apply_rolling(&query, true, request.strategy.as_deref())
        .await?;
    Ok(Json(status))
}

async fn disable_rolling(
    State(state): State<AppState>,
    Path(raw_query): Path<String>,
) -> Result<Json<RollingStatus>, ApiError> {
    let query = parse_query(&raw_query)?;
    Ok(Json(state.lifecycle().apply_rolling(&query, false, None).await?))
}

/// 200 with the strategy when rolling is enabled, 401 otherwise.
async fn get_rolling(
    State(state): State<AppState>,
    Path(raw_query): Path<String>,
) -> Result<Response, ApiError> {
    let query = parse_query(&raw_query)?;
    let (enable, strategy) = state.lifecycle().get_rolling_status(&query.mac).await?;

    if enable == Some(true) {
        info!(mac = %query.mac, "Rolling update authorized");
        let body = RollingStatus {
            enable: true,
            strategy,
            request_raw_query: query.raw,
        };
        return Ok((StatusCode::OK, Json(body)).into_response());
    }

    let body = RollingStatus {
        enable: false,
        strategy: None,
        request_raw_query: query.raw,
    };
    Ok((StatusCode::UNAUTHORIZED, Json(body)).into_response())
}

async fn list_rolling(State(state): State<AppState>) -> Result<Json<Vec<RollingEntry>>, ApiError> {
    Ok(Json(state.lifecycle().get_all_rolling_status().await?))
}
