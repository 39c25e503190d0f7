//! Role scheduler endpoints.

use std::collections::BTreeMap;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metalcast_id::MacAddress;
use metalcast_model::{parse_roles, ScheduleRequest, ScheduleRole, ScheduledMachine};
use tracing::{debug, warn};

use crate::api::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/scheduler", get(list_schedules).post(create_schedule))
        .route("/scheduler/available", get(available_machines))
        .route("/scheduler/ip-list/{role}", get(role_ip_list))
        .route("/scheduler/{roles}", get(machines_by_roles))
}

/// The request template, sent back with 406 when a request is unusable.
fn template_response() -> Response {
    (StatusCode::NOT_ACCEPTABLE, Json(ScheduleRequest::template())).into_response()
}

async fn list_schedules(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<MacAddress, Vec<ScheduleRole>>>, ApiError> {
    Ok(Json(state.schedules().get_all_schedules().await?))
}

async fn create_schedule(State(state): State<AppState>, body: Bytes) -> Response {
    let request = match serde_json::from_slice::<ScheduleRequest>(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Unparseable schedule request");
            return template_response();
        }
    };
    if request.selector.mac.trim().is_empty() || request.roles.is_empty() {
        debug!("Schedule request without selector or roles");
        return template_response();
    }

    match state.schedules().create_schedule(&request).await {
        Ok(_) => Json(request).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// Machines holding every role in `roles` (`&`-separated). An unknown role
/// yields an empty list.
async fn machines_by_roles(
    State(state): State<AppState>,
    Path(roles): Path<String>,
) -> Result<Json<Vec<ScheduledMachine>>, ApiError> {
    let Ok(roles) = parse_roles(roles.split('&')) else {
        return Ok(Json(Vec::new()));
    };
    Ok(Json(state.schedules().get_machines_by_roles(&roles).await?))
}

async fn role_ip_list(
    State(state): State<AppState>,
    Path(role): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    let Ok(role) = ScheduleRole::parse(&role) else {
        return Ok(Json(Vec::new()));
    };
    Ok(Json(state.schedules().get_role_ip_list(role).await?))
}

async fn available_machines(
    State(state): State<AppState>,
) -> Result<Json<Vec<ScheduledMachine>>, ApiError> {
    Ok(Json(state.schedules().get_available_machines().await?))
}
