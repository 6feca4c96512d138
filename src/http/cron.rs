//! Calendar sync trigger, called by the hosting platform's scheduler or
//! manually by an administrator.

use axum::{
    extract::State,
    http::{header, HeaderMap},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{ApiError, AppState};
use crate::gateway::constant_time_eq;
use crate::sync::sync_all;

const CRON_USER_AGENT: &str = "vercel-cron/1.0";

fn is_authorized_cron(headers: &HeaderMap, secret: &str) -> bool {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| constant_time_eq(token.trim().as_bytes(), secret.as_bytes()));
    let scheduler = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ua| ua.contains(CRON_USER_AGENT));
    bearer || scheduler
}

pub(super) async fn sync_get(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>, ApiError> {
    if !is_authorized_cron(&headers, &state.config.cron_secret) {
        warn!("rejected unauthorized calendar sync request");
        return Err(ApiError::Unauthorized("unauthorized"));
    }
    run(&state).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManualTrigger {
    #[serde(default)]
    admin_token: Option<String>,
}

pub(super) async fn sync_post(State(state): State<AppState>, body: String) -> Result<Json<Value>, ApiError> {
    let trigger: ManualTrigger =
        serde_json::from_str(&body).map_err(|_| ApiError::bad_request("invalid JSON body"))?;
    let authorized = match (&state.config.admin_secret, trigger.admin_token.as_deref()) {
        (Some(expected), Some(sent)) => constant_time_eq(sent.as_bytes(), expected.as_bytes()),
        _ => false,
    };
    if !authorized {
        return Err(ApiError::Unauthorized("unauthorized"));
    }
    info!("manual calendar sync requested");
    run(&state).await
}

async fn run(state: &AppState) -> Result<Json<Value>, ApiError> {
    let results = sync_all(&state.engine, state.fetcher.as_ref()).await;
    Ok(Json(json!({
        "success": true,
        "results": results,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}
