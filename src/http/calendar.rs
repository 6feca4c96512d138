use axum::{
    extract::{Path, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::cabins::parse_id;
use super::security::CsrfProtected;
use super::{ApiError, AppState};
use crate::ical::{export_calendar, export_filename};
use crate::sync::sync_source;

#[derive(Deserialize)]
pub(super) struct ImportBody {
    #[serde(default, alias = "icalUrl")]
    ical_url: Option<String>,
    #[serde(default, alias = "cabañaId", alias = "cabinId")]
    cabin_id: Option<String>,
}

/// Save the cabin's feed URL and import it right away.
pub(super) async fn import(
    State(state): State<AppState>,
    CsrfProtected(admin): CsrfProtected,
    Json(body): Json<ImportBody>,
) -> Result<Json<Value>, ApiError> {
    let (Some(url), Some(cabin_id)) = (
        body.ical_url.filter(|u| !u.trim().is_empty()),
        body.cabin_id.filter(|c| !c.trim().is_empty()),
    ) else {
        return Err(ApiError::bad_request("ical_url and cabin_id are required"));
    };
    let url = url.trim().to_string();
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(ApiError::bad_request("ical_url must be an http(s) URL"));
    }
    let cabin_id = parse_id(&cabin_id)?;

    let source = state.engine.save_source(cabin_id, url).await?;
    info!("{} saved calendar source for cabin {cabin_id}", admin.email);

    let report = sync_source(&state.engine, state.fetcher.as_ref(), &source).await;
    if let Some(error) = report.error {
        return Err(ApiError::Upstream(format!("calendar import failed: {error}")));
    }
    Ok(Json(json!({
        "success": true,
        "message": report.counts.summary(),
        "imported": report.counts.imported,
        "updated": report.counts.updated,
        "skipped": report.counts.skipped,
    })))
}

#[derive(Deserialize)]
pub(super) struct LinkBody {
    #[serde(alias = "cabañaId", alias = "cabinId")]
    cabin_id: String,
}

/// Issue a new export token; the previous one stops working.
pub(super) async fn create_link(
    State(state): State<AppState>,
    CsrfProtected(admin): CsrfProtected,
    Json(body): Json<LinkBody>,
) -> Result<Json<Value>, ApiError> {
    let cabin_id = parse_id(&body.cabin_id)?;
    let link = state.engine.create_link(cabin_id).await?;
    info!("{} issued export link for cabin {cabin_id}", admin.email);
    Ok(Json(json!({
        "success": true,
        "token": link.token,
        "url": format!("{}/api/calendar/export/{}.ics", state.config.site_url, link.token),
    })))
}

pub(super) async fn export(State(state): State<AppState>, Path(token): Path<String>) -> Result<Response, ApiError> {
    let token = token.strip_suffix(".ics").unwrap_or(&token);
    let link = state
        .engine
        .link_by_token(token)
        .ok_or_else(|| ApiError::NotFound("calendar not found".into()))?;
    let (cabin, bookings) = state.engine.occupying_bookings(link.cabin_id).await?;

    let body = export_calendar(&cabin, &bookings);
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", export_filename(&cabin)))
        .map_err(|e| ApiError::Internal(format!("content disposition: {e}")))?;
    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("text/calendar; charset=utf-8")),
            (header::CONTENT_DISPOSITION, disposition),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        ],
        body,
    )
        .into_response())
}
