use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::{ApiError, AppState};
use crate::model::{Cabin, DayAvailability, Stay};

/// Window shown when the caller gives no `to`.
const DEFAULT_WINDOW_DAYS: u64 = 90;

#[derive(Deserialize)]
pub(super) struct LocationQuery {
    location: Option<String>,
}

pub(super) async fn list(
    State(state): State<AppState>,
    Query(q): Query<LocationQuery>,
) -> Json<Vec<Cabin>> {
    let location = q.location.as_deref().filter(|l| !l.is_empty());
    Json(state.engine.list_cabins(location).await)
}

pub(super) async fn get_one(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Cabin>, ApiError> {
    let id = parse_id(&id)?;
    state
        .engine
        .get_cabin(id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("cabin not found: {id}")))
}

#[derive(Deserialize)]
pub(super) struct WindowQuery {
    from: Option<String>,
    to: Option<String>,
}

#[derive(Serialize)]
pub(super) struct AvailabilityResponse {
    cabin_id: Ulid,
    capacity: u32,
    days: Vec<DayAvailability>,
    /// Runs of fully booked days, for date pickers.
    full_ranges: Vec<Stay>,
}

pub(super) async fn availability(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<WindowQuery>,
) -> Result<Json<AvailabilityResponse>, ApiError> {
    let id = parse_id(&id)?;
    let today = Utc::now().date_naive();
    let from = q.from.as_deref().map(parse_date).transpose()?.unwrap_or(today);
    let to = match q.to.as_deref() {
        Some(raw) => parse_date(raw)?,
        None => from
            .checked_add_days(Days::new(DEFAULT_WINDOW_DAYS))
            .ok_or_else(|| ApiError::bad_request("date out of range"))?,
    };
    if to < from {
        return Err(ApiError::bad_request("'to' must not be before 'from'"));
    }
    let window = Stay::new(from, to);

    let cabin = state
        .engine
        .get_cabin(id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("cabin not found: {id}")))?;
    let days = state.engine.availability(id, window, today).await?;
    let full_ranges = state.engine.full_ranges(id, window).await?;
    Ok(Json(AvailabilityResponse {
        cabin_id: id,
        capacity: cabin.capacity,
        days,
        full_ranges,
    }))
}

pub(super) fn parse_id(raw: &str) -> Result<Ulid, ApiError> {
    Ulid::from_string(raw.trim()).map_err(|_| ApiError::bad_request(format!("invalid id: {raw}")))
}

/// `YYYY-MM-DD`; a trailing time part (`2025-01-10T00:00:00Z`) is ignored.
pub(super) fn parse_date(raw: &str) -> Result<NaiveDate, ApiError> {
    let trimmed = raw.trim();
    let day = match trimmed.get(10..) {
        Some(rest) if rest.starts_with('T') => &trimmed[..10],
        _ => trimmed,
    };
    NaiveDate::parse_from_str(day, "%Y-%m-%d").map_err(|_| ApiError::bad_request(format!("invalid date: {raw}")))
}
