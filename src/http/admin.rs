//! Administrator API. Reads need a session; writes also need the CSRF token.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use ulid::Ulid;

use super::cabins::{parse_date, parse_id};
use super::payment::stay_amount;
use super::security::{AdminSession, CsrfProtected};
use super::{ApiError, AppState};
use crate::model::*;

// ── Bookings ─────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct BookingQuery {
    cabin_id: Option<String>,
    from: Option<String>,
    to: Option<String>,
    location: Option<String>,
    status: Option<BookingStatus>,
}

pub(super) async fn list_bookings(
    State(state): State<AppState>,
    _admin: AdminSession,
    Query(q): Query<BookingQuery>,
) -> Result<Json<Value>, ApiError> {
    let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
    let filter = BookingFilter {
        cabin_id: non_empty(q.cabin_id).as_deref().map(parse_id).transpose()?,
        from: non_empty(q.from).as_deref().map(parse_date).transpose()?,
        to: non_empty(q.to).as_deref().map(parse_date).transpose()?,
        location: non_empty(q.location),
        status: q.status,
    };
    let bookings = state.engine.list_bookings(&filter).await;
    Ok(Json(json!({ "success": true, "bookings": bookings })))
}

/// Booking fields as sent by the admin panel. On update, absent fields
/// keep their current value.
#[derive(Deserialize, Default)]
#[serde(default)]
pub(super) struct BookingBody {
    #[serde(alias = "nombre")]
    name: Option<String>,
    email: Option<String>,
    #[serde(alias = "telefono")]
    phone: Option<String>,
    #[serde(alias = "documento")]
    document: Option<String>,
    #[serde(alias = "tipoDocumento")]
    document_type: Option<String>,
    #[serde(alias = "cabaña_id")]
    cabin_id: Option<String>,
    #[serde(alias = "fecha_inicio")]
    start_date: Option<String>,
    #[serde(alias = "fecha_fin")]
    end_date: Option<String>,
    status: Option<BookingStatus>,
    amount: Option<u64>,
    notes: Option<String>,
}

fn pick(new: Option<String>, current: Option<&str>, field: &str) -> Result<String, ApiError> {
    new.map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| current.map(str::to_string))
        .ok_or_else(|| ApiError::bad_request(format!("missing required field: {field}")))
}

/// Merge `body` over `current` (if any) into guest, cabin and stay.
fn resolve(body: &BookingBody, current: Option<&Booking>) -> Result<(Guest, Ulid, Stay), ApiError> {
    let guest = Guest {
        name: pick(body.name.clone(), current.map(|b| b.guest.name.as_str()), "name")?,
        email: pick(body.email.clone(), current.map(|b| b.guest.email.as_str()), "email")?,
        phone: pick(body.phone.clone(), current.map(|b| b.guest.phone.as_str()), "phone")?,
        document: body
            .document
            .clone()
            .or_else(|| current.and_then(|b| b.guest.document.clone())),
        document_type: body
            .document_type
            .clone()
            .or_else(|| current.and_then(|b| b.guest.document_type.clone())),
    };
    let cabin_id = match (&body.cabin_id, current) {
        (Some(raw), _) => parse_id(raw)?,
        (None, Some(b)) => b.cabin_id,
        (None, None) => return Err(ApiError::bad_request("missing required field: cabin_id")),
    };
    let date = |raw: &Option<String>, fallback: Option<NaiveDate>, field: &str| match raw {
        Some(raw) => parse_date(raw),
        None => fallback.ok_or_else(|| ApiError::bad_request(format!("missing required field: {field}"))),
    };
    let start = date(&body.start_date, current.map(|b| b.stay.start), "start_date")?;
    let end = date(&body.end_date, current.map(|b| b.stay.end), "end_date")?;
    if end < start {
        return Err(ApiError::bad_request("check-out before check-in"));
    }
    Ok((guest, cabin_id, Stay::new(start, end)))
}

pub(super) async fn create_booking(
    State(state): State<AppState>,
    CsrfProtected(admin): CsrfProtected,
    Json(body): Json<BookingBody>,
) -> Result<Json<Value>, ApiError> {
    let (guest, cabin_id, stay) = resolve(&body, None)?;
    let cabin = state
        .engine
        .get_cabin(cabin_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("cabin not found: {cabin_id}")))?;
    let amount = match body.amount {
        Some(amount) => amount,
        None => stay_amount(cabin.nightly_price, &stay).ok_or_else(|| ApiError::bad_request("amount too large"))?,
    };
    let booking = state
        .engine
        .create_booking(NewBooking {
            cabin_id,
            guest,
            stay,
            status: body.status.unwrap_or(BookingStatus::Confirmed),
            source: BookingSource::Admin,
            amount: Some(amount),
            notes: body.notes.clone().filter(|n| !n.trim().is_empty()),
        })
        .await?;
    info!("{} created booking {} for cabin {cabin_id}", admin.email, booking.id);
    Ok(Json(json!({ "success": true, "booking": booking })))
}

pub(super) async fn update_booking(
    State(state): State<AppState>,
    CsrfProtected(admin): CsrfProtected,
    Path(id): Path<String>,
    Json(body): Json<BookingBody>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    let current = state
        .engine
        .get_booking(id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("booking not found: {id}")))?;
    // Refuse the whole edit up front when the status move is not allowed
    if let Some(status) = body.status
        && current.status.transition(status) == Transition::Ignored
    {
        return Err(ApiError::Conflict(format!(
            "cannot move booking from {} to {status}",
            current.status
        )));
    }
    let (guest, cabin_id, stay) = resolve(&body, Some(&current))?;
    let notes = match body.notes.clone() {
        Some(n) if n.trim().is_empty() => None,
        Some(n) => Some(n),
        None => current.notes.clone(),
    };
    let mut booking = state
        .engine
        .update_booking(id, BookingEdit { cabin_id, guest, stay, notes })
        .await?;

    // Status changes go through the payment state machine
    if let Some(status) = body.status
        && status != booking.status
    {
        let (updated, transition) = state.engine.apply_payment(id, PaymentUpdate::status(status)).await?;
        if transition == Transition::Ignored {
            return Err(ApiError::Conflict(format!(
                "cannot move booking from {} to {status}",
                booking.status
            )));
        }
        booking = updated;
    }
    info!("{} updated booking {id}", admin.email);
    Ok(Json(json!({ "success": true, "booking": booking })))
}

pub(super) async fn delete_booking(
    State(state): State<AppState>,
    CsrfProtected(admin): CsrfProtected,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    let booking = state.engine.delete_booking(id).await?;
    info!("{} deleted booking {id}", admin.email);
    Ok(Json(json!({ "success": true, "booking": booking })))
}

// ── Cabins ───────────────────────────────────────────────

pub(super) async fn list_cabins(State(state): State<AppState>, _admin: AdminSession) -> Json<Value> {
    let cabins = state.engine.list_cabins(None).await;
    Json(json!({ "success": true, "cabins": cabins }))
}

#[derive(Deserialize)]
pub(super) struct CabinBody {
    #[serde(alias = "nombre")]
    name: String,
    #[serde(alias = "precio", alias = "price")]
    nightly_price: u64,
    #[serde(alias = "capacidad")]
    capacity: u32,
    #[serde(alias = "ubicacion")]
    location: String,
}

impl From<CabinBody> for CabinDraft {
    fn from(b: CabinBody) -> Self {
        CabinDraft {
            name: b.name.trim().to_string(),
            nightly_price: b.nightly_price,
            capacity: b.capacity,
            location: b.location.trim().to_lowercase(),
        }
    }
}

pub(super) async fn create_cabin(
    State(state): State<AppState>,
    CsrfProtected(admin): CsrfProtected,
    Json(body): Json<CabinBody>,
) -> Result<Json<Value>, ApiError> {
    let cabin = state.engine.create_cabin(body.into()).await?;
    info!("{} created cabin {} ({})", admin.email, cabin.name, cabin.id);
    Ok(Json(json!({ "success": true, "cabin": cabin })))
}

pub(super) async fn update_cabin(
    State(state): State<AppState>,
    CsrfProtected(admin): CsrfProtected,
    Path(id): Path<String>,
    Json(body): Json<CabinBody>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    let cabin = state.engine.update_cabin(id, body.into()).await?;
    info!("{} updated cabin {id}", admin.email);
    Ok(Json(json!({ "success": true, "cabin": cabin })))
}

// ── Calendar sources ─────────────────────────────────────

pub(super) async fn list_sources(State(state): State<AppState>, _admin: AdminSession) -> Json<Value> {
    let sources = state.engine.list_sources(false);
    let link = |cabin_id| {
        state
            .engine
            .link_for_cabin(cabin_id)
            .map(|l| format!("{}/api/calendar/export/{}.ics", state.config.site_url, l.token))
    };
    let sources: Vec<Value> = sources
        .into_iter()
        .map(|s| {
            let export_url = link(s.cabin_id);
            json!({ "source": s, "export_url": export_url })
        })
        .collect();
    Json(json!({ "success": true, "sources": sources }))
}

#[derive(Deserialize)]
pub(super) struct EnabledBody {
    enabled: bool,
}

pub(super) async fn set_source_enabled(
    State(state): State<AppState>,
    CsrfProtected(admin): CsrfProtected,
    Path(cabin_id): Path<String>,
    Json(body): Json<EnabledBody>,
) -> Result<Json<Value>, ApiError> {
    let cabin_id = parse_id(&cabin_id)?;
    let source = state.engine.set_source_enabled(cabin_id, body.enabled).await?;
    info!(
        "{} {} calendar sync for cabin {cabin_id}",
        admin.email,
        if body.enabled { "enabled" } else { "disabled" }
    );
    Ok(Json(json!({ "success": true, "source": source })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn existing() -> Booking {
        let d = |s| NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap();
        Booking {
            id: Ulid::new(),
            cabin_id: Ulid::new(),
            guest: Guest {
                name: "Ana".into(),
                email: "ana@example.com".into(),
                phone: "+56911112222".into(),
                document: None,
                document_type: None,
            },
            stay: Stay::new(d("2025-02-01"), d("2025-02-03")),
            status: BookingStatus::Confirmed,
            amount: Some(90_000),
            source: BookingSource::Admin,
            external_id: None,
            notes: None,
            payment: PaymentInfo::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn update_keeps_absent_fields() {
        let current = existing();
        let body = BookingBody {
            end_date: Some("2025-02-05".into()),
            phone: Some("  ".into()),
            ..Default::default()
        };
        let (guest, cabin_id, stay) = resolve(&body, Some(&current)).unwrap();
        assert_eq!(guest, current.guest);
        assert_eq!(cabin_id, current.cabin_id);
        assert_eq!(stay.start, current.stay.start);
        assert_eq!(stay.end.to_string(), "2025-02-05");
    }

    #[test]
    fn create_requires_everything() {
        let body = BookingBody {
            name: Some("Ana".into()),
            ..Default::default()
        };
        assert!(matches!(resolve(&body, None), Err(ApiError::BadRequest(m)) if m.contains("email")));
    }

    #[test]
    fn reversed_dates_rejected() {
        let current = existing();
        let body = BookingBody {
            start_date: Some("2025-02-10".into()),
            ..Default::default()
        };
        assert!(resolve(&body, Some(&current)).is_err());
    }
}
