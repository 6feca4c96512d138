//! Checkout flow: session creation, gateway notifications, the browser's
//! return redirect, and the administrator's lookup and reversal calls.

use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap},
    response::Response,
    Form, Json,
};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use ulid::Ulid;

use super::cabins::{parse_date, parse_id};
use super::security::{is_valid_email, AdminSession, CsrfProtected};
use super::{found, ApiError, AppState};
use crate::gateway::{
    is_plain_request_id, notification_status, redirect_status, string_or_number, Amount, Buyer, GatewayStatus,
    PaymentRequest, SessionRequest,
};
use crate::model::*;
use crate::observability::NOTIFICATIONS_TOTAL;

const SESSION_TTL_MINUTES: i64 = 15;
const LOCALE: &str = "es_CL";
const CURRENCY: &str = "CLP";
const DEFAULT_DOCUMENT_TYPE: &str = "CLRUT";
/// Sent when the guest gave no document; the gateway requires one.
const PLACEHOLDER_DOCUMENT: &str = "11111111-1";
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0";
const SESSION_ERROR_REASON: &str = "SESSION_ERROR";

pub fn booking_reference(id: Ulid) -> String {
    format!("BOOKING-{id}")
}

// ── Create transaction ───────────────────────────────────

#[derive(Deserialize, Default)]
#[serde(default)]
pub(super) struct CheckoutForm {
    #[serde(alias = "nombre")]
    name: Option<String>,
    email: Option<String>,
    #[serde(alias = "telefono", deserialize_with = "string_or_number")]
    phone: Option<String>,
    #[serde(alias = "cabaña_id", alias = "cabinId")]
    cabin_id: Option<String>,
    #[serde(alias = "fecha_inicio", alias = "startDate")]
    start_date: Option<String>,
    #[serde(alias = "fecha_fin", alias = "endDate")]
    end_date: Option<String>,
    #[serde(alias = "documento")]
    document: Option<String>,
    #[serde(alias = "tipoDocumento", alias = "documentType")]
    document_type: Option<String>,
    /// Client-side total. Informational only; the server computes its own.
    #[serde(alias = "monto", deserialize_with = "string_or_number")]
    amount: Option<String>,
}

fn required(field: &Option<String>, name: &str) -> Result<String, ApiError> {
    field
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::bad_request(format!("missing required field: {name}")))
}

/// Nightly price times billable nights.
pub fn stay_amount(nightly_price: u64, stay: &Stay) -> Option<u64> {
    nightly_price.checked_mul(stay.nights() as u64)
}

pub(super) async fn create_transaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(form): Json<CheckoutForm>,
) -> Result<Json<Value>, ApiError> {
    let name = required(&form.name, "name")?;
    let email = required(&form.email, "email")?;
    let phone = required(&form.phone, "phone")?;
    let cabin_id = parse_id(&required(&form.cabin_id, "cabin_id")?)?;
    let start = parse_date(&required(&form.start_date, "start_date")?)?;
    let end = parse_date(&required(&form.end_date, "end_date")?)?;
    if !is_valid_email(&email) {
        return Err(ApiError::bad_request("invalid email"));
    }
    if end < start {
        return Err(ApiError::bad_request("check-out before check-in"));
    }
    let stay = Stay::new(start, end);

    let cabin = state
        .engine
        .get_cabin(cabin_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("cabin not found: {cabin_id}")))?;
    let amount = stay_amount(cabin.nightly_price, &stay).ok_or_else(|| ApiError::bad_request("amount too large"))?;
    if let Some(client) = form.amount.as_deref().and_then(|a| a.parse::<f64>().ok()) {
        if client as u64 != amount {
            warn!("client amount {client} differs from computed {amount} for cabin {cabin_id}");
        }
    }

    let document_type = form
        .document_type
        .clone()
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_DOCUMENT_TYPE.into());
    let guest = Guest {
        name: name.clone(),
        email: email.clone(),
        phone: phone.clone(),
        document: form.document.clone().filter(|d| !d.trim().is_empty()),
        document_type: Some(document_type.clone()),
    };
    let booking = state
        .engine
        .create_booking(NewBooking {
            cabin_id,
            guest: guest.clone(),
            stay,
            status: BookingStatus::Pending,
            source: BookingSource::Direct,
            amount: Some(amount),
            notes: None,
        })
        .await?;

    let reference = booking_reference(booking.id);
    let (first_name, surname) = split_name(&name);
    let request = SessionRequest {
        locale: LOCALE.into(),
        buyer: Buyer {
            name: first_name,
            surname,
            email,
            document: guest.document.unwrap_or_else(|| PLACEHOLDER_DOCUMENT.into()),
            document_type,
            mobile: phone,
        },
        payment: PaymentRequest {
            reference: reference.clone(),
            description: format!("Cabin booking from {} to {}", stay.start, stay.end),
            amount: Amount {
                currency: CURRENCY.into(),
                total: amount,
            },
        },
        expiration: (Utc::now() + chrono::Duration::minutes(SESSION_TTL_MINUTES))
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        return_url: format!("{}/api/payment/response?id={}", state.config.site_url, booking.id),
        cancel_url: format!("{}/bookings", state.config.site_url),
        ip_address: client_ip(&headers),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_USER_AGENT)
            .to_string(),
        skip_result: true,
        no_buyer_fill: false,
    };

    let session = match state.gateway.create_session(&request).await {
        Ok(session) => session,
        Err(e) => {
            // Release the days held by the pending booking
            let update = PaymentUpdate {
                reason: Some(SESSION_ERROR_REASON.into()),
                ..PaymentUpdate::status(BookingStatus::Failed)
            };
            if let Err(release) = state.engine.apply_payment(booking.id, update).await {
                error!("could not release booking {} after gateway failure: {release}", booking.id);
            }
            return Err(e.into());
        }
    };

    state
        .engine
        .attach_payment_session(booking.id, session.request_id.clone(), session.process_url.clone())
        .await?;
    info!(
        "transaction created: requestId {} for booking {}",
        session.request_id, booking.id
    );

    Ok(Json(json!({
        "success": true,
        "redirect_url": session.process_url,
        "booking_id": booking.id,
        "request_id": session.request_id,
        "reference": reference,
    })))
}

/// First word is the given name; the rest is the surname.
fn split_name(full: &str) -> (String, String) {
    let mut parts = full.split_whitespace();
    let first = parts.next().unwrap_or_default().to_string();
    let rest = parts.collect::<Vec<_>>().join(" ");
    (first, rest)
}

fn client_ip(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    forwarded.or(real).unwrap_or("127.0.0.1").to_string()
}

// ── Notification ─────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Notification {
    #[serde(default)]
    status: Option<GatewayStatus>,
    #[serde(default, deserialize_with = "string_or_number")]
    request_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    reference: Option<String>,
    #[serde(default)]
    signature: Option<String>,
}

fn count_notification(result: &'static str) {
    metrics::counter!(NOTIFICATIONS_TOTAL, "result" => result).increment(1);
}

pub(super) async fn notification(
    State(state): State<AppState>,
    Json(raw): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let parsed: Notification = serde_json::from_value(raw.clone()).map_err(|e| {
        count_notification("malformed");
        ApiError::bad_request(format!("malformed notification: {e}"))
    })?;
    let (Some(status), Some(request_id), Some(_reference), Some(signature)) =
        (parsed.status, parsed.request_id, parsed.reference, parsed.signature)
    else {
        count_notification("incomplete");
        return Err(ApiError::bad_request("incomplete notification"));
    };

    let date = status.date.clone().unwrap_or_default();
    if !state
        .credentials
        .verify_notification(&request_id, &status.status, &date, &signature)
    {
        warn!("notification for requestId {request_id} has an invalid signature");
        count_notification("bad_signature");
        return Err(ApiError::Unauthorized("notification signature mismatch"));
    }

    let Some(booking) = state.engine.find_by_token(&request_id).await else {
        warn!("notification for unknown requestId {request_id}");
        count_notification("unknown");
        return Ok(Json(json!({
            "message": "booking not found, notification processed",
        })));
    };

    let target = notification_status(&status.status);
    let details = json!({
        "notification": raw,
        "timestamp": Utc::now().to_rfc3339(),
        "status": status.status,
        "reason": status.reason,
        "message": status.message,
    });
    let update = PaymentUpdate {
        status: target,
        gateway_status: Some(status.status.clone()),
        reason: status.reason.clone(),
        details: Some(details.to_string()),
        date: status.date.clone(),
        internal_reference: None,
    };
    let (booking, transition) = state.engine.apply_payment(booking.id, update).await?;
    count_notification("processed");
    info!(
        "notification {} for booking {}: now {} ({transition:?})",
        status.status, booking.id, booking.status
    );

    Ok(Json(json!({
        "message": "notification processed",
        "booking_id": booking.id,
        "status": booking.status,
        "transition": transition,
    })))
}

// ── Return redirect ──────────────────────────────────────

pub(super) async fn response_get(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    process_return(&state, &query, &HashMap::new()).await
}

pub(super) async fn response_post(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    process_return(&state, &query, &form).await
}

fn first_param<'a>(sources: &[&'a HashMap<String, String>], keys: &[&str]) -> Option<&'a str> {
    for key in keys {
        for &source in sources {
            if let Some(value) = source.get(*key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
                return Some(value);
            }
        }
    }
    None
}

async fn process_return(
    state: &AppState,
    query: &HashMap<String, String>,
    form: &HashMap<String, String>,
) -> Response {
    let site = &state.config.site_url;
    match reconcile_return(state, query, form).await {
        Ok((id, status)) => found(&format!("{site}/booking-result?id={id}&status={status}")),
        Err(message) => {
            warn!("payment return failed: {message}");
            let url = reqwest::Url::parse_with_params(
                &format!("{site}/booking-result"),
                &[("error", "true"), ("message", message.as_str())],
            )
            .map(|u| u.to_string())
            .unwrap_or_else(|_| format!("{site}/booking-result?error=true"));
            found(&url)
        }
    }
}

async fn reconcile_return(
    state: &AppState,
    query: &HashMap<String, String>,
    form: &HashMap<String, String>,
) -> Result<(Ulid, BookingStatus), String> {
    // Form fields win over the query string
    let sources = [form, query];
    let raw_id = first_param(&sources, &["id", "reserva_id", "reference"])
        .ok_or_else(|| "missing booking id".to_string())?;
    let id = Ulid::from_string(raw_id.trim_start_matches("BOOKING-"))
        .map_err(|_| format!("invalid booking id: {raw_id}"))?;
    let booking = state
        .engine
        .get_booking(id)
        .await
        .ok_or_else(|| format!("booking not found: {id}"))?;

    if booking.status == BookingStatus::Confirmed {
        return Ok((id, booking.status));
    }

    // A booking only reconciles against its own session
    let supplied = first_param(&sources, &["requestId", "id_session", "session", "ref"]);
    let request_id = match (booking.payment.request_token.as_deref(), supplied) {
        (Some(stored), Some(supplied)) if supplied != stored => {
            return Err(format!("payment session {supplied} does not belong to booking {id}"));
        }
        (Some(stored), _) => Some(stored.to_string()),
        (None, supplied) => supplied.map(str::to_string),
    };
    let Some(request_id) = request_id else {
        let update = PaymentUpdate {
            gateway_status: Some("PENDING".into()),
            details: Some(json!({"message": "could not verify payment status"}).to_string()),
            ..PaymentUpdate::status(BookingStatus::Pending)
        };
        let (booking, _) = state.engine.apply_payment(id, update).await.map_err(|e| e.to_string())?;
        return Ok((id, booking.status));
    };
    if !is_plain_request_id(&request_id) {
        return Err(format!("invalid payment session id: {request_id}"));
    }

    let info = state
        .gateway
        .request_information(&request_id)
        .await
        .map_err(|e| e.to_string())?;
    if info.payment_reference() != Some(booking_reference(id).as_str()) {
        return Err(format!("payment session {request_id} is not for booking {id}"));
    }
    let target = redirect_status(info.status_str());
    let update = PaymentUpdate {
        status: target,
        gateway_status: info.status_str().map(str::to_string),
        reason: info.status.as_ref().and_then(|s| s.reason.clone()),
        details: Some(info.raw.to_string()),
        date: info.status.as_ref().and_then(|s| s.date.clone()),
        internal_reference: info.internal_reference().map(str::to_string),
    };
    let (booking, transition) = state.engine.apply_payment(id, update).await.map_err(|e| e.to_string())?;
    info!(
        "payment return for booking {id}: gateway {:?}, now {} ({transition:?})",
        info.status_str(),
        booking.status
    );
    Ok((id, booking.status))
}

// ── Admin: lookup and reversal ───────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RequestInfoBody {
    #[serde(default, deserialize_with = "string_or_number")]
    request_id: Option<String>,
}

pub(super) async fn request_info(
    State(state): State<AppState>,
    _admin: AdminSession,
    Json(body): Json<RequestInfoBody>,
) -> Result<Json<Value>, ApiError> {
    let request_id = required(&body.request_id, "requestId")?;
    let info = state.gateway.request_information(&request_id).await?;
    Ok(Json(json!({ "success": true, "data": info.digest() })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ReverseBody {
    #[serde(default, deserialize_with = "string_or_number")]
    internal_reference: Option<String>,
    #[serde(default, alias = "booking_id")]
    booking_id: Option<String>,
}

pub(super) async fn reverse(
    State(state): State<AppState>,
    CsrfProtected(admin): CsrfProtected,
    Json(body): Json<ReverseBody>,
) -> Result<Json<Value>, ApiError> {
    let booking_id = body.booking_id.as_deref().map(parse_id).transpose()?;
    let booking = match booking_id {
        Some(id) => Some(
            state
                .engine
                .get_booking(id)
                .await
                .ok_or_else(|| ApiError::NotFound(format!("booking not found: {id}")))?,
        ),
        None => None,
    };
    let internal_reference = body
        .internal_reference
        .clone()
        .filter(|r| !r.trim().is_empty())
        .or_else(|| booking.as_ref().and_then(|b| b.payment.internal_reference.clone()))
        .ok_or_else(|| ApiError::bad_request("internalReference is required to reverse a payment"))?;

    info!("{} reversing payment {internal_reference}", admin.email);
    let result = state.gateway.reverse(&internal_reference).await?;

    let mut refunded = None;
    if let Some(booking) = booking {
        let update = PaymentUpdate {
            gateway_status: Some("REFUNDED".into()),
            reason: result.status.reason.clone(),
            details: result.payment.as_ref().map(Value::to_string),
            date: result.status.date.clone(),
            internal_reference: Some(internal_reference.clone()),
            ..PaymentUpdate::status(BookingStatus::Refunded)
        };
        let (updated, _) = state.engine.apply_payment(booking.id, update).await?;
        refunded = Some(updated);
    }

    Ok(Json(json!({
        "success": true,
        "message": "payment reversed",
        "data": {
            "status": result.status,
            "payment": result.payment,
            "success": true,
            "message": result.status.message,
        },
        "booking": refunded,
    })))
}
