//! HTTP surface: public booking and payment endpoints, the calendar feeds,
//! the cron trigger, and the administrator API.

mod admin;
mod auth;
mod cabins;
mod calendar;
mod cron;
pub mod error;
mod payment;
pub mod security;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{MatchedPath, Request},
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer, trace::TraceLayer};

use crate::config::Config;
use crate::engine::Engine;
use crate::gateway::{Credentials, PaymentGateway};
use crate::observability::{HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS};
use crate::sync::CalendarFetcher;

pub use error::ApiError;

/// Shared handler state. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub gateway: Arc<dyn PaymentGateway>,
    /// Used to verify notification signatures.
    pub credentials: Credentials,
    pub fetcher: Arc<dyn CalendarFetcher>,
    pub config: Arc<Config>,
}

const SECURITY_HEADERS: [(&str, &str); 8] = [
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("x-xss-protection", "1; mode=block"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    ("permissions-policy", "camera=(), microphone=(), geolocation=()"),
    ("x-dns-prefetch-control", "off"),
    ("x-download-options", "noopen"),
    ("x-permitted-cross-domain-policies", "none"),
];

const HSTS: &str = "max-age=31536000; includeSubDomains; preload";

pub fn router(state: AppState) -> Router {
    // Called from the checkout page and by the gateway
    let payment_public = Router::new()
        .route("/api/payment/create-transaction", post(payment::create_transaction))
        .route("/api/payment/notification", post(payment::notification))
        .route(
            "/api/payment/response",
            get(payment::response_get).post(payment::response_post),
        )
        .layer(CorsLayer::permissive());

    let app = Router::new()
        .route("/api/cabins", get(cabins::list))
        .route("/api/cabins/{id}", get(cabins::get_one))
        .route("/api/cabins/{id}/availability", get(cabins::availability))
        .merge(payment_public)
        .route("/api/payment/get-request-info", post(payment::request_info))
        .route("/api/payment/reverse", post(payment::reverse))
        .route("/api/calendar/import", post(calendar::import))
        .route("/api/calendar/links", post(calendar::create_link))
        .route("/api/calendar/export/{token}", get(calendar::export))
        .route("/api/cron/sync-calendars", get(cron::sync_get).post(cron::sync_post))
        .route("/api/auth/signin", post(auth::signin))
        .route("/api/auth/signout", post(auth::signout))
        .route("/api/admin/bookings", get(admin::list_bookings).post(admin::create_booking))
        .route(
            "/api/admin/bookings/{id}",
            put(admin::update_booking).delete(admin::delete_booking),
        )
        .route("/api/admin/cabins", get(admin::list_cabins).post(admin::create_cabin))
        .route("/api/admin/cabins/{id}", put(admin::update_cabin))
        .route("/api/admin/calendar-sources", get(admin::list_sources))
        .route("/api/admin/calendar-sources/{cabin_id}", put(admin::set_source_enabled))
        .route("/health", get(health))
        .route_layer(middleware::from_fn(track_metrics))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http());

    with_security_headers(app, state.config.production).with_state(state)
}

fn with_security_headers(mut app: Router<AppState>, production: bool) -> Router<AppState> {
    for (name, value) in SECURITY_HEADERS {
        app = app.layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        ));
    }
    if production {
        app = app.layer(SetResponseHeaderLayer::if_not_present(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static(HSTS),
        ));
    }
    app
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".into());
    let method = req.method().to_string();

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    metrics::counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.clone(),
        "route" => route.clone(),
        "status" => status
    )
    .increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "route" => route)
        .record(start.elapsed().as_secs_f64());
    response
}

async fn health() -> &'static str {
    "ok"
}

async fn not_found() -> Response {
    ApiError::NotFound("no such endpoint".into()).into_response()
}

/// `302 Found` to `location`.
pub(crate) fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(_) => ApiError::Internal(format!("unrepresentable redirect target: {location}")).into_response(),
    }
}
