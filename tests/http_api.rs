use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;
use ulid::Ulid;

use cabinbook::config::Config;
use cabinbook::engine::Engine;
use cabinbook::gateway::*;
use cabinbook::http::security::{generate_csrf_token, sign_session, CSRF_COOKIE, CSRF_HEADER, SESSION_COOKIE};
use cabinbook::http::{router, AppState};
use cabinbook::model::*;
use cabinbook::notify::NotifyHub;
use cabinbook::sync::{CalendarFetcher, FetchError};

const ADMIN_EMAIL: &str = "admin@example.com";
const SECRET_KEY: &str = "gateway-secret";

// ── Fakes ────────────────────────────────────────────────

struct FakeGateway {
    fail_sessions: bool,
    lookup_status: String,
    next_id: AtomicU64,
    /// Payment reference of every session issued, by request id.
    sessions: Mutex<HashMap<String, String>>,
    lookups: AtomicU64,
    reversed: Mutex<Vec<String>>,
}

impl FakeGateway {
    fn new(lookup_status: &str) -> Self {
        Self {
            fail_sessions: false,
            lookup_status: lookup_status.into(),
            next_id: AtomicU64::new(1000),
            sessions: Mutex::new(HashMap::new()),
            lookups: AtomicU64::new(0),
            reversed: Mutex::new(Vec::new()),
        }
    }

    fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }

    fn failing() -> Self {
        Self {
            fail_sessions: true,
            ..Self::new("PENDING")
        }
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_session(&self, request: &SessionRequest) -> Result<SessionCreated, GatewayError> {
        if self.fail_sessions {
            return Err(GatewayError::Http("connection refused".into()));
        }
        assert!(request.payment.reference.starts_with("BOOKING-"));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        self.sessions
            .lock()
            .unwrap()
            .insert(id.clone(), request.payment.reference.clone());
        Ok(SessionCreated {
            process_url: format!("https://checkout.test/session/{id}"),
            request_id: id,
        })
    }

    async fn request_information(&self, request_id: &str) -> Result<RequestInformation, GatewayError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let mut raw = json!({
            "requestId": request_id,
            "status": {"status": self.lookup_status, "reason": "00", "message": "lookup"},
            "payment": [],
        });
        if let Some(reference) = self.sessions.lock().unwrap().get(request_id) {
            raw["request"] = json!({"locale": "es_CL", "payment": {"reference": reference}});
        }
        Ok(RequestInformation {
            request_id: Some(request_id.into()),
            status: Some(GatewayStatus {
                status: self.lookup_status.clone(),
                reason: Some("00".into()),
                message: Some("lookup".into()),
                date: None,
            }),
            payments: Vec::new(),
            raw,
        })
    }

    async fn reverse(&self, internal_reference: &str) -> Result<ReverseResult, GatewayError> {
        self.reversed.lock().unwrap().push(internal_reference.into());
        Ok(ReverseResult {
            status: GatewayStatus {
                status: "APPROVED".into(),
                message: Some("reversed".into()),
                ..Default::default()
            },
            payment: None,
        })
    }
}

#[derive(Default)]
struct FakeFetcher {
    feeds: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl CalendarFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        self.feeds
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or(FetchError::Status(404))
    }
}

// ── Harness ──────────────────────────────────────────────

struct Harness {
    app: Router,
    engine: Arc<Engine>,
    config: Arc<Config>,
    gateway: Arc<FakeGateway>,
    fetcher: Arc<FakeFetcher>,
}

fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("cabinbook_test_http").join(name);
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn harness(name: &str, gateway: FakeGateway) -> Harness {
    let dir = test_dir(name);
    let vars: HashMap<&str, String> = [
        ("CABINBOOK_DATA_DIR", dir.display().to_string()),
        ("SITE_URL", "https://cabins.test/".into()),
        ("GETNET_LOGIN", "login".into()),
        ("GETNET_SECRET_KEY", SECRET_KEY.into()),
        ("CRON_SECRET_KEY", "cron-secret".into()),
        ("ADMIN_SECRET", "manual-secret".into()),
        ("ADMIN_EMAIL", ADMIN_EMAIL.into()),
        ("ADMIN_PASSWORD", "hunter22".into()),
        ("SESSION_SECRET", "session-secret".into()),
    ]
    .into();
    let config = Arc::new(Config::from_lookup(|k| vars.get(k).cloned()).unwrap());
    let engine = Arc::new(Engine::new(config.wal_path(), Arc::new(NotifyHub::new())).unwrap());
    let gateway = Arc::new(gateway);
    let fetcher = Arc::new(FakeFetcher::default());
    let state = AppState {
        engine: engine.clone(),
        gateway: gateway.clone(),
        credentials: Credentials::new("login", SECRET_KEY),
        fetcher: fetcher.clone(),
        config: config.clone(),
    };
    Harness {
        app: router(state),
        engine,
        config,
        gateway,
        fetcher,
    }
}

impl Harness {
    async fn send(&self, req: Request<Body>) -> Response {
        self.app.clone().oneshot(req).await.unwrap()
    }

    async fn cabin(&self, capacity: u32) -> Cabin {
        self.engine
            .create_cabin(CabinDraft {
                name: "Casa Mar".into(),
                nightly_price: 45_000,
                capacity,
                location: "laserena".into(),
            })
            .await
            .unwrap()
    }

    fn admin_cookies(&self, csrf: &str) -> String {
        let expires = chrono::Utc::now().timestamp() + 600;
        let session = sign_session(&self.config.session_secret, ADMIN_EMAIL, expires);
        format!("{SESSION_COOKIE}={session}; {CSRF_COOKIE}={csrf}")
    }
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(resp: Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(resp: Response) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn location(resp: &Response) -> String {
    resp.headers()[header::LOCATION].to_str().unwrap().to_string()
}

fn checkout(cabin_id: Ulid, start: &str, end: &str) -> Value {
    json!({
        "nombre": "Ana María Rojas",
        "email": "ana@example.com",
        "telefono": "+56911112222",
        "cabaña_id": cabin_id.to_string(),
        "fecha_inicio": start,
        "fecha_fin": end,
    })
}

fn notification(request_id: &str, status: &str, booking_id: &str) -> Value {
    let date = "2025-03-01T10:00:00-03:00";
    let signature = Credentials::new("login", SECRET_KEY).notification_signature(request_id, status, date);
    json!({
        "status": {"status": status, "reason": "00", "message": "ok", "date": date},
        "requestId": request_id.parse::<u64>().unwrap(),
        "reference": format!("BOOKING-{booking_id}"),
        "signature": signature,
    })
}

// ── Checkout and notifications ───────────────────────────

#[tokio::test]
async fn checkout_then_approved_notification_confirms() {
    let h = harness("checkout_confirm", FakeGateway::new("PENDING"));
    let cabin = h.cabin(2).await;

    let resp = h
        .send(json_request(
            "POST",
            "/api/payment/create-transaction",
            checkout(cabin.id, "2025-03-10", "2025-03-12"),
        ))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["success"], true);
    let booking_id = body["booking_id"].as_str().unwrap().to_string();
    let request_id = body["request_id"].as_str().unwrap().to_string();
    assert_eq!(body["reference"], format!("BOOKING-{booking_id}"));
    assert_eq!(body["redirect_url"], format!("https://checkout.test/session/{request_id}"));

    let id = Ulid::from_string(&booking_id).unwrap();
    let pending = h.engine.get_booking(id).await.unwrap();
    assert_eq!(pending.status, BookingStatus::Pending);
    assert_eq!(pending.amount, Some(90_000));
    assert_eq!(pending.source, BookingSource::Direct);

    let resp = h
        .send(json_request(
            "POST",
            "/api/payment/notification",
            notification(&request_id, "APPROVED", &booking_id),
        ))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["status"], "confirmed");
    assert_eq!(body["transition"], "applied");

    // Gateway retries the same notification
    let resp = h
        .send(json_request(
            "POST",
            "/api/payment/notification",
            notification(&request_id, "APPROVED", &booking_id),
        ))
        .await;
    assert_eq!(body_json(resp).await["transition"], "unchanged");

    // A late PENDING never downgrades a confirmed booking
    let resp = h
        .send(json_request(
            "POST",
            "/api/payment/notification",
            notification(&request_id, "PENDING", &booking_id),
        ))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["status"], "confirmed");
    assert_eq!(body["transition"], "ignored");

    let confirmed = h.engine.get_booking(id).await.unwrap();
    assert!(confirmed.payment.confirmed_at.is_some());
    assert_eq!(confirmed.payment.gateway_status.as_deref(), Some("APPROVED"));
}

#[tokio::test]
async fn notification_signature_and_shape_are_checked() {
    let h = harness("notification_checks", FakeGateway::new("PENDING"));

    let mut forged = notification("1000", "APPROVED", "x");
    forged["signature"] = json!("deadbeef");
    let resp = h.send(json_request("POST", "/api/payment/notification", forged)).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = h
        .send(json_request("POST", "/api/payment/notification", json!({"requestId": 1})))
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["success"], false);

    // Valid but for a session we never issued
    let resp = h
        .send(json_request(
            "POST",
            "/api/payment/notification",
            notification("4242", "APPROVED", "x"),
        ))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn full_days_reject_second_checkout() {
    let h = harness("checkout_capacity", FakeGateway::new("PENDING"));
    let cabin = h.cabin(1).await;

    let first = h
        .send(json_request(
            "POST",
            "/api/payment/create-transaction",
            checkout(cabin.id, "2025-05-01", "2025-05-03"),
        ))
        .await;
    assert_eq!(first.status(), StatusCode::OK);

    let overlapping = h
        .send(json_request(
            "POST",
            "/api/payment/create-transaction",
            checkout(cabin.id, "2025-05-03", "2025-05-04"),
        ))
        .await;
    assert_eq!(overlapping.status(), StatusCode::CONFLICT);

    let adjacent = h
        .send(json_request(
            "POST",
            "/api/payment/create-transaction",
            checkout(cabin.id, "2025-05-04", "2025-05-05"),
        ))
        .await;
    assert_eq!(adjacent.status(), StatusCode::OK);
}

#[tokio::test]
async fn gateway_failure_releases_the_days() {
    let h = harness("checkout_gateway_down", FakeGateway::failing());
    let cabin = h.cabin(1).await;

    let resp = h
        .send(json_request(
            "POST",
            "/api/payment/create-transaction",
            checkout(cabin.id, "2025-06-01", "2025-06-02"),
        ))
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

    let bookings = h.engine.list_bookings(&BookingFilter::default()).await;
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].status, BookingStatus::Failed);
    assert_eq!(bookings[0].payment.reason.as_deref(), Some("SESSION_ERROR"));

    let days = h
        .engine
        .availability(cabin.id, bookings[0].stay, bookings[0].stay.start)
        .await
        .unwrap();
    assert!(days.iter().all(|d| d.booked == 0));
}

#[tokio::test]
async fn checkout_requires_fields() {
    let h = harness("checkout_fields", FakeGateway::new("PENDING"));
    let cabin = h.cabin(1).await;
    let mut body = checkout(cabin.id, "2025-06-01", "2025-06-02");
    body.as_object_mut().unwrap().remove("email");
    let resp = h.send(json_request("POST", "/api/payment/create-transaction", body)).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(h.engine.list_bookings(&BookingFilter::default()).await.is_empty());
}

// ── Return redirect ──────────────────────────────────────

#[tokio::test]
async fn return_redirect_reconciles_with_gateway() {
    let h = harness("return_redirect", FakeGateway::new("APPROVED"));
    let cabin = h.cabin(1).await;
    let resp = h
        .send(json_request(
            "POST",
            "/api/payment/create-transaction",
            checkout(cabin.id, "2025-07-01", "2025-07-03"),
        ))
        .await;
    let booking_id = body_json(resp).await["booking_id"].as_str().unwrap().to_string();

    let req = Request::get(format!("/api/payment/response?id={booking_id}"))
        .body(Body::empty())
        .unwrap();
    let resp = h.send(req).await;
    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(
        location(&resp),
        format!("https://cabins.test/booking-result?id={booking_id}&status=confirmed")
    );

    let id = Ulid::from_string(&booking_id).unwrap();
    assert_eq!(h.engine.get_booking(id).await.unwrap().status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn return_redirect_without_booking_reports_error() {
    let h = harness("return_error", FakeGateway::new("APPROVED"));
    let req = Request::get("/api/payment/response").body(Body::empty()).unwrap();
    let resp = h.send(req).await;
    assert_eq!(resp.status(), StatusCode::FOUND);
    assert!(location(&resp).starts_with("https://cabins.test/booking-result?error=true&message="));
}

impl Harness {
    /// Runs a checkout and returns the booking id and gateway request id.
    async fn checkout(&self, cabin_id: Ulid, start: &str, end: &str) -> (Ulid, String) {
        let resp = self
            .send(json_request(
                "POST",
                "/api/payment/create-transaction",
                checkout(cabin_id, start, end),
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        let id = Ulid::from_string(body["booking_id"].as_str().unwrap()).unwrap();
        (id, body["request_id"].as_str().unwrap().to_string())
    }

    async fn get(&self, uri: &str) -> Response {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }
}

#[tokio::test]
async fn return_redirect_ignores_foreign_sessions() {
    let h = harness("return_foreign_session", FakeGateway::new("APPROVED"));
    let cabin = h.cabin(2).await;
    let (mine, _) = h.checkout(cabin.id, "2025-07-10", "2025-07-11").await;
    let (_, theirs) = h.checkout(cabin.id, "2025-07-20", "2025-07-21").await;

    for request_id in [theirs.as_str(), "..%2Freverse", "424242"] {
        let resp = h
            .get(&format!("/api/payment/response?id={mine}&requestId={request_id}"))
            .await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert!(location(&resp).starts_with("https://cabins.test/booking-result?error=true&message="));
    }
    assert_eq!(h.gateway.lookups(), 0);
    assert_eq!(h.engine.get_booking(mine).await.unwrap().status, BookingStatus::Pending);

    // No stored session: the supplied one must carry this booking's reference
    let walk_in = h
        .engine
        .create_booking(NewBooking {
            cabin_id: cabin.id,
            guest: Guest {
                name: "Luis".into(),
                email: "luis@example.com".into(),
                phone: "+56933334444".into(),
                document: None,
                document_type: None,
            },
            stay: Stay::new(
                "2025-07-25".parse().unwrap(),
                "2025-07-26".parse().unwrap(),
            ),
            status: BookingStatus::Pending,
            source: BookingSource::Admin,
            amount: Some(45_000),
            notes: None,
        })
        .await
        .unwrap();
    let resp = h
        .get(&format!("/api/payment/response?id={}&requestId={theirs}", walk_in.id))
        .await;
    assert!(location(&resp).contains("error=true"));
    assert_eq!(h.gateway.lookups(), 1);
    assert_eq!(
        h.engine.get_booking(walk_in.id).await.unwrap().status,
        BookingStatus::Pending
    );

    // Its own stored session still reconciles
    let resp = h
        .get(&format!("/api/payment/response?id={mine}&requestId=1000"))
        .await;
    assert_eq!(
        location(&resp),
        format!("https://cabins.test/booking-result?id={mine}&status=confirmed")
    );
}

#[tokio::test]
async fn return_form_post_accepts_aliases() {
    let h = harness("return_form_post", FakeGateway::new("APPROVED"));
    let cabin = h.cabin(1).await;
    let (id, request_id) = h.checkout(cabin.id, "2025-07-05", "2025-07-06").await;

    let req = Request::post("/api/payment/response")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(format!("reserva_id=BOOKING-{id}&id_session={request_id}")))
        .unwrap();
    let resp = h.send(req).await;
    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(
        location(&resp),
        format!("https://cabins.test/booking-result?id={id}&status=confirmed")
    );
    let booking = h.engine.get_booking(id).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.payment.gateway_status.as_deref(), Some("APPROVED"));
}

#[tokio::test]
async fn confirmed_booking_redirects_without_lookup() {
    let h = harness("return_confirmed", FakeGateway::new("APPROVED"));
    let cabin = h.cabin(1).await;
    let (id, _) = h.checkout(cabin.id, "2025-07-12", "2025-07-13").await;

    let uri = format!("/api/payment/response?id={id}");
    h.get(&uri).await;
    assert_eq!(h.gateway.lookups(), 1);

    let resp = h.get(&uri).await;
    assert_eq!(
        location(&resp),
        format!("https://cabins.test/booking-result?id={id}&status=confirmed")
    );
    assert_eq!(h.gateway.lookups(), 1);
}

#[tokio::test]
async fn booking_without_session_stays_pending() {
    let h = harness("return_no_session", FakeGateway::new("APPROVED"));
    let cabin = h.cabin(1).await;
    let booking = h
        .engine
        .create_booking(NewBooking {
            cabin_id: cabin.id,
            guest: Guest {
                name: "Luis".into(),
                email: "luis@example.com".into(),
                phone: "+56933334444".into(),
                document: None,
                document_type: None,
            },
            stay: Stay::new(
                "2025-07-15".parse().unwrap(),
                "2025-07-16".parse().unwrap(),
            ),
            status: BookingStatus::Pending,
            source: BookingSource::Admin,
            amount: None,
            notes: None,
        })
        .await
        .unwrap();

    let resp = h.get(&format!("/api/payment/response?id={}", booking.id)).await;
    assert_eq!(
        location(&resp),
        format!("https://cabins.test/booking-result?id={}&status=pending", booking.id)
    );
    assert_eq!(h.gateway.lookups(), 0);
    let after = h.engine.get_booking(booking.id).await.unwrap();
    assert_eq!(after.status, BookingStatus::Pending);
    assert_eq!(after.payment.gateway_status.as_deref(), Some("PENDING"));
}

#[tokio::test]
async fn request_info_needs_admin_and_returns_digest() {
    let h = harness("request_info", FakeGateway::new("APPROVED"));
    let cabin = h.cabin(1).await;
    let (id, request_id) = h.checkout(cabin.id, "2025-07-18", "2025-07-19").await;

    let body = json!({"requestId": request_id.parse::<u64>().unwrap()});
    let resp = h
        .send(json_request("POST", "/api/payment/get-request-info", body.clone()))
        .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let csrf = generate_csrf_token();
    let mut req = json_request("POST", "/api/payment/get-request-info", body);
    req.headers_mut()
        .insert(header::COOKIE, h.admin_cookies(&csrf).parse().unwrap());
    let resp = h.send(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["requestId"], request_id);
    assert_eq!(body["data"]["status"]["status"], "APPROVED");
    assert_eq!(body["data"]["request"]["payment"]["reference"], format!("BOOKING-{id}"));
    assert_eq!(body["data"]["hasPayment"], false);

    let mut req = json_request("POST", "/api/payment/get-request-info", json!({}));
    req.headers_mut()
        .insert(header::COOKIE, h.admin_cookies(&csrf).parse().unwrap());
    assert_eq!(h.send(req).await.status(), StatusCode::BAD_REQUEST);
}

// ── Public cabins ────────────────────────────────────────

#[tokio::test]
async fn cabins_and_availability() {
    let h = harness("cabins_public", FakeGateway::new("PENDING"));
    let cabin = h.cabin(2).await;

    let resp = h
        .send(Request::get("/api/cabins?location=laserena").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await.as_array().unwrap().len(), 1);

    let uri = format!("/api/cabins/{}/availability?from=2025-08-01&to=2025-08-03", cabin.id);
    let resp = h.send(Request::get(uri).body(Body::empty()).unwrap()).await;
    let body = body_json(resp).await;
    assert_eq!(body["capacity"], 2);
    assert_eq!(body["days"].as_array().unwrap().len(), 3);

    let uri = format!("/api/cabins/{}/availability?from=2025-08-03&to=2025-08-01", cabin.id);
    let resp = h.send(Request::get(uri).body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = h
        .send(Request::get(format!("/api/cabins/{}", Ulid::new())).body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn responses_carry_security_headers() {
    let h = harness("security_headers", FakeGateway::new("PENDING"));
    let resp = h.send(Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.headers()["x-frame-options"], "DENY");
    assert_eq!(resp.headers()["x-content-type-options"], "nosniff");
    assert!(resp.headers().get(header::STRICT_TRANSPORT_SECURITY).is_none());

    let resp = h.send(Request::get("/nope").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(resp.headers()["x-frame-options"], "DENY");
}

// ── Admin ────────────────────────────────────────────────

#[tokio::test]
async fn signin_sets_both_cookies() {
    let h = harness("signin", FakeGateway::new("PENDING"));
    let form = |body: &'static str| {
        Request::post("/api/auth/signin")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap()
    };

    let resp = h.send(form("email=admin%40example.com&password=wrong-pass")).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = h.send(form("email=admin%40example.com")).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = h.send(form("email=admin%40example.com&password=hunter22")).await;
    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(location(&resp), "/admin");
    let cookies: Vec<_> = resp
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect();
    assert_eq!(cookies.len(), 2);
    assert!(cookies.iter().any(|c| c.starts_with("cb-session=") && c.contains("HttpOnly")));
    assert!(cookies.iter().any(|c| c.starts_with("cb-csrf=") && !c.contains("HttpOnly")));
}

#[tokio::test]
async fn admin_writes_need_session_and_csrf() {
    let h = harness("admin_csrf", FakeGateway::new("PENDING"));
    let csrf = generate_csrf_token();
    let cabin = json!({"name": "Casa Sol", "nightly_price": 60000, "capacity": 3, "location": "Pichilemu"});

    let resp = h.send(json_request("POST", "/api/admin/cabins", cabin.clone())).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let mut req = json_request("POST", "/api/admin/cabins", cabin.clone());
    req.headers_mut()
        .insert(header::COOKIE, h.admin_cookies(&csrf).parse().unwrap());
    assert_eq!(h.send(req).await.status(), StatusCode::FORBIDDEN);

    let mut req = json_request("POST", "/api/admin/cabins", cabin);
    req.headers_mut()
        .insert(header::COOKIE, h.admin_cookies(&csrf).parse().unwrap());
    req.headers_mut().insert(CSRF_HEADER, csrf.parse().unwrap());
    let resp = h.send(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["cabin"]["location"], "pichilemu");

    let req = Request::get("/api/admin/cabins")
        .header(header::COOKIE, h.admin_cookies(&csrf))
        .body(Body::empty())
        .unwrap();
    let body = body_json(h.send(req).await).await;
    assert_eq!(body["cabins"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn admin_booking_lifecycle_and_reversal() {
    let h = harness("admin_bookings", FakeGateway::new("PENDING"));
    let cabin = h.cabin(1).await;
    let csrf = generate_csrf_token();
    let authed = |mut req: Request<Body>| {
        req.headers_mut()
            .insert(header::COOKIE, h.admin_cookies(&csrf).parse().unwrap());
        req.headers_mut().insert(CSRF_HEADER, csrf.parse().unwrap());
        req
    };

    let resp = h
        .send(authed(json_request(
            "POST",
            "/api/admin/bookings",
            json!({
                "name": "Pedro",
                "email": "pedro@example.com",
                "phone": "+56922223333",
                "cabin_id": cabin.id.to_string(),
                "start_date": "2025-09-10",
                "end_date": "2025-09-11",
            }),
        )))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let booking = body_json(resp).await["booking"].clone();
    assert_eq!(booking["status"], "confirmed");
    assert_eq!(booking["source"], "admin");
    assert_eq!(booking["amount"], 90_000);
    let id = booking["id"].as_str().unwrap().to_string();

    let resp = h
        .send(authed(json_request(
            "PUT",
            &format!("/api/admin/bookings/{id}"),
            json!({"end_date": "2025-09-12", "notes": "late arrival"}),
        )))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let updated = body_json(resp).await["booking"].clone();
    assert_eq!(updated["stay"]["end"], "2025-09-12");
    assert_eq!(updated["guest"]["name"], "Pedro");

    let resp = h
        .send(authed(json_request(
            "POST",
            "/api/payment/reverse",
            json!({"internalReference": "ref-77", "booking_id": id}),
        )))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["data"]["status"]["status"], "APPROVED");
    assert_eq!(h.gateway.reversed.lock().unwrap().as_slice(), ["ref-77".to_string()]);
    let ulid = Ulid::from_string(&id).unwrap();
    assert_eq!(h.engine.get_booking(ulid).await.unwrap().status, BookingStatus::Refunded);

    let resp = h
        .send(authed(
            Request::delete(format!("/api/admin/bookings/{id}"))
                .body(Body::empty())
                .unwrap(),
        ))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(h.engine.get_booking(ulid).await.is_none());
}

#[tokio::test]
async fn refused_status_change_discards_the_whole_edit() {
    let h = harness("admin_edit_refused", FakeGateway::new("PENDING"));
    let cabin = h.cabin(1).await;
    let csrf = generate_csrf_token();
    let authed = |mut req: Request<Body>| {
        req.headers_mut()
            .insert(header::COOKIE, h.admin_cookies(&csrf).parse().unwrap());
        req.headers_mut().insert(CSRF_HEADER, csrf.parse().unwrap());
        req
    };

    let resp = h
        .send(authed(json_request(
            "POST",
            "/api/admin/bookings",
            json!({
                "name": "Pedro",
                "email": "pedro@example.com",
                "phone": "+56922223333",
                "cabin_id": cabin.id.to_string(),
                "start_date": "2025-09-10",
                "end_date": "2025-09-11",
            }),
        )))
        .await;
    let id = body_json(resp).await["booking"]["id"].as_str().unwrap().to_string();

    let resp = h
        .send(authed(json_request(
            "PUT",
            &format!("/api/admin/bookings/{id}"),
            json!({"end_date": "2025-09-20", "notes": "moved", "status": "pending"}),
        )))
        .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let booking = h.engine.get_booking(Ulid::from_string(&id).unwrap()).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.stay.end.to_string(), "2025-09-11");
    assert!(booking.notes.is_none());
}

// ── Calendars ────────────────────────────────────────────

const AIRBNB_FEED: &str = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
PRODID:-//Airbnb Inc//Hosting Calendar 0.8.8//EN\r\n\
BEGIN:VEVENT\r\n\
DTSTART;VALUE=DATE:20251001\r\n\
DTEND;VALUE=DATE:20251004\r\n\
UID:abc123@airbnb.com\r\n\
SUMMARY:Reserved\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

#[tokio::test]
async fn import_then_export_feed() {
    let h = harness("calendar_roundtrip", FakeGateway::new("PENDING"));
    let cabin = h.cabin(1).await;
    let csrf = generate_csrf_token();
    let url = "https://www.airbnb.com/calendar/ical/1.ics";
    h.fetcher.feeds.lock().unwrap().insert(url.into(), AIRBNB_FEED.into());

    let mut req = json_request(
        "POST",
        "/api/calendar/import",
        json!({"ical_url": url, "cabin_id": cabin.id.to_string()}),
    );
    req.headers_mut()
        .insert(header::COOKIE, h.admin_cookies(&csrf).parse().unwrap());
    req.headers_mut().insert(CSRF_HEADER, csrf.parse().unwrap());
    let resp = h.send(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["imported"], 1);

    let imported = h.engine.list_bookings(&BookingFilter::default()).await;
    assert_eq!(imported.len(), 1);
    assert_eq!(imported[0].source, BookingSource::Airbnb);
    assert_eq!(imported[0].stay.end.to_string(), "2025-10-03");

    let mut req = json_request("POST", "/api/calendar/links", json!({"cabin_id": cabin.id.to_string()}));
    req.headers_mut()
        .insert(header::COOKIE, h.admin_cookies(&csrf).parse().unwrap());
    req.headers_mut().insert(CSRF_HEADER, csrf.parse().unwrap());
    let body = body_json(h.send(req).await).await;
    let token = body["token"].as_str().unwrap().to_string();
    assert_eq!(
        body["url"],
        format!("https://cabins.test/api/calendar/export/{token}.ics")
    );

    let resp = h
        .send(
            Request::get(format!("/api/calendar/export/{token}.ics"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/calendar"));
    assert_eq!(resp.headers()[header::CACHE_CONTROL], "no-cache");
    assert_eq!(
        resp.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"Casa Mar-bookings.ics\""
    );
    let feed = body_text(resp).await;
    assert!(feed.contains(&format!("UID:{}", imported[0].id)));
    assert!(feed.contains("DTEND;VALUE=DATE:20251004"));

    let resp = h
        .send(Request::get("/api/calendar/export/unknown.ics").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cron_sync_is_guarded() {
    let h = harness("cron_sync", FakeGateway::new("PENDING"));
    let cabin = h.cabin(1).await;
    let url = "https://www.airbnb.com/calendar/ical/2.ics";
    h.fetcher.feeds.lock().unwrap().insert(url.into(), AIRBNB_FEED.into());
    h.engine.save_source(cabin.id, url.into()).await.unwrap();

    let resp = h
        .send(Request::get("/api/cron/sync-calendars").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = h
        .send(
            Request::get("/api/cron/sync-calendars")
                .header(header::AUTHORIZATION, "Bearer cron-secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["results"][0]["success"], true);
    assert_eq!(body["results"][0]["imported"], 1);

    let resp = h
        .send(json_request("POST", "/api/cron/sync-calendars", json!({"adminToken": "nope"})))
        .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = h
        .send(json_request(
            "POST",
            "/api/cron/sync-calendars",
            json!({"adminToken": "manual-secret"}),
        ))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["results"][0]["unchanged"], 1);

    let source = h.engine.get_source(cabin.id).unwrap();
    assert_eq!(source.sync_status, Some(SyncStatus::Success));
}
