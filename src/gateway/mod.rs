//! Getnet Web Checkout integration: request signing, the HTTP client, and
//! the mapping from gateway statuses to booking statuses.

mod auth;
mod getnet;
mod types;

pub use auth::{tran_key, Credentials};
pub use getnet::GetnetClient;
pub use types::*;

pub(crate) use auth::constant_time_eq;

use async_trait::async_trait;

use crate::model::BookingStatus;

#[derive(Debug)]
pub enum GatewayError {
    /// Transport failure (connect, timeout, TLS).
    Http(String),
    /// Non-2xx answer.
    Status(u16, String),
    /// The gateway answered but refused the operation.
    Rejected(String),
    InvalidResponse(String),
    /// Session id that is not a plain gateway token.
    InvalidRequestId(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Http(e) => write!(f, "gateway unreachable: {e}"),
            GatewayError::Status(code, body) => write!(f, "gateway HTTP {code}: {body}"),
            GatewayError::Rejected(msg) => write!(f, "gateway rejected request: {msg}"),
            GatewayError::InvalidResponse(msg) => write!(f, "invalid gateway response: {msg}"),
            GatewayError::InvalidRequestId(id) => write!(f, "invalid payment session id: {id:?}"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// The operations the booking flow needs from a payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_session(&self, request: &SessionRequest) -> Result<SessionCreated, GatewayError>;

    async fn request_information(&self, request_id: &str) -> Result<RequestInformation, GatewayError>;

    async fn reverse(&self, internal_reference: &str) -> Result<ReverseResult, GatewayError>;
}

const MAX_REQUEST_ID_LEN: usize = 64;

/// Gateway session ids are short ASCII alphanumerics. Anything else is
/// refused before it reaches a request path.
pub fn is_plain_request_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= MAX_REQUEST_ID_LEN && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Booking status for a status reported by a server-to-server notification.
pub fn notification_status(gateway_status: &str) -> BookingStatus {
    match gateway_status {
        "APPROVED" => BookingStatus::Confirmed,
        "DECLINED" | "REJECTED" | "FAILED" => BookingStatus::Failed,
        "REFUNDED" => BookingStatus::Refunded,
        // PENDING, IN_PROGRESS, OK and anything unknown
        _ => BookingStatus::Pending,
    }
}

/// Booking status for the result of a lookup after the browser returns.
pub fn redirect_status(gateway_status: Option<&str>) -> BookingStatus {
    match gateway_status {
        Some("APPROVED") => BookingStatus::Confirmed,
        Some("REJECTED") => BookingStatus::Failed,
        _ => BookingStatus::Pending,
    }
}
