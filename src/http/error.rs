use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::engine::EngineError;
use crate::gateway::GatewayError;

/// Error returned by every JSON handler, rendered as
/// `{"success": false, "error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(&'static str),
    Forbidden(&'static str),
    NotFound(String),
    Conflict(String),
    /// An upstream service (payment gateway, calendar host) failed.
    Upstream(String),
    Internal(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::BadRequest(m) | ApiError::NotFound(m) | ApiError::Conflict(m) => f.write_str(m),
            ApiError::Unauthorized(m) | ApiError::Forbidden(m) => f.write_str(m),
            ApiError::Upstream(m) => write!(f, "upstream error: {m}"),
            ApiError::Internal(m) => write!(f, "internal error: {m}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError::BadRequest(msg.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Internal(detail) => {
                error!("internal error: {detail}");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotFound(_) | EngineError::CabinNotFound(_) | EngineError::SourceNotFound(_) => {
                ApiError::NotFound(e.to_string())
            }
            EngineError::CapacityExceeded { .. } | EngineError::Duplicate(_) => ApiError::Conflict(e.to_string()),
            EngineError::InvalidStay(_) | EngineError::Invalid(_) | EngineError::LimitExceeded(_) => {
                ApiError::BadRequest(e.to_string())
            }
            EngineError::WalError(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Rejected(msg) => ApiError::Upstream(format!("payment gateway rejected the request: {msg}")),
            GatewayError::InvalidRequestId(id) => ApiError::BadRequest(format!("invalid payment session id: {id:?}")),
            other => {
                error!("payment gateway failure: {other}");
                ApiError::Upstream("payment gateway unavailable".into())
            }
        }
    }
}
