use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::auth::Credentials;
use super::types::*;
use super::{is_plain_request_id, GatewayError, PaymentGateway};
use crate::observability::GATEWAY_REQUESTS_TOTAL;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Web Checkout client. Every call carries a freshly derived `auth` block.
pub struct GetnetClient {
    client: Client,
    base_url: String,
    credentials: Credentials,
}

impl GetnetClient {
    pub fn new(base_url: &str, credentials: Credentials) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Http(e.to_string()))?;
        let base_url = base_url.trim_end_matches('/').to_string();
        info!("payment gateway client initialized for: {base_url}");
        Ok(Self {
            client,
            base_url,
            credentials,
        })
    }

    async fn post<T: Serialize>(&self, operation: &'static str, path: &str, body: &T) -> Result<Value, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        let payload = Authed {
            auth: self.credentials.auth(),
            body,
        };
        debug!("gateway {operation}: POST {url}");

        let result = self.send(&url, &payload).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(GATEWAY_REQUESTS_TOTAL, "operation" => operation, "outcome" => outcome).increment(1);
        result
    }

    async fn send<T: Serialize>(&self, url: &str, payload: &T) -> Result<Value, GatewayError> {
        let response = self
            .client
            .post(url)
            .header("Accept", "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|e| GatewayError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!("gateway request failed: {status}");
            return Err(GatewayError::Status(status.as_u16(), text));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }
}

#[derive(Serialize)]
struct Empty {}

#[async_trait]
impl PaymentGateway for GetnetClient {
    async fn create_session(&self, request: &SessionRequest) -> Result<SessionCreated, GatewayError> {
        let raw = self.post("create_session", "/api/session", request).await?;
        let created = parse_session(raw)?;
        info!(
            "gateway session {} created for {}",
            created.request_id, request.payment.reference
        );
        Ok(created)
    }

    async fn request_information(&self, request_id: &str) -> Result<RequestInformation, GatewayError> {
        if !is_plain_request_id(request_id) {
            return Err(GatewayError::InvalidRequestId(request_id.to_string()));
        }
        let path = format!("/api/session/{request_id}");
        let raw = self.post("request_information", &path, &Empty {}).await?;
        parse_information(raw)
    }

    async fn reverse(&self, internal_reference: &str) -> Result<ReverseResult, GatewayError> {
        let body = ReverseBody { internal_reference };
        let raw = self.post("reverse", "/api/reverse", &body).await?;
        parse_reverse(raw)
    }
}

/// Accept a session response only with both `requestId` and `processUrl`,
/// and a status of `OK` when one is reported.
pub(super) fn parse_session(raw: Value) -> Result<SessionCreated, GatewayError> {
    let session: RawSession =
        serde_json::from_value(raw).map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
    if let Some(status) = &session.status
        && status.status != "OK"
    {
        return Err(GatewayError::Rejected(
            status.message.clone().unwrap_or_else(|| status.status.clone()),
        ));
    }
    match (session.request_id, session.process_url) {
        (Some(request_id), Some(process_url)) => Ok(SessionCreated {
            request_id,
            process_url,
        }),
        _ => Err(GatewayError::InvalidResponse(
            "missing requestId or processUrl".into(),
        )),
    }
}

pub(super) fn parse_information(raw: Value) -> Result<RequestInformation, GatewayError> {
    let parsed: RawInformation = serde_json::from_value(raw.clone())
        .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
    Ok(RequestInformation {
        request_id: parsed.request_id,
        status: parsed.status,
        payments: parsed.payment,
        raw,
    })
}

/// A reversal succeeded only when the gateway answers `APPROVED`.
pub(super) fn parse_reverse(raw: Value) -> Result<ReverseResult, GatewayError> {
    let parsed: RawReverse =
        serde_json::from_value(raw).map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
    let status = parsed
        .status
        .ok_or_else(|| GatewayError::InvalidResponse("missing status".into()))?;
    if status.status != "APPROVED" {
        return Err(GatewayError::Rejected(
            status
                .message
                .clone()
                .unwrap_or_else(|| "reversal not approved".into()),
        ));
    }
    Ok(ReverseResult {
        status,
        payment: parsed.payment,
    })
}
