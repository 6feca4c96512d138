use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

// ── Outgoing ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Auth {
    pub login: String,
    pub tran_key: String,
    pub nonce: String,
    pub seed: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Buyer {
    pub name: String,
    pub surname: String,
    pub email: String,
    pub document: String,
    pub document_type: String,
    pub mobile: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Amount {
    pub currency: String,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PaymentRequest {
    pub reference: String,
    pub description: String,
    pub amount: Amount,
}

/// Body of a checkout session request, minus the `auth` block.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub locale: String,
    pub buyer: Buyer,
    pub payment: PaymentRequest,
    pub expiration: String,
    pub return_url: String,
    pub cancel_url: String,
    pub ip_address: String,
    pub user_agent: String,
    pub skip_result: bool,
    pub no_buyer_fill: bool,
}

/// Any request body with the gateway `auth` block attached.
#[derive(Serialize)]
pub(super) struct Authed<'a, T: Serialize> {
    pub auth: Auth,
    #[serde(flatten)]
    pub body: &'a T,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ReverseBody<'a> {
    pub internal_reference: &'a str,
}

// ── Incoming ─────────────────────────────────────────────

/// Accepts `"123"` or `123` and yields a string.
pub fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayStatus {
    pub status: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RawSession {
    #[serde(default)]
    pub status: Option<GatewayStatus>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub process_url: Option<String>,
}

/// A checkout session the gateway accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCreated {
    pub request_id: String,
    pub process_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorField {
    pub keyword: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    #[serde(default)]
    pub status: Option<GatewayStatus>,
    #[serde(default)]
    pub amount: Option<Value>,
    #[serde(default)]
    pub receipt: Option<Value>,
    #[serde(default)]
    pub authorization: Option<Value>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub payment_method_name: Option<String>,
    #[serde(default)]
    pub franchise: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub refunded: Option<bool>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub internal_reference: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub processor_fields: Vec<ProcessorField>,
}

fn null_as_empty<'de, D: Deserializer<'de>, T: Deserialize<'de>>(d: D) -> Result<Vec<T>, D::Error> {
    Ok(Option::<Vec<T>>::deserialize(d)?.unwrap_or_default())
}

/// Result of looking a session up.
#[derive(Debug, Clone)]
pub struct RequestInformation {
    pub request_id: Option<String>,
    pub status: Option<GatewayStatus>,
    pub payments: Vec<PaymentRecord>,
    /// The full response, kept for the booking's payment details.
    pub raw: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RawInformation {
    #[serde(default, deserialize_with = "string_or_number")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub status: Option<GatewayStatus>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub payment: Vec<PaymentRecord>,
}

impl RequestInformation {
    pub fn status_str(&self) -> Option<&str> {
        self.status.as_ref().map(|s| s.status.as_str())
    }

    /// Internal reference of the first payment, needed for reversals.
    pub fn internal_reference(&self) -> Option<&str> {
        self.payments.first()?.internal_reference.as_deref()
    }

    /// Merchant reference the session was created with.
    pub fn payment_reference(&self) -> Option<&str> {
        self.raw.pointer("/request/payment/reference")?.as_str()
    }

    /// Summary returned to administrators: status, raw payments, and the
    /// first payment's details with processor fields flattened to a map.
    pub fn digest(&self) -> Value {
        let mut out = json!({
            "requestId": self.request_id,
            "status": self.status,
            "request": self.raw.get("request").cloned().unwrap_or(Value::Null),
            "payments": self.raw.get("payment").cloned().filter(Value::is_array).unwrap_or_else(|| json!([])),
            "hasPayment": !self.payments.is_empty(),
        });
        if let Some(p) = self.payments.first() {
            let fields: Map<String, Value> = p
                .processor_fields
                .iter()
                .map(|f| (f.keyword.clone(), f.value.clone()))
                .collect();
            out["paymentDetails"] = json!({
                "status": p.status,
                "amount": p.amount,
                "receipt": p.receipt,
                "authorization": p.authorization,
                "paymentMethod": p.payment_method,
                "paymentMethodName": p.payment_method_name,
                "franchise": p.franchise,
                "reference": p.reference,
                "refunded": p.refunded,
                "internalReference": p.internal_reference,
                "processorFields": fields,
            });
        }
        out
    }
}

/// Outcome of an approved reversal.
#[derive(Debug, Clone)]
pub struct ReverseResult {
    pub status: GatewayStatus,
    pub payment: Option<Value>,
}

#[derive(Deserialize)]
pub(super) struct RawReverse {
    #[serde(default)]
    pub status: Option<GatewayStatus>,
    #[serde(default)]
    pub payment: Option<Value>,
}
