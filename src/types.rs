use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named capture target. `request_count` and `last_request_at` are only
/// ever advanced by ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_request_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub request_count: u64,
}

/// How `CapturedEvent::body` is represented on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    Utf8,
    Base64,
}

/// One inbound request received at an endpoint. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedEvent {
    pub id: String,
    /// Process-wide insertion order; breaks `received_at` ties.
    pub sequence: u64,
    pub endpoint_id: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub body_encoding: BodyEncoding,
    pub query_params: BTreeMap<String, String>,
    pub source_ip: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl CapturedEvent {
    /// Encode a raw body without altering a single byte: valid UTF-8 is kept
    /// as text, anything else becomes base64.
    pub fn encode_body(raw: &[u8]) -> (String, BodyEncoding) {
        match std::str::from_utf8(raw) {
            Ok(text) => (text.to_string(), BodyEncoding::Utf8),
            Err(_) => (
                base64::engine::general_purpose::STANDARD.encode(raw),
                BodyEncoding::Base64,
            ),
        }
    }

    /// The body exactly as it was received. Fails only if a base64 body was
    /// tampered with after capture.
    pub fn body_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        match self.body_encoding {
            BodyEncoding::Utf8 => Ok(self.body.clone().into_bytes()),
            BodyEncoding::Base64 => base64::engine::general_purpose::STANDARD.decode(&self.body),
        }
    }

    /// Newest first; later insertion wins a timestamp tie.
    pub fn newest_first(a: &CapturedEvent, b: &CapturedEvent) -> std::cmp::Ordering {
        b.received_at
            .cmp(&a.received_at)
            .then(b.sequence.cmp(&a.sequence))
    }
}

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateEndpointRequest {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateEndpointResponse {
    pub id: String,
    pub url: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Endpoint as listed by the API, with its capture URL.
#[derive(Debug, Serialize, Deserialize)]
pub struct EndpointView {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureReceipt {
    pub received: bool,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub endpoint_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub endpoints: u64,
    pub webhooks: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
