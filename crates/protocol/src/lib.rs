//! Gateway WebSocket/RPC protocol definitions.
//!
//! Protocol version 4 (backward-compatible with v3). All communication uses JSON frames over WebSocket.
//!
//! Frame types:
//! - `RequestFrame`  — client → gateway RPC call
//! - `ResponseFrame` — gateway → client RPC result, correlated by `id`
//! - `EventFrame`    — gateway → client server-push
//!
//! Frames travel as the [`GatewayFrame`] tagged union; see [`codec`] for
//! validating decode and encode.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub mod codec;

pub use codec::{DecodeError, DecodeErrorKind, FieldViolation, RAW_EXCERPT_BYTES, decode, encode};

// ── Constants ────────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u32 = 4;
/// Oldest protocol revision this client still speaks.
pub const MIN_PROTOCOL_VERSION: u32 = 3;
pub const MAX_PAYLOAD_BYTES: usize = 524_288; // 512 KB
pub const MAX_BUFFERED_BYTES: usize = 1_572_864; // 1.5 MB
pub const TICK_INTERVAL_MS: u64 = 30_000; // 30s
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000; // 10s
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000; // 30s

/// Method name of the initial handshake request.
pub const CONNECT_METHOD: &str = "connect";

// ── Subscriptions ────────────────────────────────────────────────────────────

pub mod subscriptions {
    /// Wildcard subscription: receive all events.
    pub const WILDCARD: &str = "*";
}

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    // v3 backward-compat codes
    pub const NOT_LINKED: &str = "NOT_LINKED";
    pub const NOT_PAIRED: &str = "NOT_PAIRED";
    pub const AGENT_TIMEOUT: &str = "AGENT_TIMEOUT";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

    // v4 standardized codes
    pub const UNKNOWN_METHOD: &str = "UNKNOWN_METHOD";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const CONFLICT: &str = "CONFLICT";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INTERNAL: &str = "INTERNAL";
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    pub const PAYLOAD_TOO_LARGE: &str = "PAYLOAD_TOO_LARGE";

    // Client-side codes, never sent by the gateway.
    pub const DECODE_ERROR: &str = "DECODE_ERROR";
    pub const DISCONNECTED: &str = "DISCONNECTED";
    pub const INCOMPATIBLE_PROTOCOL: &str = "INCOMPATIBLE_PROTOCOL";
    pub const CANCELLED: &str = "CANCELLED";
    pub const DUPLICATE_ID: &str = "DUPLICATE_ID";
}

// ── Error shape ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(rename = "retryAfterMs", skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }

    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    #[must_use]
    pub fn with_retry_after_ms(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Absent `retryable` means "not safe to resend".
    pub fn is_retryable(&self) -> bool {
        self.retryable.unwrap_or(false)
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Discriminated union of all frame types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    #[serde(rename = "req")]
    Request(RequestFrame),
    #[serde(rename = "res")]
    Response(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

impl GatewayFrame {
    /// Wire discriminator of this frame.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "req",
            Self::Response(_) => "res",
            Self::Event(_) => "event",
        }
    }
}

impl From<RequestFrame> for GatewayFrame {
    fn from(frame: RequestFrame) -> Self {
        Self::Request(frame)
    }
}

impl From<ResponseFrame> for GatewayFrame {
    fn from(frame: ResponseFrame) -> Self {
        Self::Response(frame)
    }
}

impl From<EventFrame> for GatewayFrame {
    fn from(frame: EventFrame) -> Self {
        Self::Event(frame)
    }
}

/// Client → gateway RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl RequestFrame {
    pub fn new(
        id: impl Into<String>,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
            channel: None,
        }
    }
}

/// Gateway → client RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
            channel: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
            channel: None,
        }
    }
}

/// Gateway → client server-push event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(rename = "stateVersion", skip_serializing_if = "Option::is_none")]
    pub state_version: Option<StateVersion>,
    /// Stream group ID for chunked delivery (v4).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    /// End-of-stream marker (v4).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    /// Logical channel for multiplexing (v4).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            payload: Some(payload),
            seq: None,
            state_version: None,
            stream: None,
            done: None,
            channel: None,
        }
    }

    #[must_use]
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    #[must_use]
    pub fn with_state_version(mut self, presence: u64, health: u64) -> Self {
        self.state_version = Some(StateVersion { presence, health });
        self
    }

    /// Whether the event name is one this protocol revision documents.
    pub fn is_known(&self) -> bool {
        KNOWN_EVENTS.contains(&self.event.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVersion {
    pub presence: u64,
    pub health: u64,
}

impl StateVersion {
    /// True when neither counter moved backwards relative to `previous`.
    pub fn is_at_least(&self, previous: &StateVersion) -> bool {
        self.presence >= previous.presence && self.health >= previous.health
    }
}

// ── Extensions ───────────────────────────────────────────────────────────────

/// Namespaced extension data for protocol-agnostic transport.
pub type Extensions = HashMap<String, serde_json::Value>;

// ── Connect handshake ────────────────────────────────────────────────────────

/// Parameters sent by the client in the initial `connect` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "minProtocol")]
    pub min_protocol: u32,
    #[serde(rename = "maxProtocol")]
    pub max_protocol: u32,
    pub client: ClientInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(rename = "userAgent", skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl ConnectParams {
    /// Whether `version` falls inside the advertised range.
    pub fn supports(&self, version: u32) -> bool {
        (self.min_protocol..=self.max_protocol).contains(&version)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub version: String,
    pub platform: String,
    pub mode: String,
    #[serde(rename = "instanceId", skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub signature: String,
    #[serde(rename = "signedAt")]
    pub signed_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl std::fmt::Debug for ConnectAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectAuth")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Sent by the gateway as the payload of the `connect` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloOk {
    #[serde(default = "hello_ok_type")]
    pub r#type: String, // always "hello-ok"
    pub protocol: u32,
    pub server: ServerInfo,
    #[serde(default)]
    pub features: Features,
    #[serde(default)]
    pub snapshot: serde_json::Value, // opaque for now
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<HelloAuth>,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extensions: Extensions,
}

fn hello_ok_type() -> String {
    "hello-ok".into()
}

impl HelloOk {
    pub fn new(protocol: u32, server: ServerInfo) -> Self {
        Self {
            r#type: hello_ok_type(),
            protocol,
            server,
            features: Features::default(),
            snapshot: serde_json::Value::Null,
            auth: None,
            policy: Policy::default(),
            extensions: Extensions::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(rename = "connId")]
    pub conn_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Features {
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloAuth {
    #[serde(rename = "deviceToken")]
    pub device_token: String,
    pub role: String,
    pub scopes: Vec<String>,
    #[serde(rename = "issuedAtMs", skip_serializing_if = "Option::is_none")]
    pub issued_at_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(rename = "maxPayload")]
    pub max_payload: usize,
    #[serde(rename = "maxBufferedBytes")]
    pub max_buffered_bytes: usize,
    #[serde(rename = "tickIntervalMs")]
    pub tick_interval_ms: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_BYTES,
            max_buffered_bytes: MAX_BUFFERED_BYTES,
            tick_interval_ms: TICK_INTERVAL_MS,
        }
    }
}

// ── Known events ─────────────────────────────────────────────────────────────

pub const KNOWN_EVENTS: &[&str] = &[
    "tick",
    "shutdown",
    "agent",
    "chat",
    "presence",
    "health",
    "exec.approval.requested",
    "exec.approval.resolved",
    "device.pair.requested",
    "device.pair.resolved",
    "node.pair.requested",
    "node.pair.resolved",
    "cost.updated",
    "state.changed",
    "checkpoint.saved",
];
