use std::time::Duration;

use gatelink_protocol::{DecodeError, ErrorShape, error_codes};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{method} timed out after {}ms", timeout.as_millis())]
    Timeout { method: String, timeout: Duration },

    #[error("not connected to the gateway")]
    Disconnected,

    #[error(
        "incompatible gateway protocol ({detail}); this client supports {min}..={max}, upgrade the client or the gateway"
    )]
    IncompatibleProtocol { min: u32, max: u32, detail: String },

    #[error("{method} was cancelled")]
    Cancelled { method: String },

    #[error("request id {0} is already pending")]
    DuplicateId(String),

    #[error("{method} frame of {size} bytes exceeds the gateway limit of {max} bytes")]
    PayloadTooLarge {
        method: String,
        size: usize,
        max: usize,
    },

    #[error("{method} failed: {} ({})", error.message, error.code)]
    Server { method: String, error: ErrorShape },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Tungstenite(Box<tokio_tungstenite::tungstenite::Error>),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Config(#[from] gatelink_config::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Tungstenite(Box::new(err))
    }
}

impl Error {
    #[must_use]
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Taxonomy code, matching the gateway's error code vocabulary.
    pub fn code(&self) -> &str {
        match self {
            Self::Timeout { .. } => error_codes::TIMEOUT,
            Self::Disconnected => error_codes::DISCONNECTED,
            Self::IncompatibleProtocol { .. } => error_codes::INCOMPATIBLE_PROTOCOL,
            Self::Cancelled { .. } => error_codes::CANCELLED,
            Self::DuplicateId(_) => error_codes::DUPLICATE_ID,
            Self::PayloadTooLarge { .. } => error_codes::PAYLOAD_TOO_LARGE,
            Self::Server { error, .. } => &error.code,
            Self::Handshake(_) => error_codes::PROTOCOL_ERROR,
            Self::Decode(_) | Self::Json(_) => error_codes::DECODE_ERROR,
            Self::Transport(_) | Self::Tungstenite(_) | Self::Http(_) => error_codes::UNAVAILABLE,
            Self::Url(_) | Self::Config(_) => error_codes::INVALID_REQUEST,
        }
    }

    /// Whether resending the identical request may succeed.
    ///
    /// Server errors follow their own `retryable` hint. Timeouts and
    /// disconnects are retryable only for callers that know the method is
    /// idempotent; the client never retries on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Disconnected => true,
            Self::Server { error, .. } => error.is_retryable(),
            _ => false,
        }
    }

    /// Server-suggested wait before retrying.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Server { error, .. } => error.retry_after_ms.map(Duration::from_millis),
            _ => None,
        }
    }

    /// The error as it would appear on the wire.
    pub fn to_error_shape(&self) -> ErrorShape {
        match self {
            Self::Server { error, .. } => error.clone(),
            other => ErrorShape::new(other.code(), other.to_string())
                .with_retryable(other.is_retryable()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
