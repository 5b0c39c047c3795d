use std::path::PathBuf;

use {
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
};

use crate::{Error, Result};

/// Default address of a locally running gateway.
pub const DEFAULT_GATEWAY_URL: &str = "ws://127.0.0.1:18789";

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatelinkConfig {
    pub gateway: GatewayConfig,
    pub identity: IdentityConfig,
    pub auth: AuthConfig,
    /// Pre-signed device identity for pairing-based auth. Passed through verbatim.
    pub device: Option<DeviceConfig>,
    pub protocol: ProtocolConfig,
    pub requests: RequestConfig,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    pub orchestrator: OrchestratorConfig,
}

impl GatelinkConfig {
    /// Reject values the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.url.trim().is_empty() {
            return Err(Error::invalid("gateway.url must not be empty"));
        }
        if !(self.gateway.url.starts_with("ws://") || self.gateway.url.starts_with("wss://")) {
            return Err(Error::invalid(format!(
                "gateway.url must use ws:// or wss://, got {}",
                self.gateway.url
            )));
        }
        if self.protocol.min > self.protocol.max {
            return Err(Error::invalid(format!(
                "protocol.min ({}) must not exceed protocol.max ({})",
                self.protocol.min, self.protocol.max
            )));
        }
        if self.requests.timeout_ms == 0 {
            return Err(Error::invalid("requests.timeout_ms must be positive"));
        }
        self.reconnect.validate()?;
        if self.heartbeat.missed_ticks == 0 {
            return Err(Error::invalid("heartbeat.missed_ticks must be at least 1"));
        }
        self.orchestrator.validate()
    }
}

/// Gateway endpoint and connection-level limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// WebSocket URL of the gateway.
    pub url: String,
    /// Deadline for the `connect` handshake.
    pub handshake_timeout_ms: u64,
    /// Consecutive undecodable frames tolerated before the connection is
    /// treated as desynchronised and torn down.
    pub max_consecutive_decode_errors: u32,
    /// Capacity of the per-connection outbound frame queue.
    pub outbound_queue: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.into(),
            handshake_timeout_ms: 10_000,
            max_consecutive_decode_errors: 8,
            outbound_queue: 256,
        }
    }
}

/// How this client introduces itself in the handshake.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub client_id: String,
    pub display_name: Option<String>,
    /// Client mode reported to the gateway (e.g. `cli`, `ui`, `backend`).
    pub mode: String,
    pub platform: String,
    pub version: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub locale: Option<String>,
    pub timezone: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            client_id: "gatelink".into(),
            display_name: None,
            mode: "cli".into(),
            platform: std::env::consts::OS.into(),
            version: env!("CARGO_PKG_VERSION").into(),
            role: "operator".into(),
            scopes: Vec::new(),
            locale: None,
            timezone: None,
        }
    }
}

/// Shared-secret credentials.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token: Option<Secret<String>>,
    pub password: Option<Secret<String>>,
    /// File holding the token, read when `token` is unset.
    pub token_file: Option<PathBuf>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("token_file", &self.token_file)
            .finish()
    }
}

impl AuthConfig {
    /// The explicit token, or the trimmed contents of `token_file`.
    ///
    /// A missing token file is not an error; an unreadable one is.
    pub fn resolve_token(&self) -> Result<Option<Secret<String>>> {
        if let Some(token) = &self.token
            && !token.expose_secret().trim().is_empty()
        {
            return Ok(Some(token.clone()));
        }
        let Some(path) = &self.token_file else {
            return Ok(None);
        };
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let token = contents.trim();
                if token.is_empty() {
                    tracing::warn!(path = %path.display(), "token file is empty");
                    Ok(None)
                } else {
                    Ok(Some(Secret::new(token.to_string())))
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(Error::Io {
                path: path.clone(),
                source,
            }),
        }
    }
}

/// Device identity for pairing-based auth.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub public_key: String,
    pub signature: String,
    pub signed_at: u64,
    #[serde(default)]
    pub nonce: Option<String>,
}

/// Supported protocol revision range.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub min: u32,
    pub max: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self { min: 3, max: 4 }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Default per-request deadline.
    pub timeout_ms: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_ms: u64,
    pub factor: f64,
    pub cap_ms: u64,
    /// Relative jitter band, e.g. `0.2` for ±20 %.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_ms: 250,
            factor: 2.0,
            cap_ms: 30_000,
            jitter: 0.2,
        }
    }
}

impl ReconnectConfig {
    fn validate(&self) -> Result<()> {
        if self.base_ms == 0 {
            return Err(Error::invalid("reconnect.base_ms must be positive"));
        }
        if self.cap_ms < self.base_ms {
            return Err(Error::invalid("reconnect.cap_ms must be >= reconnect.base_ms"));
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(Error::invalid("reconnect.factor must be >= 1.0"));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(Error::invalid("reconnect.jitter must be in [0, 1)"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Ticks that may be missed before the connection is marked degraded.
    pub missed_ticks: u32,
    /// Overrides the tick interval announced by the gateway.
    pub tick_interval_ms: Option<u64>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            missed_ticks: 2,
            tick_interval_ms: None,
        }
    }
}

/// Orchestrator metrics aggregation.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub state_window: usize,
    pub cost_window: usize,
    pub checkpoint_window: usize,
    /// Minimum spacing between rendered snapshot deliveries.
    pub frame_interval_ms: u64,
    /// Spend ceiling used to derive budget health. `None` disables it.
    pub budget_usd: Option<f64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            state_window: 50,
            cost_window: 5,
            checkpoint_window: 20,
            frame_interval_ms: 16,
            budget_usd: None,
        }
    }
}

impl OrchestratorConfig {
    fn validate(&self) -> Result<()> {
        if self.state_window == 0 || self.cost_window == 0 || self.checkpoint_window == 0 {
            return Err(Error::invalid("orchestrator windows must hold at least one item"));
        }
        if let Some(budget) = self.budget_usd
            && !(budget.is_finite() && budget > 0.0)
        {
            return Err(Error::invalid("orchestrator.budget_usd must be positive"));
        }
        Ok(())
    }
}
