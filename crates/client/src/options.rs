use std::time::Duration;

use {
    gatelink_config::{GatelinkConfig, ReconnectConfig},
    gatelink_protocol::{
        ClientInfo, ConnectAuth, ConnectParams, DEFAULT_REQUEST_TIMEOUT_MS, DeviceInfo,
        HANDSHAKE_TIMEOUT_MS, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
    },
    secrecy::ExposeSecret,
};

use crate::{Error, Result};

/// Runtime settings of a [`GatewayClient`](crate::GatewayClient).
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Sent verbatim as the `connect` request params of every epoch.
    pub connect: ConnectParams,
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub reconnect: ReconnectConfig,
    /// Silent tick intervals tolerated before the connection is degraded.
    pub missed_ticks: u32,
    /// Replaces the gateway-announced tick interval.
    pub tick_interval: Option<Duration>,
    pub max_consecutive_decode_errors: u32,
    pub outbound_queue: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect: ConnectParams {
                min_protocol: MIN_PROTOCOL_VERSION,
                max_protocol: PROTOCOL_VERSION,
                client: ClientInfo {
                    id: "gatelink".into(),
                    display_name: None,
                    version: env!("CARGO_PKG_VERSION").into(),
                    platform: std::env::consts::OS.into(),
                    mode: "cli".into(),
                    instance_id: None,
                },
                role: None,
                scopes: None,
                device: None,
                auth: None,
                locale: None,
                user_agent: None,
                timezone: None,
            },
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            handshake_timeout: Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
            reconnect: ReconnectConfig::default(),
            missed_ticks: 2,
            tick_interval: None,
            max_consecutive_decode_errors: 8,
            outbound_queue: 256,
        }
    }
}

impl ClientOptions {
    /// Build options from a loaded config, resolving the auth token.
    pub fn from_config(config: &GatelinkConfig) -> Result<Self> {
        config.validate()?;
        let identity = &config.identity;

        let token = config.auth.resolve_token()?;
        let password = config.auth.password.as_ref();
        let auth = (token.is_some() || password.is_some()).then(|| ConnectAuth {
            token: token.as_ref().map(|t| t.expose_secret().clone()),
            password: password.map(|p| p.expose_secret().clone()),
        });

        let connect = ConnectParams {
            min_protocol: config.protocol.min,
            max_protocol: config.protocol.max,
            client: ClientInfo {
                id: identity.client_id.clone(),
                display_name: identity.display_name.clone(),
                version: identity.version.clone(),
                platform: identity.platform.clone(),
                mode: identity.mode.clone(),
                instance_id: Some(uuid::Uuid::new_v4().to_string()),
            },
            role: Some(identity.role.clone()),
            scopes: (!identity.scopes.is_empty()).then(|| identity.scopes.clone()),
            device: config.device.as_ref().map(|d| DeviceInfo {
                id: d.id.clone(),
                public_key: d.public_key.clone(),
                signature: d.signature.clone(),
                signed_at: d.signed_at,
                nonce: d.nonce.clone(),
            }),
            auth,
            locale: identity.locale.clone(),
            user_agent: Some(format!("gatelink/{}", env!("CARGO_PKG_VERSION"))),
            timezone: identity.timezone.clone(),
        };

        Ok(Self {
            connect,
            request_timeout: Duration::from_millis(config.requests.timeout_ms),
            handshake_timeout: Duration::from_millis(config.gateway.handshake_timeout_ms),
            reconnect: config.reconnect,
            missed_ticks: config.heartbeat.missed_ticks,
            tick_interval: config.heartbeat.tick_interval_ms.map(Duration::from_millis),
            max_consecutive_decode_errors: config.gateway.max_consecutive_decode_errors,
            outbound_queue: config.gateway.outbound_queue.max(1),
        })
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    /// Explicit request id instead of a generated one.
    pub id: Option<String>,
    /// Opt-in retry for methods the caller knows to be idempotent.
    pub retry: Option<RetryPolicy>,
}

impl RequestOptions {
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

/// Resend policy for retryable failures (see [`Error::is_retryable`]).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt follows failed attempt number `attempt` (0-based).
    pub fn should_retry(&self, attempt: u32, error: &Error) -> bool {
        attempt + 1 < self.max_attempts && error.is_retryable()
    }

    /// Wait before the attempt after `attempt`. A server `retryAfterMs` hint
    /// wins over the exponential schedule.
    pub fn delay_for(&self, attempt: u32, error: &Error) -> Duration {
        if let Some(hint) = error.retry_after() {
            return hint;
        }
        let scaled = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(attempt.min(16)));
        scaled.min(self.max_delay)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        super::*,
        gatelink_protocol::{ErrorShape, error_codes},
        secrecy::Secret,
    };

    #[test]
    fn from_config_builds_connect_params() {
        let mut config = GatelinkConfig::default();
        config.auth.token = Some(Secret::new("tok".into()));
        config.identity.scopes = vec!["operator.read".into()];
        config.heartbeat.tick_interval_ms = Some(1_000);

        let options = ClientOptions::from_config(&config).unwrap();
        assert_eq!(options.connect.min_protocol, 3);
        assert_eq!(options.connect.max_protocol, 4);
        assert_eq!(
            options.connect.auth.as_ref().unwrap().token.as_deref(),
            Some("tok")
        );
        assert!(options.connect.auth.as_ref().unwrap().password.is_none());
        assert_eq!(
            options.connect.scopes.as_deref(),
            Some(&["operator.read".to_string()][..])
        );
        assert!(options.connect.client.instance_id.is_some());
        assert_eq!(options.tick_interval, Some(Duration::from_secs(1)));
    }

    #[test]
    fn from_config_without_credentials_sends_no_auth() {
        let options = ClientOptions::from_config(&GatelinkConfig::default()).unwrap();
        assert!(options.connect.auth.is_none());
        assert!(options.connect.scopes.is_none());
    }

    #[test]
    fn from_config_rejects_invalid_config() {
        let mut config = GatelinkConfig::default();
        config.protocol.min = 9;
        assert!(matches!(
            ClientOptions::from_config(&config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn request_options_builder() {
        let opts = RequestOptions::default()
            .timeout(Duration::from_millis(50))
            .id("r1")
            .retry(RetryPolicy::default());
        assert_eq!(opts.timeout, Some(Duration::from_millis(50)));
        assert_eq!(opts.id.as_deref(), Some("r1"));
        assert!(opts.retry.is_some());
    }

    #[test]
    fn retry_delay_prefers_server_hint() {
        let policy = RetryPolicy::default();
        let hinted = Error::Server {
            method: "agents.add".into(),
            error: ErrorShape::new(error_codes::RATE_LIMIT_EXCEEDED, "later")
                .with_retryable(true)
                .with_retry_after_ms(750),
        };
        assert_eq!(policy.delay_for(0, &hinted), Duration::from_millis(750));
        assert_eq!(
            policy.delay_for(2, &Error::Disconnected),
            Duration::from_millis(800)
        );
        assert_eq!(policy.delay_for(30, &Error::Disconnected), policy.max_delay);
    }

    #[test]
    fn retry_stops_at_max_attempts_and_on_fatal_errors() {
        let policy = RetryPolicy {
            max_attempts: 2,
            ..Default::default()
        };
        assert!(policy.should_retry(0, &Error::Disconnected));
        assert!(!policy.should_retry(1, &Error::Disconnected));
        assert!(!policy.should_retry(0, &Error::DuplicateId("x".into())));
    }
}
