use {
    serde::Serialize,
    tokio::sync::watch,
    tracing::{info, warn},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connected, but no traffic within the liveness window.
    Degraded,
    Reconnecting,
    /// Protocol negotiation failed. Terminal until the client is rebuilt.
    Incompatible,
}

impl ConnectionState {
    /// Requests can be sent.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Reconnecting => "reconnecting",
            Self::Incompatible => "incompatible",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a UI should show about the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Banner {
    /// Nothing to show.
    Hidden,
    /// Still trying the first connection; the user can only wait.
    NeverConnected,
    /// Lost a working connection; offer a manual reconnect.
    Retrying,
    /// Protocol mismatch; the user has to upgrade.
    UpgradeRequired,
    /// The client was shut down.
    Stopped,
}

/// Observable connection status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Number of successful handshakes so far.
    pub epoch: u64,
    pub ever_connected: bool,
    /// Negotiated protocol of the current or last epoch.
    pub protocol: Option<u32>,
    pub last_error: Option<String>,
    pub stopped: bool,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            epoch: 0,
            ever_connected: false,
            protocol: None,
            last_error: None,
            stopped: false,
        }
    }
}

impl ConnectionStatus {
    pub fn banner(&self) -> Banner {
        use ConnectionState::*;
        match self.state {
            Connected => Banner::Hidden,
            Incompatible => Banner::UpgradeRequired,
            Disconnected if self.stopped => Banner::Stopped,
            _ if !self.ever_connected => Banner::NeverConnected,
            Disconnected | Connecting | Degraded | Reconnecting => Banner::Retrying,
        }
    }
}

/// Single writer of [`ConnectionStatus`]; readers subscribe.
#[derive(Debug)]
pub(crate) struct StatusCell {
    tx: watch::Sender<ConnectionStatus>,
}

impl StatusCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionStatus::default());
        Self { tx }
    }

    pub(crate) fn get(&self) -> ConnectionStatus {
        self.tx.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }

    /// Move to `state`, notifying subscribers only on an actual change.
    pub(crate) fn transition(&self, state: ConnectionState) {
        self.update(|status| status.state = state);
    }

    pub(crate) fn connected(&self, epoch: u64, protocol: u32) {
        self.update(|status| {
            status.state = ConnectionState::Connected;
            status.epoch = epoch;
            status.ever_connected = true;
            status.protocol = Some(protocol);
            status.last_error = None;
        });
    }

    pub(crate) fn failed(&self, state: ConnectionState, error: impl Into<String>) {
        let error = error.into();
        self.update(|status| {
            status.state = state;
            status.last_error = Some(error);
        });
    }

    pub(crate) fn stopped(&self) {
        self.update(|status| {
            if status.state != ConnectionState::Incompatible {
                status.state = ConnectionState::Disconnected;
            }
            status.stopped = true;
        });
    }

    fn update(&self, apply: impl FnOnce(&mut ConnectionStatus)) {
        self.tx.send_if_modified(|status| {
            let before = status.clone();
            apply(status);
            if *status == before {
                return false;
            }
            if status.state != before.state {
                if status.state == ConnectionState::Incompatible {
                    warn!(from = %before.state, to = %status.state, error = ?status.last_error, "connection state changed");
                } else {
                    info!(from = %before.state, to = %status.state, epoch = status.epoch, "connection state changed");
                }
            }
            true
        });
    }
}
