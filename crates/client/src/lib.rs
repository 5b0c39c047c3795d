//! Client side of the gateway protocol.
//!
//! [`GatewayClient`] owns one supervised connection: it performs the
//! `connect` handshake, correlates responses to requests by id, fans events
//! out to subscribers, watches liveness, and reconnects with jittered
//! backoff. Requests are never replayed across connections; everything
//! pending when a connection drops fails with [`Error::Disconnected`].

pub mod backoff;
pub mod client;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod optimistic;
pub mod options;
pub mod sequence;
pub mod state;
mod supervisor;
mod telemetry;
pub mod transport;

pub use {
    backoff::Backoff,
    client::{GatewayClient, PendingCall},
    correlator::{Correlator, PendingInfo, Resolution},
    dispatcher::{DispatchReport, EventDispatcher, EventHandler, SubscriptionId, meta},
    error::{Error, Result},
    optimistic::{Optimistic, OptimisticCommand, OptimisticPhase},
    options::{ClientOptions, RequestOptions, RetryPolicy},
    sequence::{SeqCheck, SequenceTracker},
    state::{Banner, ConnectionState, ConnectionStatus},
    transport::{Connection, Connector, MemoryConnector, MemoryPeer, WireMessage, WsConnector},
};
