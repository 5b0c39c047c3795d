//! Byte-level transport beneath the frame layer.
//!
//! A [`Connector`] opens one [`Connection`] per epoch. The supervisor owns
//! the connection for its whole lifetime; nothing else touches the socket.

pub mod memory;
pub mod ws;

use std::pin::Pin;

use {
    async_trait::async_trait,
    futures::{Sink, Stream},
};

use crate::Result;

pub use {
    memory::{MemoryConnector, MemoryPeer},
    ws::WsConnector,
};

/// One inbound unit from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// A text frame carrying one encoded gateway frame.
    Text(String),
    /// Transport-level traffic with no frame (ping, pong, binary noise).
    /// Still counts as proof of liveness.
    Keepalive,
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = crate::Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<WireMessage>> + Send>>;

/// An open, full-duplex connection to the gateway.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens connections to a gateway endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection>;

    /// Human-readable endpoint, for logs.
    fn endpoint(&self) -> String;
}
