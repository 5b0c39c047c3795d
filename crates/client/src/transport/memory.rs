//! In-process gateway transport.
//!
//! [`MemoryConnector`] hands every accepted connection to a [`MemoryPeer`]
//! that plays the gateway side. Used by tests and by embedders that run a
//! gateway in the same process.

use std::sync::atomic::{AtomicU32, Ordering};

use {
    async_trait::async_trait,
    futures::{SinkExt, StreamExt},
    tokio::sync::{Mutex, mpsc},
    tokio_stream::wrappers::ReceiverStream,
    tokio_util::sync::PollSender,
};

use gatelink_protocol::{
    CONNECT_METHOD, ConnectParams, GatewayFrame, HelloOk, RequestFrame, ResponseFrame, ServerInfo,
};

use {
    super::{Connection, Connector, WireMessage},
    crate::{Error, Result},
};

const CHANNEL_CAPACITY: usize = 256;

pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    accept_rx: Mutex<mpsc::UnboundedReceiver<MemoryPeer>>,
    refuse: AtomicU32,
    attempts: AtomicU32,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        Self {
            accept_tx,
            accept_rx: Mutex::new(accept_rx),
            refuse: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
        }
    }

    /// Wait for the client's next connection.
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.accept_rx.lock().await.recv().await
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next(&self, count: u32) {
        self.refuse.store(count, Ordering::SeqCst);
    }

    /// Connection attempts so far, refused ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Connection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::transport("connection refused"));
        }

        let (client_tx, client_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (gateway_tx, gateway_rx) = mpsc::channel::<WireMessage>(CHANNEL_CAPACITY);
        self.accept_tx
            .send(MemoryPeer {
                inbound: client_rx,
                outbound: gateway_tx,
            })
            .map_err(|_| Error::transport("memory gateway is gone"))?;

        let sink = PollSender::new(client_tx)
            .sink_map_err(|_| Error::transport("memory gateway closed the connection"));
        let stream = ReceiverStream::new(gateway_rx).map(Ok);
        Ok(Connection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }

    fn endpoint(&self) -> String {
        "memory://gateway".into()
    }
}

/// Gateway side of one in-memory connection. Dropping it closes the
/// connection.
pub struct MemoryPeer {
    inbound: mpsc::Receiver<String>,
    outbound: mpsc::Sender<WireMessage>,
}

impl MemoryPeer {
    /// Next raw text frame sent by the client.
    pub async fn recv_raw(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    /// Next frame sent by the client, skipping anything undecodable.
    pub async fn recv_frame(&mut self) -> Option<GatewayFrame> {
        loop {
            let raw = self.recv_raw().await?;
            if let Ok(frame) = gatelink_protocol::decode(&raw) {
                return Some(frame);
            }
        }
    }

    /// Next request sent by the client.
    pub async fn recv_request(&mut self) -> Option<RequestFrame> {
        loop {
            if let GatewayFrame::Request(req) = self.recv_frame().await? {
                return Some(req);
            }
        }
    }

    /// Send raw text, bypassing the encoder. Returns false once the client
    /// side is gone.
    pub async fn send_raw(&self, raw: impl Into<String>) -> bool {
        self.outbound
            .send(WireMessage::Text(raw.into()))
            .await
            .is_ok()
    }

    pub async fn send_frame(&self, frame: impl Into<GatewayFrame>) -> bool {
        match gatelink_protocol::encode(&frame.into()) {
            Ok(raw) => self.send_raw(raw).await,
            Err(_) => false,
        }
    }

    /// Transport-level traffic without a frame, like a websocket ping.
    pub async fn send_keepalive(&self) -> bool {
        self.outbound.send(WireMessage::Keepalive).await.is_ok()
    }

    /// Answer the `connect` handshake with a default hello at `protocol`.
    pub async fn complete_handshake(&mut self, protocol: u32) -> Option<ConnectParams> {
        let hello = HelloOk::new(protocol, ServerInfo {
            version: "memory".into(),
            commit: None,
            host: None,
            conn_id: "memory-conn".into(),
        });
        self.complete_handshake_with(hello).await
    }

    /// Answer the `connect` handshake with `hello`, returning the client's
    /// connect parameters.
    pub async fn complete_handshake_with(&mut self, hello: HelloOk) -> Option<ConnectParams> {
        let req = self.recv_request().await?;
        if req.method != CONNECT_METHOD {
            return None;
        }
        let params = serde_json::from_value(req.params.clone()?).ok()?;
        let payload = serde_json::to_value(&hello).ok()?;
        self.send_frame(ResponseFrame::ok(req.id, payload))
            .await
            .then_some(params)
    }
}
