//! Connection lifecycle: connect, handshake, pump frames, reconnect.
//!
//! One supervisor task per client owns the transport. Each successful
//! handshake starts a new epoch; everything tied to the previous connection
//! (outbound queue, pending requests, sequence cursor) is torn down before
//! the next attempt.

use std::{sync::Arc, time::Duration};

use {
    futures::{SinkExt, StreamExt},
    gatelink_protocol::{
        CONNECT_METHOD, DecodeError, ErrorShape, EventFrame, GatewayFrame, HelloOk, RequestFrame,
        ResponseFrame, error_codes,
    },
    serde_json::json,
    tokio::{
        sync::mpsc,
        time::{Instant, sleep, sleep_until, timeout},
    },
    tracing::{debug, error, info, warn},
};

use crate::{
    Error, Result,
    backoff::Backoff,
    client::Shared,
    dispatcher::meta,
    sequence::{SeqCheck, SequenceTracker},
    state::ConnectionState,
    telemetry,
    transport::{Connection, Connector, WireMessage},
};

enum EpochEnd {
    Shutdown,
    Lost(String),
}

pub(crate) struct Supervisor {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    backoff: Backoff,
    tracker: SequenceTracker,
    epoch: u64,
}

impl Supervisor {
    pub(crate) fn new(shared: Arc<Shared>, connector: Arc<dyn Connector>) -> Self {
        let backoff = Backoff::new(&shared.options.reconnect);
        Self {
            shared,
            connector,
            backoff,
            tracker: SequenceTracker::new(),
            epoch: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        let endpoint = self.connector.endpoint();
        let cancel = self.shared.cancel.clone();
        let mut attempts: u64 = 0;

        loop {
            self.shared.status.transition(ConnectionState::Connecting);
            if attempts > 0 {
                telemetry::reconnect_attempt();
            }
            attempts += 1;

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.connect_once() => outcome,
            };
            match outcome {
                Ok((conn, hello)) => {
                    self.backoff.reset();
                    match self.run_epoch(conn, hello).await {
                        EpochEnd::Shutdown => break,
                        EpochEnd::Lost(reason) => {
                            warn!(%endpoint, epoch = self.epoch, %reason, "gateway connection lost");
                            self.shared
                                .status
                                .failed(ConnectionState::Reconnecting, reason);
                        },
                    }
                },
                Err(e @ Error::IncompatibleProtocol { .. }) => {
                    error!(%endpoint, error = %e, "protocol negotiation failed, giving up");
                    self.shared
                        .status
                        .failed(ConnectionState::Incompatible, e.to_string());
                    break;
                },
                Err(e) => {
                    warn!(%endpoint, attempt = attempts, error = %e, "gateway connection attempt failed");
                    self.shared
                        .status
                        .failed(ConnectionState::Reconnecting, e.to_string());
                },
            }

            let delay = self.backoff.next_delay();
            info!(delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
            // Registered here, so only wakes issued during this wait count.
            let wake = self.shared.wake.notified();
            tokio::pin!(wake);
            wake.as_mut().enable();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = wake => debug!("manual reconnect requested"),
                _ = sleep(delay) => {},
            }
        }

        self.shared.uninstall();
        self.shared.correlator.fail_all();
        self.shared.status.stopped();
        debug!(%endpoint, "supervisor stopped");
    }

    /// Transport connect and handshake, bounded together by the handshake
    /// timeout.
    async fn connect_once(&self) -> Result<(Connection, HelloOk)> {
        let limit = self.shared.options.handshake_timeout;
        let attempt = async {
            let mut conn = self.connector.connect().await?;
            let hello = self.handshake(&mut conn).await?;
            Ok::<_, Error>((conn, hello))
        };
        timeout(limit, attempt).await.map_err(|_| {
            Error::Handshake(format!(
                "no hello within {}ms of connecting",
                limit.as_millis()
            ))
        })?
    }

    async fn handshake(&self, conn: &mut Connection) -> Result<HelloOk> {
        let id = format!("connect-{}", self.epoch + 1);
        let params = serde_json::to_value(&self.shared.options.connect)?;
        let frame = GatewayFrame::from(RequestFrame::new(id.as_str(), CONNECT_METHOD, Some(params)));
        conn.sink.send(gatelink_protocol::encode(&frame)?).await?;

        while let Some(msg) = conn.stream.next().await {
            let WireMessage::Text(raw) = msg? else {
                continue;
            };
            match gatelink_protocol::decode(&raw) {
                Ok(GatewayFrame::Response(res)) if res.id == id => return self.negotiate(res),
                Ok(frame) => {
                    debug!(kind = frame.kind(), "ignoring frame received before hello");
                },
                Err(e) => warn!(error = %e, "undecodable frame during handshake"),
            }
        }
        Err(Error::transport("connection closed during handshake"))
    }

    fn negotiate(&self, res: ResponseFrame) -> Result<HelloOk> {
        let connect = &self.shared.options.connect;
        let incompatible = |detail: String| Error::IncompatibleProtocol {
            min: connect.min_protocol,
            max: connect.max_protocol,
            detail,
        };

        if !res.ok {
            let error = res
                .error
                .unwrap_or_else(|| ErrorShape::new(error_codes::INTERNAL, "connect rejected"));
            return match error.code.as_str() {
                error_codes::PROTOCOL_ERROR | error_codes::INCOMPATIBLE_PROTOCOL => {
                    Err(incompatible(error.message))
                },
                _ => Err(Error::Server {
                    method: CONNECT_METHOD.into(),
                    error,
                }),
            };
        }

        let hello: HelloOk = serde_json::from_value(res.payload.unwrap_or_default())
            .map_err(|e| Error::Handshake(format!("invalid hello payload: {e}")))?;
        if !connect.supports(hello.protocol) {
            return Err(incompatible(format!(
                "gateway negotiated protocol {}",
                hello.protocol
            )));
        }
        Ok(hello)
    }

    fn liveness_window(&self, hello: &HelloOk) -> Duration {
        let tick = self
            .shared
            .options
            .tick_interval
            .unwrap_or(Duration::from_millis(hello.policy.tick_interval_ms));
        tick.saturating_mul(self.shared.options.missed_ticks.max(1))
    }

    async fn run_epoch(&mut self, conn: Connection, hello: HelloOk) -> EpochEnd {
        self.epoch += 1;
        let epoch = self.epoch;
        self.tracker.reset();
        self.shared.correlator.begin_epoch(epoch);
        telemetry::epoch_started();

        let liveness = self.liveness_window(&hello);
        let protocol = hello.protocol;
        let conn_id = hello.server.conn_id.clone();
        let (tx, mut rx) = mpsc::channel::<String>(self.shared.options.outbound_queue);
        self.shared.install(hello, tx);
        self.shared.status.connected(epoch, protocol);
        info!(epoch, protocol, %conn_id, liveness_ms = liveness.as_millis() as u64, "connected to gateway");

        if epoch > 1 {
            self.shared
                .dispatcher
                .dispatch(&EventFrame::new(meta::RECONNECTED, json!({ "epoch": epoch })));
        }

        let Connection {
            mut sink,
            mut stream,
        } = conn;
        let cancel = self.shared.cancel.clone();
        let max_decode_errors = self.shared.options.max_consecutive_decode_errors;
        let mut deadline = Instant::now() + liveness;
        let mut degraded = false;
        let mut decode_errors: u32 = 0;

        let end = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if let Err(e) = sink.close().await {
                        debug!(error = %e, "close on shutdown failed");
                    }
                    break EpochEnd::Shutdown;
                },
                msg = stream.next() => {
                    let msg = match msg {
                        None => break EpochEnd::Lost("connection closed by gateway".into()),
                        Some(Err(e)) => break EpochEnd::Lost(e.to_string()),
                        Some(Ok(msg)) => msg,
                    };
                    deadline = Instant::now() + liveness;
                    if degraded {
                        degraded = false;
                        info!(epoch, "gateway traffic resumed");
                        self.shared.status.transition(ConnectionState::Connected);
                    }
                    let WireMessage::Text(raw) = msg else {
                        continue;
                    };
                    match self.handle_inbound(&raw) {
                        Ok(reply) => {
                            decode_errors = 0;
                            if let Some(reply) = reply
                                && let Err(e) = sink.send(reply).await
                            {
                                break EpochEnd::Lost(e.to_string());
                            }
                        },
                        Err(e) => {
                            decode_errors += 1;
                            telemetry::decode_error();
                            warn!(epoch, error = %e, consecutive = decode_errors, "dropping undecodable frame");
                            if decode_errors > max_decode_errors {
                                break EpochEnd::Lost(format!(
                                    "{decode_errors} consecutive undecodable frames"
                                ));
                            }
                        },
                    }
                },
                Some(raw) = rx.recv() => {
                    if let Err(e) = sink.send(raw).await {
                        break EpochEnd::Lost(e.to_string());
                    }
                },
                _ = sleep_until(deadline), if !degraded => {
                    degraded = true;
                    telemetry::degraded();
                    warn!(epoch, silent_ms = liveness.as_millis() as u64, "no gateway traffic, connection degraded");
                    self.shared.status.transition(ConnectionState::Degraded);
                },
            }
        };

        // New requests fail fast from here on; queued ones never reach the wire.
        self.shared.uninstall();
        drop(rx);
        self.shared.correlator.fail_all();
        end
    }

    /// Route one inbound text frame. Returns a frame to send back, if any.
    fn handle_inbound(&mut self, raw: &str) -> std::result::Result<Option<String>, DecodeError> {
        match gatelink_protocol::decode(raw)? {
            GatewayFrame::Response(res) => {
                self.shared.correlator.resolve(res);
                Ok(None)
            },
            GatewayFrame::Event(event) => {
                match self.tracker.observe(&event) {
                    SeqCheck::Gap { expected, received } => {
                        telemetry::seq_gap();
                        warn!(event = %event.event, expected, received, "event sequence gap");
                        self.shared.dispatcher.dispatch(&EventFrame::new(
                            meta::SEQ_GAP,
                            json!({ "expected": expected, "received": received }),
                        ));
                    },
                    SeqCheck::Regressed { last, received } => {
                        debug!(event = %event.event, last, received, "event sequence went backwards");
                    },
                    SeqCheck::Unsequenced | SeqCheck::First | SeqCheck::InOrder => {},
                }
                self.shared.dispatcher.dispatch(&event);
                Ok(None)
            },
            GatewayFrame::Request(req) => {
                debug!(method = %req.method, "rejecting gateway-initiated request");
                let reply = ResponseFrame::err(
                    req.id,
                    ErrorShape::new(
                        error_codes::UNKNOWN_METHOD,
                        format!("client does not handle {}", req.method),
                    ),
                );
                Ok(gatelink_protocol::encode(&reply.into()).ok())
            },
        }
    }
}
