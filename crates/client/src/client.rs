use std::{
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use {
    gatelink_config::GatelinkConfig,
    gatelink_protocol::{EventFrame, GatewayFrame, HelloOk, RequestFrame},
    serde::{Serialize, de::DeserializeOwned},
    serde_json::Value,
    tokio::{
        sync::{Notify, mpsc, oneshot::error::TryRecvError, watch},
        task::JoinHandle,
        time::Instant,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{
    Error, Result,
    correlator::{Completion, Correlator, PendingInfo, Registration},
    dispatcher::{EventDispatcher, SubscriptionId},
    options::{ClientOptions, RequestOptions},
    state::{ConnectionState, ConnectionStatus, StatusCell},
    supervisor::Supervisor,
    telemetry,
    transport::{Connector, WsConnector},
};

#[derive(Clone)]
struct Outbound {
    tx: mpsc::Sender<String>,
    hello: Arc<HelloOk>,
}

/// State shared between the client handles and the supervisor task.
pub(crate) struct Shared {
    pub(crate) options: ClientOptions,
    pub(crate) correlator: Correlator,
    pub(crate) dispatcher: EventDispatcher,
    pub(crate) status: StatusCell,
    pub(crate) cancel: CancellationToken,
    pub(crate) wake: Notify,
    outbound: RwLock<Option<Outbound>>,
    last_hello: RwLock<Option<Arc<HelloOk>>>,
}

impl Shared {
    fn new(options: ClientOptions) -> Self {
        Self {
            options,
            correlator: Correlator::new(),
            dispatcher: EventDispatcher::new(),
            status: StatusCell::new(),
            cancel: CancellationToken::new(),
            wake: Notify::new(),
            outbound: RwLock::new(None),
            last_hello: RwLock::new(None),
        }
    }

    /// Publish the outbound queue of a freshly negotiated epoch.
    pub(crate) fn install(&self, hello: HelloOk, tx: mpsc::Sender<String>) {
        let hello = Arc::new(hello);
        *self
            .last_hello
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&hello));
        *self.outbound.write().unwrap_or_else(PoisonError::into_inner) =
            Some(Outbound { tx, hello });
    }

    pub(crate) fn uninstall(&self) {
        self.outbound
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Register a request against the live epoch.
    ///
    /// Holds the outbound read lock across registration, so a teardown
    /// (`uninstall` then `fail_all`) either sees the entry and fails it, or
    /// has already run and the request is rejected here.
    fn register_live(
        &self,
        id: Option<String>,
        method: &str,
        timeout: Duration,
    ) -> Result<(Outbound, Registration)> {
        let outbound = self.outbound.read().unwrap_or_else(PoisonError::into_inner);
        let Some(live) = outbound.as_ref() else {
            return Err(Error::Disconnected);
        };
        let registration = self.correlator.register(id, method, timeout)?;
        Ok((live.clone(), registration))
    }
}

/// Stops the supervisor when the last client handle goes away.
struct Lifecycle {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to a supervised gateway connection. Cheap to clone.
#[derive(Clone)]
pub struct GatewayClient {
    shared: Arc<Shared>,
    lifecycle: Arc<Lifecycle>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("status", &self.status())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl GatewayClient {
    /// Spawn the connection supervisor. Must be called inside a tokio runtime.
    pub fn start(options: ClientOptions, connector: Arc<dyn Connector>) -> Self {
        let shared = Arc::new(Shared::new(options));
        let supervisor = Supervisor::new(Arc::clone(&shared), connector);
        let task = tokio::spawn(supervisor.run());
        Self {
            lifecycle: Arc::new(Lifecycle {
                cancel: shared.cancel.clone(),
                task: Mutex::new(Some(task)),
            }),
            shared,
        }
    }

    /// Connect over WebSocket using a loaded config.
    pub fn from_config(config: &GatelinkConfig) -> Result<Self> {
        let options = ClientOptions::from_config(config)?;
        let connector = WsConnector::new(&config.gateway.url)?;
        Ok(Self::start(options, Arc::new(connector)))
    }

    // ── Connection state ────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.shared.status.get().state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.get()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Call `handler` on every status change until the client and its
    /// supervisor are gone.
    pub fn on_status_change<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(&ConnectionStatus) + Send + 'static,
    {
        let mut rx = self.watch_status();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let status = rx.borrow_and_update().clone();
                handler(&status);
            }
        })
    }

    /// Wait until requests can be sent.
    ///
    /// Fails with [`Error::IncompatibleProtocol`] if negotiation failed, with
    /// [`Error::Timeout`] when `timeout` elapses first, and with
    /// [`Error::Disconnected`] after shutdown.
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.watch_status();
        let wait = async {
            let status = rx
                .wait_for(|s| {
                    s.state.is_live() || s.state == ConnectionState::Incompatible || s.stopped
                })
                .await
                .map_err(|_| Error::Disconnected)?
                .clone();
            match status.state {
                ConnectionState::Incompatible => Err(Error::IncompatibleProtocol {
                    min: self.shared.options.connect.min_protocol,
                    max: self.shared.options.connect.max_protocol,
                    detail: status.last_error.unwrap_or_default(),
                }),
                state if state.is_live() => Ok(()),
                _ => Err(Error::Disconnected),
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout {
                method: "connect".into(),
                timeout,
            })?
    }

    /// Hello of the current epoch, or of the last one if disconnected.
    pub fn hello(&self) -> Option<Arc<HelloOk>> {
        self.shared
            .last_hello
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ── Events ──────────────────────────────────────────────────────────────

    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&EventFrame) + Send + Sync + 'static,
    {
        self.shared.dispatcher.on(event, handler)
    }

    pub fn on_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&EventFrame) + Send + Sync + 'static,
    {
        self.shared.dispatcher.on_any(handler)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.shared.dispatcher.off(id)
    }

    // ── Requests ────────────────────────────────────────────────────────────

    /// Register and send one request without waiting for its response.
    ///
    /// Fails immediately with [`Error::Disconnected`] when no connection is
    /// live; requests are never queued across reconnects.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        opts: &RequestOptions,
    ) -> Result<PendingCall> {
        let timeout = opts.timeout.unwrap_or(self.shared.options.request_timeout);
        let (outbound, registration) =
            self.shared
                .register_live(opts.id.clone(), method, timeout)?;
        let call = PendingCall {
            id: registration.id,
            method: method.to_string(),
            timeout,
            deadline: Instant::now() + timeout,
            ticket: registration.ticket,
            completion: registration.completion,
            shared: Arc::clone(&self.shared),
            settled: false,
        };

        let frame = GatewayFrame::from(RequestFrame::new(call.id.as_str(), method, params));
        let raw = gatelink_protocol::encode(&frame)?;
        let max = outbound.hello.policy.max_payload;
        if raw.len() > max {
            return Err(Error::PayloadTooLarge {
                method: method.to_string(),
                size: raw.len(),
                max,
            });
        }
        if outbound.tx.send(raw).await.is_err() {
            return Err(Error::Disconnected);
        }
        telemetry::request_sent(method);
        debug!(id = %call.id, method, "request sent");
        Ok(call)
    }

    /// Send a request and wait for its result, retrying per `opts.retry`.
    pub async fn request_value(
        &self,
        method: &str,
        params: Option<Value>,
        opts: &RequestOptions,
    ) -> Result<Value> {
        let mut attempt: u32 = 0;
        loop {
            let result = match self.call(method, params.clone(), opts).await {
                Ok(call) => call.wait().await,
                Err(e) => Err(e),
            };
            match (result, opts.retry) {
                (Err(e), Some(policy)) if policy.should_retry(attempt, &e) => {
                    let delay = policy.delay_for(attempt, &e);
                    warn!(method, attempt = attempt + 1, error = %e, delay_ms = delay.as_millis() as u64, "retrying request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                (result, _) => return result,
            }
        }
    }

    /// Typed request with default options.
    pub async fn request<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let params = (!params.is_null()).then_some(params);
        let value = self
            .request_value(method, params, &RequestOptions::default())
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.correlator.len()
    }

    pub fn pending(&self) -> Vec<PendingInfo> {
        self.shared.correlator.pending()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Cut a running backoff wait short and reconnect now.
    ///
    /// Only a wait already in progress is affected: while connected (or
    /// degraded, or mid-handshake) this does nothing and the next disconnect
    /// still backs off normally.
    pub fn reconnect_now(&self) {
        self.shared.wake.notify_waiters();
    }

    /// Close the connection, reject pending requests and stop reconnecting.
    pub async fn shutdown(&self) {
        self.lifecycle.cancel.cancel();
        let task = self
            .lifecycle
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "supervisor task failed");
        }
    }
}

/// An in-flight request.
///
/// Dropping it before completion abandons the request: its pending entry is
/// removed and a late response is ignored.
pub struct PendingCall {
    id: String,
    method: String,
    timeout: Duration,
    deadline: Instant,
    ticket: u64,
    completion: Completion,
    shared: Arc<Shared>,
    settled: bool,
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl PendingCall {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wait for the response, the deadline, or a disconnect. The deadline
    /// runs from when the request was sent.
    pub async fn wait(mut self) -> Result<Value> {
        self.wait_inner().await
    }

    /// Like [`wait`](Self::wait), but give up with [`Error::Cancelled`] once
    /// `cancel` resolves.
    pub async fn wait_or_cancel(mut self, cancel: impl Future<Output = ()>) -> Result<Value> {
        tokio::select! {
            result = self.wait_inner() => result,
            () = cancel => {
                self.abandon();
                Err(Error::Cancelled { method: self.method.clone() })
            },
        }
    }

    /// Give up on the request. Nothing is sent to the gateway.
    pub fn abort(mut self) {
        self.abandon();
    }

    async fn wait_inner(&mut self) -> Result<Value> {
        let outcome = tokio::time::timeout_at(self.deadline, &mut self.completion).await;
        self.settled = true;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => {
                if !self.shared.correlator.remove(&self.id, self.ticket) {
                    // The response raced the deadline; prefer it.
                    match self.completion.try_recv() {
                        Ok(result) => return result,
                        Err(TryRecvError::Empty | TryRecvError::Closed) => {},
                    }
                }
                telemetry::request_timed_out(&self.method);
                warn!(id = %self.id, method = %self.method, timeout_ms = self.timeout.as_millis() as u64, "request timed out");
                Err(Error::Timeout {
                    method: self.method.clone(),
                    timeout: self.timeout,
                })
            },
        }
    }

    fn abandon(&mut self) {
        self.settled = true;
        if self.shared.correlator.remove(&self.id, self.ticket) {
            debug!(id = %self.id, method = %self.method, "request abandoned");
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.settled {
            self.abandon();
        }
    }
}
