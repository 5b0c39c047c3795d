//! Live per-thread metrics fed by gateway events.
//!
//! Every event lands in the thread's rolling windows immediately. Rendered
//! snapshots go out through a `watch` channel, so a slow subscriber only ever
//! sees the latest value, and [`ThreadSubscription::on_update`] further
//! spaces deliveries by the configured frame interval.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    gatelink_client::{GatewayClient, RequestOptions, RetryPolicy, SubscriptionId, meta},
    gatelink_config::OrchestratorConfig,
    gatelink_protocol::EventFrame,
    serde_json::json,
    tokio::{
        sync::watch,
        task::JoinHandle,
        time::{Instant, sleep_until},
    },
    tracing::{debug, info, warn},
};

use crate::{
    Error, Result,
    events::{
        CHECKPOINT_SAVED, COST_UPDATED, HISTORY_METHOD, MetricsHistory, OrchestratorEvent,
        STATE_CHANGED,
    },
    snapshot::{ThreadMetrics, ThreadSnapshot},
};

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorConfig {
    pub state_window: usize,
    pub cost_window: usize,
    pub checkpoint_window: usize,
    pub frame_interval: Duration,
    pub budget_usd: Option<f64>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for AggregatorConfig {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            state_window: config.state_window,
            cost_window: config.cost_window,
            checkpoint_window: config.checkpoint_window,
            frame_interval: Duration::from_millis(config.frame_interval_ms),
            budget_usd: config.budget_usd,
        }
    }
}

struct ThreadEntry {
    metrics: ThreadMetrics,
    tx: watch::Sender<ThreadSnapshot>,
    resync: Option<PendingResync>,
}

/// Live traffic seen while a history request is in flight, replayed on top
/// of the history once it lands.
struct PendingResync {
    generation: u64,
    buffered: Vec<(OrchestratorEvent, u64)>,
    marked: bool,
}

impl ThreadEntry {
    fn new(thread_id: &str, config: &AggregatorConfig) -> Self {
        let metrics = ThreadMetrics::new(thread_id, config);
        let (tx, _) = watch::channel(metrics.snapshot(config.budget_usd));
        Self {
            metrics,
            tx,
            resync: None,
        }
    }

    fn publish(&self, budget_usd: Option<f64>) {
        self.tx.send_replace(self.metrics.snapshot(budget_usd));
    }
}

struct Inner {
    config: AggregatorConfig,
    threads: Mutex<HashMap<String, ThreadEntry>>,
    generations: AtomicU64,
}

impl Inner {
    fn threads(&self) -> MutexGuard<'_, HashMap<String, ThreadEntry>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, event: OrchestratorEvent) -> bool {
        let mut threads = self.threads();
        let Some(entry) = threads.get_mut(event.thread_id()) else {
            return false;
        };
        let received_at_ms = now_ms();
        if let Some(pending) = entry.resync.as_mut() {
            pending.buffered.push((event.clone(), received_at_ms));
        }
        entry.metrics.apply(event, received_at_ms);
        entry.publish(self.config.budget_usd);
        true
    }

    fn mark_all_needs_resync(&self) -> usize {
        let mut threads = self.threads();
        for entry in threads.values_mut() {
            if let Some(pending) = entry.resync.as_mut() {
                pending.marked = true;
            }
            if !entry.metrics.needs_resync() {
                entry.metrics.mark_needs_resync();
                entry.publish(self.config.budget_usd);
            }
        }
        threads.len()
    }

    fn handle_frame(&self, frame: &EventFrame) {
        match OrchestratorEvent::from_frame(frame) {
            Some(Ok(event)) => {
                if !self.apply(event) {
                    debug!(event = %frame.event, "event for an unwatched thread");
                }
            },
            Some(Err(e)) => warn!(event = %frame.event, error = %e, "malformed orchestrator event"),
            None => {},
        }
    }
}

/// Aggregates orchestrator events for the threads someone subscribed to.
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MetricsAggregator {
    inner: Arc<Inner>,
}

impl MetricsAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                threads: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(AggregatorConfig::from(config))
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.inner.config
    }

    /// Start (or join) tracking `thread_id`.
    pub fn subscribe(&self, thread_id: &str) -> ThreadSubscription {
        let mut threads = self.inner.threads();
        let entry = threads
            .entry(thread_id.to_string())
            .or_insert_with(|| ThreadEntry::new(thread_id, &self.inner.config));
        ThreadSubscription {
            thread_id: thread_id.to_string(),
            rx: entry.tx.subscribe(),
            frame_interval: self.inner.config.frame_interval,
        }
    }

    /// Stop tracking `thread_id`. Open subscriptions see the stream end.
    pub fn unsubscribe(&self, thread_id: &str) -> bool {
        self.inner.threads().remove(thread_id).is_some()
    }

    pub fn threads(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.threads().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self, thread_id: &str) -> Option<ThreadSnapshot> {
        self.inner
            .threads()
            .get(thread_id)
            .map(|entry| entry.tx.borrow().clone())
    }

    /// Record one event. Returns `false` if its thread is not tracked.
    pub fn apply(&self, event: OrchestratorEvent) -> bool {
        self.inner.apply(event)
    }

    /// Flag every tracked thread as possibly stale.
    pub fn mark_needs_resync(&self) {
        let threads = self.inner.mark_all_needs_resync();
        debug!(threads, "orchestrator snapshots marked stale");
    }

    pub fn resync_pending(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .threads()
            .iter()
            .filter(|(_, entry)| entry.metrics.needs_resync())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Route the client's orchestrator and meta events into this aggregator.
    pub fn attach(&self, client: &GatewayClient) -> Attachment {
        let mut ids = Vec::with_capacity(5);
        for event in [COST_UPDATED, STATE_CHANGED, CHECKPOINT_SAVED] {
            let inner = Arc::downgrade(&self.inner);
            ids.push(client.on(event, move |frame| {
                if let Some(inner) = Weak::upgrade(&inner) {
                    inner.handle_frame(frame);
                }
            }));
        }
        for event in [meta::RECONNECTED, meta::SEQ_GAP] {
            let inner = Arc::downgrade(&self.inner);
            ids.push(client.on(event, move |frame| {
                if let Some(inner) = Weak::upgrade(&inner) {
                    let threads = inner.mark_all_needs_resync();
                    info!(trigger = %frame.event, threads, "orchestrator snapshots need resync");
                }
            }));
        }
        Attachment {
            client: client.clone(),
            ids,
        }
    }

    /// Replace the thread's state with the gateway's authoritative history.
    ///
    /// Events that arrive while the history is being fetched are replayed
    /// on top of it, skipping the ones the history already holds. A thread
    /// unsubscribed in the meantime stays gone, and a resync overtaken by a
    /// newer one for the same thread leaves the write to the newer one.
    pub async fn resync(&self, client: &GatewayClient, thread_id: &str) -> Result<ThreadSnapshot> {
        let generation = self.begin_resync(thread_id)?;
        let fetched = fetch_history(client, thread_id).await;

        let config = &self.inner.config;
        let mut threads = self.inner.threads();
        let Some(entry) = threads.get_mut(thread_id) else {
            debug!(thread_id, "thread unsubscribed during resync");
            return Err(Error::NotTracked(thread_id.to_string()));
        };
        let Some(pending) = entry.resync.take_if(|p| p.generation == generation) else {
            return Err(Error::Superseded(thread_id.to_string()));
        };
        let history = fetched?;

        let unseen: Vec<_> = pending
            .buffered
            .into_iter()
            .filter(|(event, _)| !history.contains(event))
            .collect();
        let replayed = unseen.len();
        let mut metrics = ThreadMetrics::from_history(history, config, now_ms());
        for (event, received_at_ms) in unseen {
            metrics.apply(event, received_at_ms);
        }
        if pending.marked {
            metrics.mark_needs_resync();
        }
        entry.metrics = metrics;
        entry.publish(config.budget_usd);
        let snapshot = entry.tx.borrow().clone();
        drop(threads);

        info!(thread_id, replayed, "orchestrator snapshot resynced");
        Ok(snapshot)
    }

    /// Open a replay buffer for `thread_id`, superseding any resync already
    /// in flight for it.
    fn begin_resync(&self, thread_id: &str) -> Result<u64> {
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let mut threads = self.inner.threads();
        let entry = threads
            .get_mut(thread_id)
            .ok_or_else(|| Error::NotTracked(thread_id.to_string()))?;
        entry.resync = Some(PendingResync {
            generation,
            buffered: Vec::new(),
            marked: false,
        });
        Ok(generation)
    }

    /// Resync every thread flagged stale. Returns the ones that succeeded.
    pub async fn resync_all(&self, client: &GatewayClient) -> Vec<String> {
        let mut done = Vec::new();
        for thread_id in self.resync_pending() {
            match self.resync(client, &thread_id).await {
                Ok(_) => done.push(thread_id),
                Err(e) => warn!(%thread_id, error = %e, "orchestrator resync failed"),
            }
        }
        done
    }
}

/// Handlers installed by [`MetricsAggregator::attach`]; removed on drop.
pub struct Attachment {
    client: GatewayClient,
    ids: Vec<SubscriptionId>,
}

impl Attachment {
    pub fn detach(mut self) {
        self.remove_handlers();
    }

    fn remove_handlers(&mut self) {
        for id in self.ids.drain(..) {
            self.client.off(id);
        }
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.remove_handlers();
    }
}

/// One consumer's view of a thread.
pub struct ThreadSubscription {
    thread_id: String,
    rx: watch::Receiver<ThreadSnapshot>,
    frame_interval: Duration,
}

impl ThreadSubscription {
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn current_snapshot(&self) -> ThreadSnapshot {
        self.rx.borrow().clone()
    }

    /// Wait for the next snapshot. `None` once the thread is unsubscribed.
    pub async fn changed(&mut self) -> Option<ThreadSnapshot> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Call `handler` with the latest snapshot, at most once per frame
    /// interval. Updates in between are coalesced into the next call.
    pub fn on_update<F>(&self, handler: F) -> UpdateHandle
    where
        F: Fn(&ThreadSnapshot) + Send + 'static,
    {
        let mut rx = self.rx.clone();
        let interval = self.frame_interval;
        let task = tokio::spawn(async move {
            let mut last_render: Option<Instant> = None;
            while rx.changed().await.is_ok() {
                if let Some(at) = last_render {
                    sleep_until(at + interval).await;
                }
                let snapshot = rx.borrow_and_update().clone();
                handler(&snapshot);
                last_render = Some(Instant::now());
            }
        });
        UpdateHandle { task }
    }
}

/// Stops an [`ThreadSubscription::on_update`] handler when dropped.
pub struct UpdateHandle {
    task: JoinHandle<()>,
}

impl UpdateHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for UpdateHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn fetch_history(client: &GatewayClient, thread_id: &str) -> Result<MetricsHistory> {
    let opts = RequestOptions::default().retry(RetryPolicy::default());
    let payload = client
        .request_value(HISTORY_METHOD, Some(json!({ "threadId": thread_id })), &opts)
        .await?;
    let mut history: MetricsHistory = serde_json::from_value(payload)?;
    if history.thread_id.is_empty() {
        history.thread_id = thread_id.to_string();
    }
    Ok(history)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
