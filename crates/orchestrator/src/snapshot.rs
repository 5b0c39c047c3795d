use serde::Serialize;

use crate::{
    aggregator::AggregatorConfig,
    burn::{BudgetStatus, CostSample, burn_rate},
    events::{CheckpointSaved, CostUpdated, MetricsHistory, OrchestratorEvent, StateChanged},
    window::RollingWindow,
};

/// Rendered view of one thread, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSnapshot {
    pub thread_id: String,
    pub total_usd: Option<f64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub model: Option<String>,
    pub state: Option<String>,
    pub burn_rate_usd_per_hour: Option<f64>,
    pub budget: Option<BudgetStatus>,
    pub recent_states: Vec<StateChanged>,
    pub recent_checkpoints: Vec<CheckpointSaved>,
    pub events_applied: u64,
    /// Events may have been missed; fetch history before trusting this.
    pub needs_resync: bool,
    pub updated_at_ms: Option<u64>,
}

impl ThreadSnapshot {
    pub fn empty(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            total_usd: None,
            input_tokens: None,
            output_tokens: None,
            model: None,
            state: None,
            burn_rate_usd_per_hour: None,
            budget: None,
            recent_states: Vec::new(),
            recent_checkpoints: Vec::new(),
            events_applied: 0,
            needs_resync: false,
            updated_at_ms: None,
        }
    }

    pub fn last_checkpoint(&self) -> Option<&CheckpointSaved> {
        self.recent_checkpoints.last()
    }
}

/// Per-thread accumulator behind a [`ThreadSnapshot`].
#[derive(Debug, Clone)]
pub struct ThreadMetrics {
    thread_id: String,
    costs: RollingWindow<CostSample>,
    states: RollingWindow<StateChanged>,
    checkpoints: RollingWindow<CheckpointSaved>,
    latest_cost: Option<CostUpdated>,
    events_applied: u64,
    needs_resync: bool,
    updated_at_ms: Option<u64>,
}

impl ThreadMetrics {
    pub fn new(thread_id: impl Into<String>, config: &AggregatorConfig) -> Self {
        Self {
            thread_id: thread_id.into(),
            costs: RollingWindow::new(config.cost_window),
            states: RollingWindow::new(config.state_window),
            checkpoints: RollingWindow::new(config.checkpoint_window),
            latest_cost: None,
            events_applied: 0,
            needs_resync: false,
            updated_at_ms: None,
        }
    }

    /// Rebuild from an authoritative history, keeping only what fits the
    /// windows. Clears the resync flag.
    pub fn from_history(history: MetricsHistory, config: &AggregatorConfig, now_ms: u64) -> Self {
        let mut metrics = Self::new(history.thread_id.clone(), config);
        for cost in history.costs {
            let at_ms = cost.timestamp.unwrap_or(now_ms);
            metrics.record_cost(cost, at_ms);
        }
        metrics.states.extend(history.states);
        metrics.checkpoints.extend(history.checkpoints);
        metrics.updated_at_ms = Some(now_ms);
        metrics
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Record one event. `received_at_ms` stands in for a missing timestamp.
    pub fn apply(&mut self, event: OrchestratorEvent, received_at_ms: u64) {
        let at_ms = event.timestamp().unwrap_or(received_at_ms);
        match event {
            OrchestratorEvent::Cost(cost) => self.record_cost(cost, at_ms),
            OrchestratorEvent::State(change) => {
                self.states.push(change);
            },
            OrchestratorEvent::Checkpoint(checkpoint) => {
                self.checkpoints.push(checkpoint);
            },
        }
        self.events_applied += 1;
        self.updated_at_ms = Some(at_ms);
    }

    fn record_cost(&mut self, cost: CostUpdated, at_ms: u64) {
        self.costs.push(CostSample {
            total_usd: cost.total_usd,
            at_ms,
        });
        self.latest_cost = Some(cost);
    }

    pub fn mark_needs_resync(&mut self) {
        self.needs_resync = true;
    }

    pub fn needs_resync(&self) -> bool {
        self.needs_resync
    }

    pub fn burn_rate(&self) -> Option<f64> {
        burn_rate(self.costs.iter())
    }

    pub fn snapshot(&self, budget_usd: Option<f64>) -> ThreadSnapshot {
        let burn = self.burn_rate();
        let cost = self.latest_cost.as_ref();
        let total_usd = cost.map(|c| c.total_usd);
        ThreadSnapshot {
            thread_id: self.thread_id.clone(),
            total_usd,
            input_tokens: cost.and_then(|c| c.input_tokens),
            output_tokens: cost.and_then(|c| c.output_tokens),
            model: cost.and_then(|c| c.model.clone()),
            state: self.states.newest().map(|s| s.to.clone()),
            burn_rate_usd_per_hour: burn,
            budget: budget_usd
                .and_then(|limit| BudgetStatus::evaluate(limit, total_usd.unwrap_or(0.0), burn)),
            recent_states: self.states.to_vec(),
            recent_checkpoints: self.checkpoints.to_vec(),
            events_applied: self.events_applied,
            needs_resync: self.needs_resync,
            updated_at_ms: self.updated_at_ms,
        }
    }
}
