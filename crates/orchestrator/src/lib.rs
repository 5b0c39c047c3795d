//! Orchestrator metrics on top of the gateway client.
//!
//! Subscribes to `cost.updated`, `state.changed` and `checkpoint.saved`
//! events, keeps bounded per-thread history and derives burn rate and budget
//! health from it.

pub mod aggregator;
pub mod burn;
pub mod error;
pub mod events;
pub mod snapshot;
pub mod window;

pub use {
    aggregator::{
        AggregatorConfig, Attachment, MetricsAggregator, ThreadSubscription, UpdateHandle,
    },
    burn::{BudgetHealth, BudgetStatus, CostSample, burn_rate},
    error::{Error, Result},
    events::{CheckpointSaved, CostUpdated, MetricsHistory, OrchestratorEvent, StateChanged},
    snapshot::{ThreadMetrics, ThreadSnapshot},
    window::RollingWindow,
};
