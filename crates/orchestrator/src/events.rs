//! Orchestrator event payloads, as pushed by the gateway.

use {
    gatelink_protocol::EventFrame,
    serde::{Deserialize, Serialize},
};

pub const COST_UPDATED: &str = "cost.updated";
pub const STATE_CHANGED: &str = "state.changed";
pub const CHECKPOINT_SAVED: &str = "checkpoint.saved";

/// Method returning the authoritative history of one thread.
pub const HISTORY_METHOD: &str = "orchestrator.metrics.history";

/// Cumulative spend of a thread. `totalUsd` is a running total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostUpdated {
    pub thread_id: String,
    pub total_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChanged {
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSaved {
    pub thread_id: String,
    pub checkpoint_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// Payload of `orchestrator.metrics.history`, oldest entries first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MetricsHistory {
    pub thread_id: String,
    pub costs: Vec<CostUpdated>,
    pub states: Vec<StateChanged>,
    pub checkpoints: Vec<CheckpointSaved>,
}

impl MetricsHistory {
    /// Whether an identical entry is already part of this history.
    pub fn contains(&self, event: &OrchestratorEvent) -> bool {
        match event {
            OrchestratorEvent::Cost(e) => self.costs.contains(e),
            OrchestratorEvent::State(e) => self.states.contains(e),
            OrchestratorEvent::Checkpoint(e) => self.checkpoints.contains(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    Cost(CostUpdated),
    State(StateChanged),
    Checkpoint(CheckpointSaved),
}

impl OrchestratorEvent {
    /// Parse an orchestrator event. `None` for any other event name.
    pub fn from_frame(frame: &EventFrame) -> Option<serde_json::Result<Self>> {
        let payload = frame.payload.clone().unwrap_or_default();
        let parsed = match frame.event.as_str() {
            COST_UPDATED => serde_json::from_value(payload).map(Self::Cost),
            STATE_CHANGED => serde_json::from_value(payload).map(Self::State),
            CHECKPOINT_SAVED => serde_json::from_value(payload).map(Self::Checkpoint),
            _ => return None,
        };
        Some(parsed)
    }

    pub fn thread_id(&self) -> &str {
        match self {
            Self::Cost(e) => &e.thread_id,
            Self::State(e) => &e.thread_id,
            Self::Checkpoint(e) => &e.thread_id,
        }
    }

    pub fn timestamp(&self) -> Option<u64> {
        match self {
            Self::Cost(e) => e.timestamp,
            Self::State(e) => e.timestamp,
            Self::Checkpoint(e) => e.timestamp,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn parses_cost_event() {
        let frame = EventFrame::new(
            COST_UPDATED,
            json!({"threadId": "t1", "totalUsd": 1.25, "inputTokens": 900, "timestamp": 1000}),
        );
        let event = OrchestratorEvent::from_frame(&frame).unwrap().unwrap();
        assert_eq!(event.thread_id(), "t1");
        assert_eq!(event.timestamp(), Some(1000));
        match event {
            OrchestratorEvent::Cost(cost) => {
                assert_eq!(cost.total_usd, 1.25);
                assert_eq!(cost.input_tokens, Some(900));
                assert!(cost.output_tokens.is_none());
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn history_knows_its_entries() {
        let history: MetricsHistory = serde_json::from_value(json!({
            "threadId": "t1",
            "states": [{"threadId": "t1", "to": "running", "timestamp": 5}]
        }))
        .unwrap();
        let seen = OrchestratorEvent::State(history.states[0].clone());
        let later = OrchestratorEvent::State(StateChanged {
            timestamp: Some(6),
            ..history.states[0].clone()
        });
        assert!(history.contains(&seen));
        assert!(!history.contains(&later));
    }

    #[test]
    fn other_events_are_not_ours() {
        let frame = EventFrame::new("presence", json!({}));
        assert!(OrchestratorEvent::from_frame(&frame).is_none());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let frame = EventFrame::new(STATE_CHANGED, json!({"threadId": "t1"}));
        assert!(OrchestratorEvent::from_frame(&frame).unwrap().is_err());
    }

    #[test]
    fn history_tolerates_missing_sections() {
        let history: MetricsHistory =
            serde_json::from_value(json!({"threadId": "t1", "costs": []})).unwrap();
        assert_eq!(history.thread_id, "t1");
        assert!(history.states.is_empty());
    }
}
