use {
    gatelink_protocol::{EventFrame, StateVersion},
    tracing::debug,
};

/// Outcome of observing one event's `seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    /// The event carries no sequence number.
    Unsequenced,
    /// First sequenced event of the epoch.
    First,
    InOrder,
    /// One or more events were skipped. The event is still delivered.
    Gap { expected: u64, received: u64 },
    /// `seq` went backwards within the epoch.
    Regressed { last: u64, received: u64 },
}

/// Per-epoch tracker of event `seq` and `stateVersion`.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last_seq: Option<u64>,
    state_version: Option<StateVersion>,
    gaps: u64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything; sequence numbers restart with each connection.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn observe(&mut self, frame: &EventFrame) -> SeqCheck {
        if let Some(version) = frame.state_version {
            match self.state_version {
                Some(previous) if !version.is_at_least(&previous) => {
                    debug!(event = %frame.event, ?previous, ?version, "stale stateVersion");
                },
                _ => self.state_version = Some(version),
            }
        }

        let Some(seq) = frame.seq else {
            return SeqCheck::Unsequenced;
        };
        let check = match self.last_seq {
            None => SeqCheck::First,
            Some(last) if seq < last => SeqCheck::Regressed {
                last,
                received: seq,
            },
            Some(last) if seq > last.saturating_add(1) => SeqCheck::Gap {
                expected: last + 1,
                received: seq,
            },
            Some(_) => SeqCheck::InOrder,
        };
        match check {
            SeqCheck::Gap { .. } => {
                self.gaps += 1;
                self.last_seq = Some(seq);
            },
            SeqCheck::Regressed { .. } => {},
            _ => self.last_seq = Some(seq),
        }
        check
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// Newest state version seen this epoch.
    pub fn state_version(&self) -> Option<StateVersion> {
        self.state_version
    }

    pub fn gaps(&self) -> u64 {
        self.gaps
    }
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    fn event(seq: u64) -> EventFrame {
        EventFrame::new("presence", json!({})).with_seq(seq)
    }

    #[test]
    fn detects_gaps_and_keeps_going() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.observe(&event(1)), SeqCheck::First);
        assert_eq!(tracker.observe(&event(2)), SeqCheck::InOrder);
        assert_eq!(tracker.observe(&event(4)), SeqCheck::Gap {
            expected: 3,
            received: 4
        });
        assert_eq!(tracker.observe(&event(5)), SeqCheck::InOrder);
        assert_eq!(tracker.gaps(), 1);
        assert_eq!(tracker.last_seq(), Some(5));
    }

    #[test]
    fn repeated_seq_is_not_a_gap() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(&event(7));
        assert_eq!(tracker.observe(&event(7)), SeqCheck::InOrder);
    }

    #[test]
    fn regression_does_not_move_the_cursor() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(&event(10));
        assert_eq!(tracker.observe(&event(3)), SeqCheck::Regressed {
            last: 10,
            received: 3
        });
        assert_eq!(tracker.last_seq(), Some(10));
    }

    #[test]
    fn unsequenced_events_are_ignored() {
        let mut tracker = SequenceTracker::new();
        let frame = EventFrame::new("tick", json!({}));
        assert_eq!(tracker.observe(&frame), SeqCheck::Unsequenced);
        assert_eq!(tracker.last_seq(), None);
    }

    #[test]
    fn reset_starts_a_fresh_epoch() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(&event(40));
        tracker.reset();
        assert_eq!(tracker.observe(&event(1)), SeqCheck::First);
    }

    #[test]
    fn state_version_only_moves_forward() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(&EventFrame::new("health", json!({})).with_state_version(2, 5));
        tracker.observe(&EventFrame::new("health", json!({})).with_state_version(1, 5));
        assert_eq!(
            tracker.state_version(),
            Some(StateVersion {
                presence: 2,
                health: 5
            })
        );
        tracker.observe(&EventFrame::new("health", json!({})).with_state_version(3, 6));
        assert_eq!(tracker.state_version().map(|v| v.presence), Some(3));
    }
}
