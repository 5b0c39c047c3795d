//! Optimistic local updates tied to a request outcome.
//!
//! Apply a change locally before the gateway confirms it, then commit on
//! success or roll back on failure. Each command settles exactly once.

use tracing::debug;

use crate::Result;

pub trait OptimisticCommand {
    fn apply(&mut self);
    fn rollback(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimisticPhase {
    Idle,
    Applied,
    Committed,
    RolledBack,
}

#[derive(Debug)]
pub struct Optimistic<C> {
    command: C,
    phase: OptimisticPhase,
}

impl<C: OptimisticCommand> Optimistic<C> {
    pub fn new(command: C) -> Self {
        Self {
            command,
            phase: OptimisticPhase::Idle,
        }
    }

    pub fn phase(&self) -> OptimisticPhase {
        self.phase
    }

    /// Apply the local change. No-op unless idle.
    pub fn apply(&mut self) {
        if self.phase != OptimisticPhase::Idle {
            debug!(phase = ?self.phase, "optimistic command already applied");
            return;
        }
        self.command.apply();
        self.phase = OptimisticPhase::Applied;
    }

    /// Commit on `Ok`, roll back on `Err`. No-op unless applied.
    pub fn settle<T>(&mut self, outcome: &Result<T>) {
        if self.phase != OptimisticPhase::Applied {
            return;
        }
        match outcome {
            Ok(_) => self.phase = OptimisticPhase::Committed,
            Err(e) => {
                debug!(error = %e, "rolling back optimistic update");
                self.command.rollback();
                self.phase = OptimisticPhase::RolledBack;
            },
        }
    }

    /// Apply, await `request`, then settle on its outcome.
    pub async fn run<T>(&mut self, request: impl Future<Output = Result<T>>) -> Result<T> {
        self.apply();
        let outcome = request.await;
        self.settle(&outcome);
        outcome
    }

    pub fn into_inner(self) -> C {
        self.command
    }
}

/// Command built from a pair of closures.
pub struct FnCommand<A, R> {
    apply: A,
    rollback: R,
}

pub fn command<A: FnMut(), R: FnMut()>(apply: A, rollback: R) -> FnCommand<A, R> {
    FnCommand { apply, rollback }
}

impl<A: FnMut(), R: FnMut()> OptimisticCommand for FnCommand<A, R> {
    fn apply(&mut self) {
        (self.apply)();
    }

    fn rollback(&mut self) {
        (self.rollback)();
    }
}
