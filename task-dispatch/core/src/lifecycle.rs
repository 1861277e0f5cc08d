// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! State machines of the termination protocol.

use std::fmt;

/// Lifecycle of the loop running inside a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawned,
    Running,
    /// A task failed; remaining input is discarded until `Shutdown`
    Erroring,
    /// `Shutdown` received; finishing up and acknowledging
    Draining,
    Exited,
}

impl WorkerState {
    pub fn can_transition(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Spawned, Running)
                | (Spawned, Exited)
                | (Running, Erroring)
                | (Running, Draining)
                | (Running, Exited)
                | (Erroring, Draining)
                | (Erroring, Exited)
                | (Draining, Exited)
        )
    }
}

/// Coordinator-side view of one worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLifecycle {
    Spawned,
    Running,
    Terminating,
    Joined,
}

/// Lifecycle of a dispatch call on the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Dispatching,
    Collecting,
    Success,
    Propagating,
    Terminating,
    Joined,
}

impl CoordinatorState {
    pub fn can_transition(self, next: CoordinatorState) -> bool {
        use CoordinatorState::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Dispatching, Collecting) | (Collecting, Dispatching) => true,
            (Dispatching | Collecting, Success | Propagating) => true,
            (Success | Propagating, Terminating) => true,
            (Terminating, Joined) => true,
            // fatal protocol errors skip straight to teardown
            (Dispatching | Collecting | Success | Propagating, Joined) => true,
            _ => false,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_error_path_still_drains() {
        assert!(WorkerState::Running.can_transition(WorkerState::Erroring));
        assert!(WorkerState::Erroring.can_transition(WorkerState::Draining));
        assert!(!WorkerState::Erroring.can_transition(WorkerState::Running));
        assert!(!WorkerState::Exited.can_transition(WorkerState::Running));
    }

    #[test]
    fn test_coordinator_never_leaves_joined() {
        use CoordinatorState::*;
        for next in [Dispatching, Collecting, Success, Propagating, Terminating] {
            assert!(!Joined.can_transition(next), "Joined -> {next}");
        }
        assert!(Success.can_transition(Terminating));
        assert!(Propagating.can_transition(Terminating));
        assert!(!Success.can_transition(Propagating));
    }
}
