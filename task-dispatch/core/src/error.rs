// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::shared_buffer::SharedBufferError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What went wrong inside a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The task returned an error or panicked
    Computation,
    /// The worker received a command it cannot honour (bad slot, wrong variant)
    Protocol,
    /// The worker could not be initialised for the job
    Startup,
}

/// Failure reported by a worker in place of a result
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("worker {worker} failed{}: {message}", on_item(.index))]
pub struct WorkerFailure {
    pub worker: usize,
    pub index: Option<usize>,
    pub kind: FailureKind,
    pub message: String,
}

impl WorkerFailure {
    pub fn computation(worker: usize, index: Option<usize>, message: impl Into<String>) -> Self {
        Self {
            worker,
            index,
            kind: FailureKind::Computation,
            message: message.into(),
        }
    }

    pub fn protocol(worker: usize, index: Option<usize>, message: impl Into<String>) -> Self {
        Self {
            worker,
            index,
            kind: FailureKind::Protocol,
            message: message.into(),
        }
    }

    pub fn startup(worker: usize, message: impl Into<String>) -> Self {
        Self {
            worker,
            index: None,
            kind: FailureKind::Startup,
            message: message.into(),
        }
    }
}

fn on_item(index: &Option<usize>) -> String {
    match index {
        Some(index) => format!(" on item {index}"),
        None => String::new(),
    }
}

/// Bookkeeping violations between coordinator and workers. Always fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("completion for unknown item {index} (only {total} submitted)")]
    UnknownIndex { index: usize, total: usize },

    #[error("item {index} completed more than once")]
    DuplicateCompletion { index: usize },

    #[error("slot {slot} out of range for {slots} slots")]
    InvalidSlot { slot: usize, slots: usize },

    #[error("slot {slot} reported item {reported} but holds {held:?}")]
    SlotMismatch {
        slot: usize,
        reported: usize,
        held: Option<usize>,
    },

    #[error("slot {slot} is still owned by item {occupant}")]
    SlotBusy { slot: usize, occupant: usize },

    #[error("worker {worker} closed its channel unexpectedly")]
    ChannelClosed { worker: usize },

    #[error("worker {worker} sent an unexpected {reply} reply")]
    UnexpectedReply { worker: usize, reply: &'static str },

    #[error("worker {worker} reported a protocol failure: {message}")]
    Rejected { worker: usize, message: String },

    #[error("undecodable frame from worker {worker}: {reason}")]
    MalformedFrame { worker: usize, reason: String },

    #[error("expected {expected} shutdown acknowledgements, got {received}")]
    AcknowledgementMismatch { expected: usize, received: usize },
}

/// Errors raised by the framed transport between coordinator and workers
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
}

/// Error surfaced to the caller of a dispatch call
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("{0}")]
    Worker(WorkerFailure),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("failed to start worker {worker}: {reason}")]
    PoolStartup { worker: usize, reason: String },

    #[error("item {index} has {actual} elements, slot holds {expected}")]
    ItemShape {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("reduction failed: {0}")]
    Reduce(String),

    #[error("invalid pool configuration: {0}")]
    Config(String),

    #[error(transparent)]
    SharedBuffer(#[from] SharedBufferError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DispatchError {
    /// Converts a worker-reported failure into the matching dispatch error
    pub fn from_failure(failure: WorkerFailure) -> Self {
        match failure.kind {
            FailureKind::Computation => Self::Worker(failure),
            FailureKind::Startup => Self::PoolStartup {
                worker: failure.worker,
                reason: failure.message,
            },
            FailureKind::Protocol => Self::Protocol(ProtocolError::Rejected {
                worker: failure.worker,
                message: failure.message,
            }),
        }
    }

    /// True if the error came from the caller's task rather than the engine
    pub fn is_computation(&self) -> bool {
        matches!(self, Self::Worker(_))
    }

    pub fn failure(&self) -> Option<&WorkerFailure> {
        match self {
            Self::Worker(failure) => Some(failure),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_display_names_worker_and_item() {
        let failure = WorkerFailure::computation(3, Some(17), "division by zero");
        assert_eq!(
            failure.to_string(),
            "worker 3 failed on item 17: division by zero"
        );

        let failure = WorkerFailure::startup(1, "unknown task 'blur'");
        assert_eq!(failure.to_string(), "worker 1 failed: unknown task 'blur'");
    }

    #[test]
    fn test_from_failure_maps_kinds() {
        let err = DispatchError::from_failure(WorkerFailure::computation(0, Some(2), "boom"));
        assert!(err.is_computation());
        assert_eq!(err.failure().and_then(|f| f.index), Some(2));

        let err = DispatchError::from_failure(WorkerFailure::startup(4, "no such task"));
        assert!(matches!(err, DispatchError::PoolStartup { worker: 4, .. }));

        let err = DispatchError::from_failure(WorkerFailure::protocol(1, None, "bad slot"));
        assert!(matches!(
            err,
            DispatchError::Protocol(ProtocolError::Rejected { worker: 1, .. })
        ));
    }
}
