// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::error::WorkerFailure;
use crate::shared_buffer::{BufferHandle, Shape};
use serde::{Deserialize, Serialize};

/// Which worker loop a job runs
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Items travel through the channel (`process_mp`)
    Map,
    /// Items live in shared buffer slots (`for_process_mp_shmem`)
    Slot,
    /// Slot items folded into a per-worker partial (`map_reduce`)
    Reduce,
    /// Channel items folded into one value per worker (`iterate_reduce`)
    Fold,
}

/// Identity of a worker within its pool
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerContext {
    pub worker: usize,
    pub worker_count: usize,
}

impl WorkerContext {
    /// Context used when a dispatcher runs in the caller's process
    pub fn serial() -> Self {
        Self {
            worker: 0,
            worker_count: 1,
        }
    }
}

/// First frame every worker receives: everything it needs to build its task
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JobSpec {
    pub task: String,
    pub kind: TaskKind,
    pub context: WorkerContext,
    /// Task options, encoded with the wire codec
    pub options: Vec<u8>,
    pub buffer: Option<BufferHandle>,
    pub shape: Option<Shape>,
}

impl JobSpec {
    pub fn for_worker(&self, worker: usize) -> Self {
        let mut spec = self.clone();
        spec.context.worker = worker;
        spec
    }
}

/// Message types received by workers
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum WorkerCommand<P> {
    /// Work item carried by value
    Work { index: usize, payload: P },
    /// Work item already written into a shared buffer slot
    Slot { slot: usize, index: usize },
    /// No more work will follow
    Shutdown,
}

/// Message types sent by workers
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum WorkerReply<R> {
    /// Task initialised, worker is waiting for commands
    Ready { worker: usize, pid: u32 },
    /// Result of a `Work` command
    Completed { index: usize, payload: R },
    /// The slot now holds the result for `index`
    SlotCompleted { slot: usize, index: usize },
    /// `index` was folded into the worker's state
    Folded { index: usize },
    /// Per-worker partial of a reduction, sent before `Done`
    Partial { worker: usize, payload: R },
    /// Sent in place of a result
    Failed(WorkerFailure),
    /// Acknowledges `Shutdown`; the worker exits afterwards
    Done { worker: usize },
}

impl<R> WorkerReply<R> {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerReply::Ready { .. } => "Ready",
            WorkerReply::Completed { .. } => "Completed",
            WorkerReply::SlotCompleted { .. } => "SlotCompleted",
            WorkerReply::Folded { .. } => "Folded",
            WorkerReply::Partial { .. } => "Partial",
            WorkerReply::Failed(_) => "Failed",
            WorkerReply::Done { .. } => "Done",
        }
    }
}
