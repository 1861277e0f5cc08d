// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Worker side of the pool.
//!
//! Workers are the same binary re-executed with [`WORKER_ENV`] set. The binary
//! registers every task it can run and calls [`TaskRegistry::serve_if_worker`]
//! first thing in `main`; in worker mode that call serves one job over
//! stdin/stdout and exits the process.

use crate::logging;
use crate::worker_pool::WORKER_ENV;
use std::collections::HashMap;
use std::io::{Read, Write};
use task_dispatch_core::{
    serve_fold, serve_map, serve_reduce, serve_slot, FoldTask, FramedIo, JobSpec, MapTask,
    ReduceTask, SlotTask, TaskKind, TransportError, WorkerExit, WorkerFailure, WorkerReply, WorkerTransport,
};
use tracing::{debug, error, warn};

/// Transport every registered task is served over
pub type WorkerIo = FramedIo<Box<dyn Read>, Box<dyn Write>>;

type ServeFn = fn(&JobSpec, &mut WorkerIo) -> Result<WorkerExit, TransportError>;

struct Entry {
    kind: TaskKind,
    serve: ServeFn,
}

#[derive(Default)]
pub struct TaskRegistry {
    entries: HashMap<&'static str, Entry>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_map<T: MapTask>(mut self) -> Self {
        self.insert(T::NAME, TaskKind::Map, serve_map::<T, WorkerIo>);
        self
    }

    pub fn register_slot<T: SlotTask>(mut self) -> Self {
        self.insert(T::NAME, TaskKind::Slot, serve_slot::<T, WorkerIo>);
        self
    }

    pub fn register_reduce<T: ReduceTask>(mut self) -> Self {
        self.insert(T::NAME, TaskKind::Reduce, serve_reduce::<T, WorkerIo>);
        self
    }

    pub fn register_fold<T: FoldTask>(mut self) -> Self {
        self.insert(T::NAME, TaskKind::Fold, serve_fold::<T, WorkerIo>);
        self
    }

    fn insert(&mut self, name: &'static str, kind: TaskKind, serve: ServeFn) {
        if self.entries.insert(name, Entry { kind, serve }).is_some() {
            warn!(task = name, "task registered twice, keeping the last one");
        }
    }

    /// Reads the job from `io` and runs the matching task until shutdown
    pub fn serve(&self, io: &mut WorkerIo) -> Result<WorkerExit, TransportError> {
        let Some(job) = io.recv::<JobSpec>()? else {
            warn!("coordinator closed the channel before sending a job");
            return Ok(WorkerExit::Disconnected);
        };
        let worker = job.context.worker;
        debug!(worker, task = %job.task, kind = ?job.kind, "job received");

        let failure = match self.entries.get(job.task.as_str()) {
            Some(entry) if entry.kind == job.kind => return (entry.serve)(&job, io),
            Some(entry) => WorkerFailure::startup(
                worker,
                format!(
                    "task '{}' is registered as {:?}, job needs {:?}",
                    job.task, entry.kind, job.kind
                ),
            ),
            None => WorkerFailure::startup(worker, format!("unknown task '{}'", job.task)),
        };
        error!(worker, %failure, "cannot run job");
        io.send(&WorkerReply::<()>::Failed(failure))?;
        Ok(WorkerExit::Rejected)
    }

    /// Serves one job over stdin/stdout and exits if this process is a worker;
    /// returns immediately otherwise.
    ///
    /// Stdout carries the protocol, so task code must log through `tracing`
    /// (stderr) and never print.
    pub fn serve_if_worker(&self) {
        if std::env::var_os(WORKER_ENV).is_none() {
            return;
        }
        logging::init_worker();

        let mut io: WorkerIo = FramedIo::new(
            Box::new(std::io::stdin().lock()),
            Box::new(std::io::stdout().lock()),
        );
        let code = match self.serve(&mut io) {
            Ok(exit) => {
                debug!(?exit, "worker exiting");
                exit_code(exit)
            }
            Err(e) => {
                error!(error = %e, "worker transport failed");
                3
            }
        };
        drop(io);
        std::process::exit(code);
    }
}

fn exit_code(exit: WorkerExit) -> i32 {
    match exit {
        WorkerExit::Acknowledged => 0,
        WorkerExit::Disconnected => 1,
        WorkerExit::Rejected | WorkerExit::Aborted => 2,
    }
}
