// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Pool of worker processes driven over their stdin/stdout pipes.
//!
//! Every worker gets a writer task fed by a bounded channel (its input queue) and a
//! reader task that forwards decoded frames into one bounded channel shared by the
//! whole pool (the output queue). Dispatchers pick a worker with
//! [`WorkerPool::available_worker`], so no worker ever holds more than
//! `queue_capacity` unanswered items.

use crate::config::PoolConfig;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use task_dispatch_core::{
    CoordinatorState, DispatchError, FailureKind, JobSpec, ProtocolError, TransportError,
    WorkerCommand, WorkerFailure, WorkerLifecycle, WorkerReply,
};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

/// Environment variable that switches the binary into worker mode
pub const WORKER_ENV: &str = "TASK_DISPATCH_WORKER";

/// Counters of one dispatch call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub spawned: usize,
    pub pids: Vec<u32>,
    pub dispatched: usize,
    pub completed: usize,
    /// `Done` replies consumed during shutdown
    pub acknowledgements: usize,
    /// Replies drained and dropped during shutdown
    pub discarded: usize,
}

enum PoolEvent {
    Frame(usize, Bytes),
    Malformed(usize, String),
    Closed(usize),
}

struct WorkerHandle {
    worker: usize,
    pid: u32,
    child: Child,
    input: Option<mpsc::Sender<Bytes>>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    in_flight: usize,
    lifecycle: WorkerLifecycle,
    acknowledged: bool,
}

pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    events: mpsc::Receiver<PoolEvent>,
    config: PoolConfig,
    state: CoordinatorState,
    stats: PoolStats,
}

fn codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec()
}

fn startup_error(worker: usize, reason: impl Into<String>) -> DispatchError {
    DispatchError::PoolStartup {
        worker,
        reason: reason.into(),
    }
}

fn decode<R: DeserializeOwned>(worker: usize, frame: &[u8]) -> Result<WorkerReply<R>, DispatchError> {
    bincode::deserialize(frame).map_err(|e| {
        ProtocolError::MalformedFrame {
            worker,
            reason: e.to_string(),
        }
        .into()
    })
}

async fn write_frames(
    worker: usize,
    stdin: ChildStdin,
    mut commands: mpsc::Receiver<Bytes>,
    max_frame_length: usize,
) {
    let mut sink = FramedWrite::new(stdin, codec(max_frame_length));
    while let Some(frame) = commands.recv().await {
        if let Err(e) = sink.send(frame).await {
            debug!(worker, error = %e, "input channel closed");
            break;
        }
    }
}

async fn read_frames(
    worker: usize,
    stdout: ChildStdout,
    events: mpsc::Sender<PoolEvent>,
    max_frame_length: usize,
) {
    let mut frames = FramedRead::new(stdout, codec(max_frame_length));
    loop {
        let event = match frames.next().await {
            Some(Ok(frame)) => PoolEvent::Frame(worker, frame.freeze()),
            Some(Err(e)) => PoolEvent::Malformed(worker, e.to_string()),
            None => PoolEvent::Closed(worker),
        };
        let last = !matches!(event, PoolEvent::Frame(..));
        if events.send(event).await.is_err() || last {
            break;
        }
    }
}

fn spawn_worker(
    config: &PoolConfig,
    program: &Path,
    worker: usize,
    events: mpsc::Sender<PoolEvent>,
) -> Result<WorkerHandle, DispatchError> {
    let mut child = Command::new(program)
        .args(&config.worker_args)
        .env(WORKER_ENV, worker.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| startup_error(worker, format!("cannot spawn {}: {e}", program.display())))?;

    let pid = child
        .id()
        .ok_or_else(|| startup_error(worker, "exited before it could be tracked"))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| startup_error(worker, "stdin not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| startup_error(worker, "stdout not captured"))?;

    // Room for a full queue plus the shutdown command
    let (input, commands) = mpsc::channel(config.queue_capacity + 2);
    let writer = tokio::spawn(write_frames(
        worker,
        stdin,
        commands,
        config.max_frame_length,
    ));
    let reader = tokio::spawn(read_frames(worker, stdout, events, config.max_frame_length));

    debug!(worker, pid, "worker spawned");
    Ok(WorkerHandle {
        worker,
        pid,
        child,
        input: Some(input),
        writer,
        reader,
        in_flight: 0,
        lifecycle: WorkerLifecycle::Spawned,
        acknowledged: false,
    })
}

impl WorkerPool {
    /// Spawns `config.worker_count` workers, hands each its job and waits until all
    /// of them report `Ready`.
    pub async fn start(config: &PoolConfig, mut job: JobSpec) -> Result<Self, DispatchError> {
        config.validate()?;
        let worker_count = config.worker_count;
        job.context.worker_count = worker_count;
        let program = config
            .worker_program()
            .map_err(|e| startup_error(0, format!("cannot locate worker program: {e}")))?;

        let (events_tx, events) = mpsc::channel(config.queue_capacity * worker_count.max(1));
        let mut pool = Self {
            workers: Vec::with_capacity(worker_count),
            events,
            config: config.clone(),
            state: CoordinatorState::Dispatching,
            stats: PoolStats::default(),
        };

        for worker in 0..worker_count {
            match spawn_worker(config, &program, worker, events_tx.clone()) {
                Ok(handle) => {
                    pool.stats.spawned += 1;
                    pool.stats.pids.push(handle.pid);
                    pool.workers.push(handle);
                }
                Err(e) => {
                    error!(worker, error = %e, "failed to spawn worker");
                    pool.abort().await;
                    return Err(e);
                }
            }
        }
        drop(events_tx);
        info!(workers = worker_count, task = %job.task, "worker pool spawned");

        if let Err(e) = pool.initialise(&job).await {
            error!(error = %e, "worker pool failed to start");
            pool.abort().await;
            return Err(e);
        }
        Ok(pool)
    }

    async fn initialise(&mut self, job: &JobSpec) -> Result<(), DispatchError> {
        for worker in 0..self.workers.len() {
            let frame = Bytes::from(bincode::serialize(&job.for_worker(worker))?);
            self.send_frame(worker, frame)
                .await
                .map_err(|e| startup_error(worker, format!("cannot send job: {e}")))?;
        }

        let deadline = Instant::now() + self.config.startup_timeout();
        let mut pending = self.workers.len();
        while pending > 0 {
            let event = match timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => return Err(startup_error(0, "every worker exited during startup")),
                Err(_) => {
                    let worker = self
                        .workers
                        .iter()
                        .position(|w| w.lifecycle == WorkerLifecycle::Spawned)
                        .unwrap_or(0);
                    return Err(startup_error(
                        worker,
                        format!("not ready after {:?}", self.config.startup_timeout()),
                    ));
                }
            };

            match event {
                PoolEvent::Frame(worker, frame) => match decode::<()>(worker, &frame)? {
                    WorkerReply::Ready { pid, .. } => {
                        let handle = &mut self.workers[worker];
                        if handle.lifecycle == WorkerLifecycle::Spawned {
                            handle.lifecycle = WorkerLifecycle::Running;
                            pending -= 1;
                        }
                        debug!(worker, pid, "worker ready");
                    }
                    WorkerReply::Failed(failure) => return Err(DispatchError::from_failure(failure)),
                    other => {
                        return Err(ProtocolError::UnexpectedReply {
                            worker,
                            reply: other.name(),
                        }
                        .into())
                    }
                },
                PoolEvent::Malformed(worker, reason) => {
                    return Err(ProtocolError::MalformedFrame { worker, reason }.into())
                }
                PoolEvent::Closed(worker) => {
                    return Err(startup_error(worker, "exited during startup"))
                }
            }
        }
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub(crate) fn transition(&mut self, next: CoordinatorState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition(next) {
            warn!(from = %self.state, to = %next, "ignoring invalid coordinator transition");
            return;
        }
        debug!(from = %self.state, to = %next, "coordinator state");
        self.state = next;
    }

    /// Least loaded running worker with room in its queue
    pub fn available_worker(&self) -> Option<usize> {
        self.workers
            .iter()
            .filter(|w| {
                w.input.is_some()
                    && w.lifecycle == WorkerLifecycle::Running
                    && w.in_flight < self.config.queue_capacity
            })
            .min_by_key(|w| w.in_flight)
            .map(|w| w.worker)
    }

    async fn send_frame(&mut self, worker: usize, frame: Bytes) -> Result<(), DispatchError> {
        if frame.len() > self.config.max_frame_length {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                max: self.config.max_frame_length,
            }
            .into());
        }
        let closed = ProtocolError::ChannelClosed { worker };
        let Some(input) = self.workers.get(worker).and_then(|w| w.input.as_ref()) else {
            return Err(closed.into());
        };
        input
            .send(frame)
            .await
            .map_err(|_| DispatchError::from(closed))
    }

    /// Sends `command` to `worker`; a failure tears the pool down
    pub async fn dispatch<P: Serialize>(
        &mut self,
        worker: usize,
        command: &WorkerCommand<P>,
    ) -> Result<(), DispatchError> {
        self.transition(CoordinatorState::Dispatching);
        let sent = match bincode::serialize(command) {
            Ok(body) => self.send_frame(worker, Bytes::from(body)).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            error!(worker, error = %e, "dispatch failed");
            self.abort().await;
            return Err(e);
        }
        self.workers[worker].in_flight += 1;
        self.stats.dispatched += 1;
        Ok(())
    }

    /// Next reply from any worker.
    ///
    /// Computation failures are returned as `WorkerReply::Failed` so the caller can
    /// shut down gracefully. Anything fatal kills the pool before the error is
    /// returned.
    pub async fn recv<R: DeserializeOwned>(
        &mut self,
    ) -> Result<(usize, WorkerReply<R>), DispatchError> {
        self.transition(CoordinatorState::Collecting);
        match self.next_reply().await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                error!(error = %e, "fatal error while collecting");
                self.abort().await;
                Err(e)
            }
        }
    }

    async fn next_reply<R: DeserializeOwned>(
        &mut self,
    ) -> Result<(usize, WorkerReply<R>), DispatchError> {
        let Some(event) = self.events.recv().await else {
            let worker = self
                .workers
                .iter()
                .position(|w| w.lifecycle != WorkerLifecycle::Joined)
                .unwrap_or(0);
            return Err(ProtocolError::ChannelClosed { worker }.into());
        };

        match event {
            PoolEvent::Frame(worker, frame) => {
                let reply = decode::<R>(worker, &frame)?;
                match &reply {
                    WorkerReply::Completed { .. }
                    | WorkerReply::SlotCompleted { .. }
                    | WorkerReply::Folded { .. } => {
                        let handle = &mut self.workers[worker];
                        handle.in_flight = handle.in_flight.saturating_sub(1);
                        self.stats.completed += 1;
                    }
                    WorkerReply::Failed(failure) => {
                        let handle = &mut self.workers[worker];
                        handle.in_flight = handle.in_flight.saturating_sub(1);
                        if failure.kind == FailureKind::Protocol {
                            return Err(DispatchError::from_failure(failure.clone()));
                        }
                    }
                    _ => {}
                }
                Ok((worker, reply))
            }
            PoolEvent::Malformed(worker, reason) => {
                Err(ProtocolError::MalformedFrame { worker, reason }.into())
            }
            PoolEvent::Closed(worker) => Err(ProtocolError::ChannelClosed { worker }.into()),
        }
    }

    /// Graceful shutdown without a reducer; partials are discarded.
    ///
    /// `R` is the payload type late replies are decoded with.
    pub async fn close<R: DeserializeOwned>(&mut self) -> Result<Option<WorkerFailure>, DispatchError> {
        self.shutdown::<R>(None).await
    }

    /// Sends `Shutdown` to every worker and drains their replies until each one has
    /// acknowledged, then reaps the processes.
    ///
    /// Partials go to `partials` when given. Returns the first failure reported
    /// while draining. A worker that closes its channel without acknowledging is
    /// fatal and the pool is killed.
    pub async fn shutdown<R: DeserializeOwned>(
        &mut self,
        partials: Option<&mpsc::Sender<(usize, R)>>,
    ) -> Result<Option<WorkerFailure>, DispatchError> {
        if matches!(
            self.state,
            CoordinatorState::Dispatching | CoordinatorState::Collecting
        ) {
            self.transition(CoordinatorState::Success);
        }
        self.transition(CoordinatorState::Terminating);

        let frame = Bytes::from(bincode::serialize(&WorkerCommand::<()>::Shutdown)?);
        for worker in 0..self.workers.len() {
            let sent = self.send_frame(worker, frame.clone()).await;
            let handle = &mut self.workers[worker];
            handle.input = None;
            handle.lifecycle = WorkerLifecycle::Terminating;
            if let Err(e) = sent {
                error!(worker, error = %e, "cannot send shutdown");
                self.abort().await;
                return Err(e);
            }
        }

        match self.drain(partials).await {
            Ok(failure) => {
                self.join().await;
                Ok(failure)
            }
            Err(e) => {
                error!(error = %e, "shutdown handshake failed");
                self.abort().await;
                Err(e)
            }
        }
    }

    async fn drain<R: DeserializeOwned>(
        &mut self,
        partials: Option<&mpsc::Sender<(usize, R)>>,
    ) -> Result<Option<WorkerFailure>, DispatchError> {
        let expected = self.workers.len();
        let deadline = Instant::now() + self.config.shutdown_timeout();
        let mut failure = None;

        while self.stats.acknowledgements < expected {
            let event = match timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) | Err(_) => {
                    return Err(ProtocolError::AcknowledgementMismatch {
                        expected,
                        received: self.stats.acknowledgements,
                    }
                    .into())
                }
            };

            match event {
                PoolEvent::Frame(worker, frame) => match decode::<R>(worker, &frame)? {
                    WorkerReply::Done { .. } => {
                        let handle = &mut self.workers[worker];
                        if handle.acknowledged {
                            return Err(ProtocolError::UnexpectedReply {
                                worker,
                                reply: "Done",
                            }
                            .into());
                        }
                        handle.acknowledged = true;
                        self.stats.acknowledgements += 1;
                        debug!(worker, "shutdown acknowledged");
                    }
                    WorkerReply::Partial { payload, .. } => match partials {
                        Some(tx) => {
                            if tx.send((worker, payload)).await.is_err() {
                                debug!(worker, "reducer stopped, dropping partial");
                                self.stats.discarded += 1;
                            }
                        }
                        None => self.stats.discarded += 1,
                    },
                    WorkerReply::Completed { .. }
                    | WorkerReply::SlotCompleted { .. }
                    | WorkerReply::Folded { .. } => {
                        self.stats.discarded += 1;
                    }
                    WorkerReply::Failed(reported) => {
                        warn!(%reported, "failure reported during shutdown");
                        if reported.kind == FailureKind::Protocol {
                            return Err(DispatchError::from_failure(reported));
                        }
                        if failure.is_none() {
                            failure = Some(reported);
                        } else {
                            self.stats.discarded += 1;
                        }
                    }
                    WorkerReply::Ready { .. } => {
                        return Err(ProtocolError::UnexpectedReply {
                            worker,
                            reply: "Ready",
                        }
                        .into())
                    }
                },
                PoolEvent::Malformed(worker, reason) => {
                    return Err(ProtocolError::MalformedFrame { worker, reason }.into())
                }
                PoolEvent::Closed(worker) => {
                    if !self.workers[worker].acknowledged {
                        return Err(ProtocolError::ChannelClosed { worker }.into());
                    }
                }
            }
        }
        Ok(failure)
    }

    async fn join(&mut self) {
        let limit = self.config.shutdown_timeout();
        for handle in &mut self.workers {
            match timeout(limit, handle.child.wait()).await {
                Ok(Ok(status)) => debug!(worker = handle.worker, %status, "worker exited"),
                Ok(Err(e)) => warn!(worker = handle.worker, error = %e, "cannot reap worker"),
                Err(_) => {
                    warn!(worker = handle.worker, "worker still running after acknowledging, killing");
                    if let Err(e) = handle.child.kill().await {
                        warn!(worker = handle.worker, error = %e, "cannot kill worker");
                    }
                }
            }
            handle.writer.abort();
            handle.reader.abort();
            handle.lifecycle = WorkerLifecycle::Joined;
        }
        self.transition(CoordinatorState::Joined);
        info!(
            acknowledgements = self.stats.acknowledgements,
            discarded = self.stats.discarded,
            "worker pool joined"
        );
    }

    /// Kills and reaps every worker still alive
    pub async fn abort(&mut self) {
        for handle in &mut self.workers {
            if handle.lifecycle == WorkerLifecycle::Joined {
                continue;
            }
            handle.input = None;
            if let Err(e) = handle.child.start_kill() {
                debug!(worker = handle.worker, error = %e, "worker already gone");
            }
            if let Err(e) = handle.child.wait().await {
                warn!(worker = handle.worker, error = %e, "cannot reap worker");
            }
            handle.writer.abort();
            handle.reader.abort();
            handle.lifecycle = WorkerLifecycle::Joined;
        }
        self.transition(CoordinatorState::Joined);
        warn!(workers = self.workers.len(), "worker pool killed");
    }
}
