// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Standard worker loops.
//!
//! A worker announces itself with `Ready`, then handles commands until it sees
//! `Shutdown`, which it acknowledges with `Done` before returning. A failing task is
//! reported with `Failed` and the loop keeps reading, discarding work, until the
//! shutdown arrives; the coordinator can therefore always complete the handshake.
//! A protocol failure (a command the worker cannot honour) is reported and the loop
//! stops immediately.

use crate::error::{FailureKind, TransportError, WorkerFailure};
use crate::lifecycle::WorkerState;
use crate::shared_buffer::{SharedBuffer, Shape};
use crate::task::{guarded, FoldTask, MapTask, ReduceTask, SlotTask};
use crate::worker_io::WorkerTransport;
use crate::worker_message::{JobSpec, WorkerCommand, WorkerContext, WorkerReply};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};

/// How a worker loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// `Shutdown` received and acknowledged
    Acknowledged,
    /// Input channel closed before `Shutdown`
    Disconnected,
    /// Job could not be started; a startup failure was reported
    Rejected,
    /// Protocol failure reported; no acknowledgement follows
    Aborted,
}

trait Behavior {
    type Payload: DeserializeOwned;
    type Reply: Serialize;

    fn context(&self) -> &WorkerContext;

    fn on_work(
        &mut self,
        index: usize,
        _payload: Self::Payload,
    ) -> Result<WorkerReply<Self::Reply>, WorkerFailure> {
        Err(WorkerFailure::protocol(
            self.context().worker,
            Some(index),
            "Work command sent to a shared-buffer worker",
        ))
    }

    fn on_slot(
        &mut self,
        _slot: usize,
        index: usize,
    ) -> Result<WorkerReply<Self::Reply>, WorkerFailure> {
        Err(WorkerFailure::protocol(
            self.context().worker,
            Some(index),
            "Slot command sent to a channel worker",
        ))
    }

    /// Final payload sent before the acknowledgement
    fn on_shutdown(&mut self) -> Result<Option<Self::Reply>, WorkerFailure> {
        Ok(None)
    }
}

struct WorkerLoop<'a, X> {
    context: WorkerContext,
    transport: &'a mut X,
    state: WorkerState,
}

impl<'a, X: WorkerTransport> WorkerLoop<'a, X> {
    fn new(context: WorkerContext, transport: &'a mut X) -> Self {
        Self {
            context,
            transport,
            state: WorkerState::Spawned,
        }
    }

    fn transition(&mut self, next: WorkerState) {
        debug_assert!(
            self.state.can_transition(next),
            "invalid worker transition {} -> {}",
            self.state,
            next
        );
        debug!(worker = self.context.worker, from = %self.state, to = %next, "worker state");
        self.state = next;
    }

    fn reject(mut self, failure: WorkerFailure) -> Result<WorkerExit, TransportError> {
        error!(worker = self.context.worker, %failure, "worker failed to start");
        self.transport.send(&WorkerReply::<()>::Failed(failure))?;
        self.transition(WorkerState::Exited);
        Ok(WorkerExit::Rejected)
    }

    fn run<B: Behavior>(mut self, behavior: &mut B) -> Result<WorkerExit, TransportError> {
        let worker = self.context.worker;
        self.transport.send(&WorkerReply::<()>::Ready {
            worker,
            pid: std::process::id(),
        })?;
        self.transition(WorkerState::Running);

        loop {
            let Some(command) = self.transport.recv::<WorkerCommand<B::Payload>>()? else {
                warn!(worker, "input channel closed without shutdown");
                self.transition(WorkerState::Exited);
                return Ok(WorkerExit::Disconnected);
            };

            let outcome = match command {
                WorkerCommand::Shutdown => break,
                WorkerCommand::Work { index, .. } | WorkerCommand::Slot { index, .. }
                    if self.state == WorkerState::Erroring =>
                {
                    debug!(worker, index, "discarding item after failure");
                    continue;
                }
                WorkerCommand::Work { index, payload } => behavior.on_work(index, payload),
                WorkerCommand::Slot { slot, index } => behavior.on_slot(slot, index),
            };

            match outcome {
                Ok(reply) => self.transport.send(&reply)?,
                Err(failure) => {
                    error!(worker, %failure, "task failed");
                    let kind = failure.kind;
                    self.transport.send(&WorkerReply::<B::Reply>::Failed(failure))?;
                    if kind == FailureKind::Protocol {
                        self.transition(WorkerState::Exited);
                        return Ok(WorkerExit::Aborted);
                    }
                    self.transition(WorkerState::Erroring);
                }
            }
        }

        let healthy = self.state == WorkerState::Running;
        self.transition(WorkerState::Draining);
        if healthy {
            match behavior.on_shutdown() {
                Ok(Some(payload)) => self
                    .transport
                    .send(&WorkerReply::Partial { worker, payload })?,
                Ok(None) => {}
                Err(failure) => {
                    error!(worker, %failure, "final step failed");
                    self.transport.send(&WorkerReply::<B::Reply>::Failed(failure))?;
                }
            }
        }
        self.transport.send(&WorkerReply::<()>::Done { worker })?;
        self.transition(WorkerState::Exited);
        Ok(WorkerExit::Acknowledged)
    }
}

fn options<O: DeserializeOwned>(spec: &JobSpec) -> Result<O, WorkerFailure> {
    bincode::deserialize(&spec.options).map_err(|e| {
        WorkerFailure::startup(
            spec.context.worker,
            format!("invalid options for '{}': {e}", spec.task),
        )
    })
}

fn init<T>(
    context: &WorkerContext,
    f: impl FnOnce() -> anyhow::Result<T>,
) -> Result<T, WorkerFailure> {
    guarded(context, None, f)
        .map_err(|failure| WorkerFailure::startup(context.worker, failure.message))
}

fn shared_buffer<E: bytemuck::Pod>(
    spec: &JobSpec,
) -> Result<(SharedBuffer<E>, Shape), WorkerFailure> {
    let worker = spec.context.worker;
    let (Some(handle), Some(shape)) = (&spec.buffer, &spec.shape) else {
        return Err(WorkerFailure::startup(
            worker,
            "shared-buffer job without buffer handle or shape",
        ));
    };
    let buffer = SharedBuffer::recreate(handle)
        .map_err(|e| WorkerFailure::startup(worker, format!("cannot map shared buffer: {e}")))?;
    Ok((buffer, shape.clone()))
}

struct MapBehavior<T: MapTask> {
    context: WorkerContext,
    task: T,
    options: T::Options,
}

impl<T: MapTask> Behavior for MapBehavior<T> {
    type Payload = T::Input;
    type Reply = T::Output;

    fn context(&self) -> &WorkerContext {
        &self.context
    }

    fn on_work(
        &mut self,
        index: usize,
        payload: T::Input,
    ) -> Result<WorkerReply<T::Output>, WorkerFailure> {
        let (task, options) = (&mut self.task, &self.options);
        let payload = guarded(&self.context, Some(index), || {
            task.process(payload, index, options)
        })?;
        Ok(WorkerReply::Completed { index, payload })
    }
}

struct SlotBehavior<T: SlotTask> {
    context: WorkerContext,
    task: T,
    options: T::Options,
    buffer: SharedBuffer<T::Elem>,
    shape: Shape,
}

impl<T: SlotTask> Behavior for SlotBehavior<T> {
    type Payload = ();
    type Reply = ();

    fn context(&self) -> &WorkerContext {
        &self.context
    }

    fn on_slot(&mut self, slot: usize, index: usize) -> Result<WorkerReply<()>, WorkerFailure> {
        let slots = self.buffer.slot_count(&self.shape);
        let Some(view) = self.buffer.slot_mut(slot, &self.shape) else {
            return Err(WorkerFailure::protocol(
                self.context.worker,
                Some(index),
                format!("slot {slot} out of range for {slots} slots"),
            ));
        };
        let (task, options) = (&mut self.task, &self.options);
        guarded(&self.context, Some(index), || {
            task.process(view, index, options)
        })?;
        Ok(WorkerReply::SlotCompleted { slot, index })
    }
}

struct ReduceBehavior<T: ReduceTask> {
    context: WorkerContext,
    task: Option<T>,
    options: T::Options,
    buffer: SharedBuffer<T::Elem>,
    shape: Shape,
}

impl<T: ReduceTask> Behavior for ReduceBehavior<T> {
    type Payload = ();
    type Reply = T::Partial;

    fn context(&self) -> &WorkerContext {
        &self.context
    }

    fn on_slot(
        &mut self,
        slot: usize,
        index: usize,
    ) -> Result<WorkerReply<T::Partial>, WorkerFailure> {
        let slots = self.buffer.slot_count(&self.shape);
        let Some(view) = self.buffer.slot_mut(slot, &self.shape) else {
            return Err(WorkerFailure::protocol(
                self.context.worker,
                Some(index),
                format!("slot {slot} out of range for {slots} slots"),
            ));
        };
        let Some(task) = self.task.as_mut() else {
            return Err(WorkerFailure::protocol(
                self.context.worker,
                Some(index),
                "item received after the partial was taken",
            ));
        };
        let options = &self.options;
        guarded(&self.context, Some(index), || task.map(view, index, options))?;
        Ok(WorkerReply::SlotCompleted { slot, index })
    }

    fn on_shutdown(&mut self) -> Result<Option<T::Partial>, WorkerFailure> {
        match self.task.take() {
            Some(task) => guarded(&self.context, None, || task.into_partial()),
            None => Ok(None),
        }
    }
}

struct FoldBehavior<T: FoldTask> {
    context: WorkerContext,
    task: Option<T>,
    options: T::Options,
}

impl<T: FoldTask> Behavior for FoldBehavior<T> {
    type Payload = T::Input;
    type Reply = T::Output;

    fn context(&self) -> &WorkerContext {
        &self.context
    }

    fn on_work(
        &mut self,
        index: usize,
        payload: T::Input,
    ) -> Result<WorkerReply<T::Output>, WorkerFailure> {
        let Some(task) = self.task.as_mut() else {
            return Err(WorkerFailure::protocol(
                self.context.worker,
                Some(index),
                "item received after the fold finished",
            ));
        };
        let options = &self.options;
        guarded(&self.context, Some(index), || task.fold(payload, index, options))?;
        Ok(WorkerReply::Folded { index })
    }

    fn on_shutdown(&mut self) -> Result<Option<T::Output>, WorkerFailure> {
        let options = &self.options;
        match self.task.take() {
            Some(task) => guarded(&self.context, None, || task.finish(options)).map(Some),
            None => Ok(None),
        }
    }
}

/// Runs a [`MapTask`] worker for `spec` over `transport`
pub fn serve_map<T: MapTask, X: WorkerTransport>(
    spec: &JobSpec,
    transport: &mut X,
) -> Result<WorkerExit, TransportError> {
    let context = spec.context;
    let worker_loop = WorkerLoop::new(context, transport);
    let options: T::Options = match options(spec) {
        Ok(options) => options,
        Err(failure) => return worker_loop.reject(failure),
    };
    let task = match init(&context, || T::init(&context, &options)) {
        Ok(task) => task,
        Err(failure) => return worker_loop.reject(failure),
    };
    worker_loop.run(&mut MapBehavior {
        context,
        task,
        options,
    })
}

/// Runs a [`SlotTask`] worker for `spec` over `transport`
pub fn serve_slot<T: SlotTask, X: WorkerTransport>(
    spec: &JobSpec,
    transport: &mut X,
) -> Result<WorkerExit, TransportError> {
    let context = spec.context;
    let worker_loop = WorkerLoop::new(context, transport);
    let setup = options::<T::Options>(spec).and_then(|options| {
        let (buffer, shape) = shared_buffer::<T::Elem>(spec)?;
        let task = init(&context, || T::init(&context, &options))?;
        Ok(SlotBehavior {
            context,
            task,
            options,
            buffer,
            shape,
        })
    });
    match setup {
        Ok(mut behavior) => worker_loop.run(&mut behavior),
        Err(failure) => worker_loop.reject(failure),
    }
}

/// Runs a [`ReduceTask`] worker for `spec` over `transport`
pub fn serve_reduce<T: ReduceTask, X: WorkerTransport>(
    spec: &JobSpec,
    transport: &mut X,
) -> Result<WorkerExit, TransportError> {
    let context = spec.context;
    let worker_loop = WorkerLoop::new(context, transport);
    let setup = options::<T::Options>(spec).and_then(|options| {
        let (buffer, shape) = shared_buffer::<T::Elem>(spec)?;
        let task = init(&context, || T::init(&context, &options))?;
        Ok(ReduceBehavior {
            context,
            task: Some(task),
            options,
            buffer,
            shape,
        })
    });
    match setup {
        Ok(mut behavior) => worker_loop.run(&mut behavior),
        Err(failure) => worker_loop.reject(failure),
    }
}

/// Runs a [`FoldTask`] worker for `spec` over `transport`
pub fn serve_fold<T: FoldTask, X: WorkerTransport>(
    spec: &JobSpec,
    transport: &mut X,
) -> Result<WorkerExit, TransportError> {
    let context = spec.context;
    let worker_loop = WorkerLoop::new(context, transport);
    let setup = options::<T::Options>(spec).and_then(|options| {
        let task = init(&context, || T::init(&context, &options))?;
        Ok(FoldBehavior {
            context,
            task: Some(task),
            options,
        })
    });
    match setup {
        Ok(mut behavior) => worker_loop.run(&mut behavior),
        Err(failure) => worker_loop.reject(failure),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_buffer::SlotMut;
    use crate::worker_io::{decode_frames, encode_frames, FramedIo};
    use crate::worker_message::TaskKind;
    use anyhow::bail;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    #[derive(Clone, Default, Serialize, Deserialize)]
    struct FailOn {
        fail_on: Option<usize>,
        fail_init: bool,
    }

    struct Square;

    impl MapTask for Square {
        const NAME: &'static str = "square";
        type Input = i64;
        type Output = i64;
        type Options = FailOn;

        fn init(_: &WorkerContext, options: &FailOn) -> anyhow::Result<Self> {
            if options.fail_init {
                bail!("no license for square");
            }
            Ok(Square)
        }

        fn process(&mut self, input: i64, index: usize, options: &FailOn) -> anyhow::Result<i64> {
            if options.fail_on == Some(index) {
                bail!("cannot square item {index}");
            }
            Ok(input * input)
        }
    }

    struct Negate;

    impl SlotTask for Negate {
        const NAME: &'static str = "negate";
        type Elem = f64;
        type Options = FailOn;

        fn init(_: &WorkerContext, _: &FailOn) -> anyhow::Result<Self> {
            Ok(Negate)
        }

        fn process(&mut self, mut slot: SlotMut<'_, f64>, _: usize, _: &FailOn) -> anyhow::Result<()> {
            slot.iter_mut().for_each(|v| *v = -*v);
            Ok(())
        }
    }

    struct Total(f64);

    impl ReduceTask for Total {
        const NAME: &'static str = "total";
        type Elem = f64;
        type Options = FailOn;
        type Partial = f64;

        fn init(_: &WorkerContext, _: &FailOn) -> anyhow::Result<Self> {
            Ok(Total(0.0))
        }

        fn map(&mut self, slot: SlotMut<'_, f64>, _: usize, _: &FailOn) -> anyhow::Result<()> {
            self.0 += slot.iter().sum::<f64>();
            Ok(())
        }

        fn into_partial(self) -> anyhow::Result<Option<f64>> {
            Ok(Some(self.0))
        }

        fn combine(acc: f64, next: f64) -> anyhow::Result<f64> {
            Ok(acc + next)
        }
    }

    struct Count(i64);

    impl FoldTask for Count {
        const NAME: &'static str = "count";
        type Input = i64;
        type Output = i64;
        type Options = FailOn;

        fn init(_: &WorkerContext, _: &FailOn) -> anyhow::Result<Self> {
            Ok(Count(0))
        }

        fn fold(&mut self, input: i64, index: usize, options: &FailOn) -> anyhow::Result<()> {
            if options.fail_on == Some(index) {
                bail!("cannot count item {index}");
            }
            self.0 += input;
            Ok(())
        }

        fn finish(self, _: &FailOn) -> anyhow::Result<i64> {
            Ok(self.0)
        }
    }

    fn spec(kind: TaskKind, options: FailOn) -> JobSpec {
        JobSpec {
            task: "test".to_string(),
            kind,
            context: WorkerContext {
                worker: 1,
                worker_count: 2,
            },
            options: bincode::serialize(&options).unwrap(),
            buffer: None,
            shape: None,
        }
    }

    fn run_map(
        commands: &[WorkerCommand<i64>],
        options: FailOn,
    ) -> (WorkerExit, Vec<WorkerReply<i64>>) {
        let input = encode_frames(commands).unwrap();
        let mut output = Vec::new();
        let mut transport = FramedIo::new(&input[..], &mut output);
        let exit = serve_map::<Square, _>(&spec(TaskKind::Map, options), &mut transport).unwrap();
        drop(transport);
        (exit, decode_frames(&output).unwrap())
    }

    fn ready() -> WorkerReply<i64> {
        WorkerReply::Ready {
            worker: 1,
            pid: std::process::id(),
        }
    }

    #[test]
    fn test_liveness_map_worker_answers_every_item_then_acknowledges() {
        let (exit, replies) = run_map(
            &[
                WorkerCommand::Work { index: 0, payload: 3 },
                WorkerCommand::Work { index: 1, payload: -4 },
                WorkerCommand::Shutdown,
            ],
            FailOn::default(),
        );
        assert_eq!(exit, WorkerExit::Acknowledged);
        assert_eq!(
            replies,
            vec![
                ready(),
                WorkerReply::Completed { index: 0, payload: 9 },
                WorkerReply::Completed { index: 1, payload: 16 },
                WorkerReply::Done { worker: 1 },
            ]
        );
    }

    #[test]
    fn test_safety_failed_worker_drains_until_shutdown() {
        let (exit, replies) = run_map(
            &[
                WorkerCommand::Work { index: 0, payload: 2 },
                WorkerCommand::Work { index: 1, payload: 2 },
                WorkerCommand::Work { index: 2, payload: 2 },
                WorkerCommand::Shutdown,
            ],
            FailOn {
                fail_on: Some(1),
                ..FailOn::default()
            },
        );
        assert_eq!(exit, WorkerExit::Acknowledged);
        assert_eq!(
            replies,
            vec![
                ready(),
                WorkerReply::Completed { index: 0, payload: 4 },
                WorkerReply::Failed(WorkerFailure::computation(
                    1,
                    Some(1),
                    "cannot square item 1"
                )),
                WorkerReply::Done { worker: 1 },
            ]
        );
    }

    #[test]
    fn test_closed_input_without_shutdown_is_not_acknowledged() {
        let (exit, replies) = run_map(
            &[WorkerCommand::Work { index: 0, payload: 5 }],
            FailOn::default(),
        );
        assert_eq!(exit, WorkerExit::Disconnected);
        assert_eq!(
            replies,
            vec![ready(), WorkerReply::Completed { index: 0, payload: 25 }]
        );
    }

    #[test]
    fn test_init_failure_is_reported_as_startup() {
        let (exit, replies) = run_map(
            &[WorkerCommand::Shutdown],
            FailOn {
                fail_init: true,
                ..FailOn::default()
            },
        );
        assert_eq!(exit, WorkerExit::Rejected);
        assert_eq!(
            replies,
            vec![WorkerReply::Failed(WorkerFailure::startup(
                1,
                "no license for square"
            ))]
        );
    }

    #[test]
    fn test_slot_worker_computes_in_place() {
        let shape = Shape::from([3]);
        let mut buffer = SharedBuffer::<f64>::allocate(6).unwrap();
        let whole = Shape::from([6]);
        buffer
            .slot_mut(0, &whole)
            .unwrap()
            .copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let mut job = spec(TaskKind::Slot, FailOn::default());
        job.buffer = Some(buffer.handle().clone());
        job.shape = Some(shape);

        let input = encode_frames::<WorkerCommand<()>>(&[
            WorkerCommand::Slot { slot: 1, index: 7 },
            WorkerCommand::Shutdown,
        ])
        .unwrap();
        let mut output = Vec::new();
        let mut transport = FramedIo::new(&input[..], &mut output);
        let exit = serve_slot::<Negate, _>(&job, &mut transport).unwrap();
        drop(transport);

        assert_eq!(exit, WorkerExit::Acknowledged);
        assert_eq!(
            buffer.slot(0, &whole).unwrap().as_slice(),
            &[1.0, 2.0, 3.0, -4.0, -5.0, -6.0]
        );
        let replies: Vec<WorkerReply<()>> = decode_frames(&output).unwrap();
        assert_eq!(replies[1], WorkerReply::SlotCompleted { slot: 1, index: 7 });
        assert_eq!(replies[2], WorkerReply::Done { worker: 1 });
    }

    #[test]
    fn test_safety_malformed_slot_aborts_immediately() {
        let shape = Shape::from([2]);
        let buffer = SharedBuffer::<f64>::allocate(4).unwrap();
        let mut job = spec(TaskKind::Slot, FailOn::default());
        job.buffer = Some(buffer.handle().clone());
        job.shape = Some(shape);

        let input = encode_frames::<WorkerCommand<()>>(&[
            WorkerCommand::Slot { slot: 2, index: 0 },
            WorkerCommand::Shutdown,
        ])
        .unwrap();
        let mut output = Vec::new();
        let mut transport = FramedIo::new(&input[..], &mut output);
        let exit = serve_slot::<Negate, _>(&job, &mut transport).unwrap();
        drop(transport);

        assert_eq!(exit, WorkerExit::Aborted);
        let replies: Vec<WorkerReply<()>> = decode_frames(&output).unwrap();
        assert_eq!(replies.len(), 2);
        assert!(matches!(
            &replies[1],
            WorkerReply::Failed(WorkerFailure { kind: FailureKind::Protocol, .. })
        ));
    }

    #[test]
    fn test_slot_worker_without_buffer_is_rejected() {
        let input = encode_frames::<WorkerCommand<()>>(&[WorkerCommand::Shutdown]).unwrap();
        let mut output = Vec::new();
        let mut transport = FramedIo::new(&input[..], &mut output);
        let exit = serve_slot::<Negate, _>(&spec(TaskKind::Slot, FailOn::default()), &mut transport)
            .unwrap();
        assert_eq!(exit, WorkerExit::Rejected);
    }

    #[test]
    fn test_reduce_worker_sends_partial_before_done() {
        let shape = Shape::from([2]);
        let mut buffer = SharedBuffer::<f64>::allocate(4).unwrap();
        buffer
            .slot_mut(0, &Shape::from([4]))
            .unwrap()
            .copy_from_slice(&[1.0, 2.0, 10.0, 20.0]);
        let mut job = spec(TaskKind::Reduce, FailOn::default());
        job.buffer = Some(buffer.handle().clone());
        job.shape = Some(shape);

        let input = encode_frames::<WorkerCommand<()>>(&[
            WorkerCommand::Slot { slot: 0, index: 0 },
            WorkerCommand::Slot { slot: 1, index: 1 },
            WorkerCommand::Shutdown,
        ])
        .unwrap();
        let mut output = Vec::new();
        let mut transport = FramedIo::new(&input[..], &mut output);
        let exit = serve_reduce::<Total, _>(&job, &mut transport).unwrap();
        drop(transport);

        assert_eq!(exit, WorkerExit::Acknowledged);
        let replies: Vec<WorkerReply<f64>> = decode_frames(&output).unwrap();
        assert_eq!(
            &replies[1..],
            &[
                WorkerReply::SlotCompleted { slot: 0, index: 0 },
                WorkerReply::SlotCompleted { slot: 1, index: 1 },
                WorkerReply::Partial {
                    worker: 1,
                    payload: 33.0
                },
                WorkerReply::Done { worker: 1 },
            ]
        );
    }

    #[test]
    fn test_work_command_to_slot_worker_is_protocol_failure() {
        let shape = Shape::from([1]);
        let buffer = SharedBuffer::<f64>::allocate(1).unwrap();
        let mut job = spec(TaskKind::Slot, FailOn::default());
        job.buffer = Some(buffer.handle().clone());
        job.shape = Some(shape);

        let input = encode_frames(&[WorkerCommand::Work {
            index: 0,
            payload: 1.5f64,
        }])
        .unwrap();
        let mut output = Vec::new();
        let mut transport = FramedIo::new(&input[..], &mut output);
        let exit = serve_slot::<Negate, _>(&job, &mut transport).unwrap();
        assert_eq!(exit, WorkerExit::Aborted);
    }

    fn run_fold(
        commands: &[WorkerCommand<i64>],
        options: FailOn,
    ) -> (WorkerExit, Vec<WorkerReply<i64>>) {
        let input = encode_frames(commands).unwrap();
        let mut output = Vec::new();
        let mut transport = FramedIo::new(&input[..], &mut output);
        let exit = serve_fold::<Count, _>(&spec(TaskKind::Fold, options), &mut transport).unwrap();
        drop(transport);
        (exit, decode_frames(&output).unwrap())
    }

    #[test]
    fn test_fold_worker_acks_items_and_sends_total_at_shutdown() {
        let (exit, replies) = run_fold(
            &[
                WorkerCommand::Work { index: 0, payload: 5 },
                WorkerCommand::Work { index: 3, payload: 7 },
                WorkerCommand::Shutdown,
            ],
            FailOn::default(),
        );
        assert_eq!(exit, WorkerExit::Acknowledged);
        assert_eq!(
            replies,
            vec![
                ready(),
                WorkerReply::Folded { index: 0 },
                WorkerReply::Folded { index: 3 },
                WorkerReply::Partial {
                    worker: 1,
                    payload: 12
                },
                WorkerReply::Done { worker: 1 },
            ]
        );
    }

    #[test]
    fn test_idle_fold_worker_still_sends_its_value() {
        let (_, replies) = run_fold(&[WorkerCommand::Shutdown], FailOn::default());
        assert_eq!(
            &replies[1..],
            &[
                WorkerReply::Partial {
                    worker: 1,
                    payload: 0
                },
                WorkerReply::Done { worker: 1 },
            ]
        );
    }

    #[test]
    fn test_safety_failed_fold_worker_sends_no_value() {
        let (exit, replies) = run_fold(
            &[
                WorkerCommand::Work { index: 0, payload: 1 },
                WorkerCommand::Work { index: 1, payload: 1 },
                WorkerCommand::Shutdown,
            ],
            FailOn {
                fail_on: Some(0),
                ..FailOn::default()
            },
        );
        assert_eq!(exit, WorkerExit::Acknowledged);
        assert_eq!(
            &replies[1..],
            &[
                WorkerReply::Failed(WorkerFailure::computation(1, Some(0), "cannot count item 0")),
                WorkerReply::Done { worker: 1 },
            ]
        );
    }
}
