// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Shared-buffer map followed by a reduction.
//!
//! Workers fold every item they process into private state and send it as a
//! `Partial` when they shut down. A single reducer task on the coordinator
//! receives the partials over a channel and combines them, so no worker ever
//! touches another worker's state.

use crate::config::PoolConfig;
use crate::slot_feeder::SlotFeeder;
use crate::worker_pool::PoolStats;
use task_dispatch_core::{
    guarded, DispatchError, ReduceTask, Shape, SlotEvent, SlotMut, TaskKind, WorkerContext,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

type Result<T> = std::result::Result<T, DispatchError>;

enum ReduceEngine<T: ReduceTask> {
    Serial { task: T, scratch: Vec<T::Elem> },
    Pool(SlotFeeder<T::Elem, T::Partial>),
    Done,
}

/// A started map/reduce run; [`MapReduceJob::run`] consumes the items
pub struct MapReduceJob<T: ReduceTask, I> {
    items: I,
    shape: Shape,
    options: T::Options,
    engine: ReduceEngine<T>,
    stats: PoolStats,
    history: Vec<SlotEvent>,
}

/// Maps `T` over `items` through a shared buffer and reduces the partials.
///
/// Returns `None` when no worker produced a partial, e.g. for empty input.
pub async fn map_reduce<T, I>(
    items: I,
    shape: impl Into<Shape>,
    options: T::Options,
    config: &PoolConfig,
) -> Result<Option<T::Partial>>
where
    T: ReduceTask,
    I: IntoIterator,
    I::Item: AsRef<[T::Elem]>,
{
    let mut job = MapReduceJob::<T, I::IntoIter>::start(items, shape, options, config).await?;
    job.run().await
}

impl<T, I> MapReduceJob<T, I>
where
    T: ReduceTask,
    I: Iterator,
    I::Item: AsRef<[T::Elem]>,
{
    /// Spawns the pool, or prepares an in-process run below two workers
    pub async fn start(
        items: impl IntoIterator<IntoIter = I>,
        shape: impl Into<Shape>,
        options: T::Options,
        config: &PoolConfig,
    ) -> Result<Self> {
        let items = items.into_iter();
        let shape = shape.into();
        let workers = config.effective_workers(items.size_hint().1);

        let engine = if workers < 2 {
            debug!("running map/reduce in the calling process");
            let context = WorkerContext::serial();
            let task = guarded(&context, None, || T::init(&context, &options)).map_err(|f| {
                DispatchError::PoolStartup {
                    worker: 0,
                    reason: f.message,
                }
            })?;
            ReduceEngine::Serial {
                task,
                scratch: vec![bytemuck::Zeroable::zeroed(); shape.len()],
            }
        } else {
            let config = PoolConfig {
                worker_count: workers,
                ..config.clone()
            };
            let feeder = SlotFeeder::start(
                T::NAME,
                TaskKind::Reduce,
                bincode::serialize(&options)?,
                shape.clone(),
                &config,
            )
            .await?;
            ReduceEngine::Pool(feeder)
        };

        Ok(Self {
            items,
            shape,
            options,
            engine,
            stats: PoolStats::default(),
            history: Vec::new(),
        })
    }

    pub fn stats(&self) -> PoolStats {
        match &self.engine {
            ReduceEngine::Pool(feeder) => feeder.pool.stats().clone(),
            _ => self.stats.clone(),
        }
    }

    pub fn slot_history(&self) -> &[SlotEvent] {
        match &self.engine {
            ReduceEngine::Pool(feeder) => feeder.ledger.history(),
            _ => &self.history,
        }
    }

    /// Processes every item and returns the combined partial.
    ///
    /// Runs once; later calls return `Ok(None)`.
    pub async fn run(&mut self) -> Result<Option<T::Partial>> {
        match std::mem::replace(&mut self.engine, ReduceEngine::Done) {
            ReduceEngine::Serial { task, scratch } => self.run_serial(task, scratch),
            ReduceEngine::Pool(mut feeder) => {
                let reduced = self.run_pool(&mut feeder).await;
                self.stats = feeder.pool.stats().clone();
                self.history = feeder.ledger.history().to_vec();
                reduced
            }
            ReduceEngine::Done => Ok(None),
        }
    }

    fn run_serial(&mut self, mut task: T, mut scratch: Vec<T::Elem>) -> Result<Option<T::Partial>> {
        let context = WorkerContext::serial();
        for (index, item) in self.items.by_ref().enumerate() {
            let item = item.as_ref();
            if item.len() != scratch.len() {
                return Err(DispatchError::ItemShape {
                    index,
                    expected: scratch.len(),
                    actual: item.len(),
                });
            }
            scratch.copy_from_slice(item);
            let view = SlotMut::new(&mut scratch, &self.shape);
            let options = &self.options;
            guarded(&context, Some(index), || task.map(view, index, options))
                .map_err(DispatchError::Worker)?;
            self.stats.completed += 1;
        }
        guarded(&context, None, || task.into_partial()).map_err(DispatchError::Worker)
    }

    async fn run_pool(&mut self, feeder: &mut SlotFeeder<T::Elem, T::Partial>) -> Result<Option<T::Partial>> {
        let (partials, mut inbox) = mpsc::channel::<(usize, T::Partial)>(feeder.pool.worker_count());
        let reducer = tokio::spawn(async move {
            let mut acc: Option<T::Partial> = None;
            while let Some((worker, partial)) = inbox.recv().await {
                debug!(worker, "combining partial");
                acc = Some(match acc.take() {
                    None => partial,
                    Some(prev) => T::combine(prev, partial)
                        .map_err(|e| DispatchError::Reduce(format!("{e:#}")))?,
                });
            }
            Ok::<_, DispatchError>(acc)
        });

        let mapped = self.map_all(feeder).await;
        let shutdown = match mapped {
            Ok(()) => feeder.pool.shutdown(Some(&partials)).await,
            Err(e) => Err(e),
        };
        drop(partials);

        let reduced = match reducer.await {
            Ok(reduced) => reduced,
            Err(e) => Err(DispatchError::Reduce(format!("reducer task failed: {e}"))),
        };

        match shutdown? {
            Some(failure) => Err(DispatchError::from_failure(failure)),
            None => {
                info!(items = feeder.pool.stats().completed, "map/reduce finished");
                reduced
            }
        }
    }

    async fn map_all(&mut self, feeder: &mut SlotFeeder<T::Elem, T::Partial>) -> Result<()> {
        loop {
            feeder.fill(&mut self.items).await?;
            match feeder.next_completion().await? {
                // The result stays in the worker's partial, so the slot is free at once
                Some((slot, _)) => {
                    feeder.release(slot).await?;
                }
                None => return Ok(()),
            }
        }
    }
}
