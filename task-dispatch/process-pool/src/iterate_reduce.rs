// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Channel map folded into one value per worker.
//!
//! Items travel as `Work` commands like in [`crate::process_mp`], but a worker
//! only acknowledges each one with `Folded` and keeps the result in its own
//! state. At shutdown every worker sends the value of `finish` as a `Partial`,
//! and the caller gets those values back ordered by worker id.

use crate::config::PoolConfig;
use crate::worker_pool::{PoolStats, WorkerPool};
use task_dispatch_core::{
    guarded, CoordinatorState, DispatchError, FoldTask, JobSpec, ProtocolError, TaskKind,
    WorkerCommand, WorkerContext, WorkerReply,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

type Result<T> = std::result::Result<T, DispatchError>;

enum FoldEngine<T> {
    Serial(T),
    Pool(WorkerPool),
    Done,
}

/// A started fold; [`IterateReduceJob::run`] consumes the items
pub struct IterateReduceJob<T: FoldTask, I> {
    items: I,
    options: T::Options,
    engine: FoldEngine<T>,
    stats: PoolStats,
}

/// Folds `items` with `T` on `config.worker_count` processes.
///
/// Returns one value per worker, ordered by worker id. Below two workers the fold
/// runs in the caller's process and the result holds a single value, even for
/// empty input.
pub async fn iterate_reduce<T, I>(
    items: I,
    options: T::Options,
    config: &PoolConfig,
) -> Result<Vec<T::Output>>
where
    T: FoldTask,
    I: IntoIterator<Item = T::Input>,
{
    let mut job = IterateReduceJob::<T, I::IntoIter>::start(items, options, config).await?;
    job.run().await
}

impl<T, I> IterateReduceJob<T, I>
where
    T: FoldTask,
    I: Iterator<Item = T::Input>,
{
    /// Spawns the pool, or prepares an in-process fold below two workers
    pub async fn start(
        items: impl IntoIterator<IntoIter = I>,
        options: T::Options,
        config: &PoolConfig,
    ) -> Result<Self> {
        let items = items.into_iter();
        let workers = config.effective_workers(items.size_hint().1);

        let engine = if workers < 2 {
            debug!("running fold in the calling process");
            let context = WorkerContext::serial();
            let task = guarded(&context, None, || T::init(&context, &options)).map_err(|f| {
                DispatchError::PoolStartup {
                    worker: 0,
                    reason: f.message,
                }
            })?;
            FoldEngine::Serial(task)
        } else {
            let config = PoolConfig {
                worker_count: workers,
                ..config.clone()
            };
            let job = JobSpec {
                task: T::NAME.to_string(),
                kind: TaskKind::Fold,
                context: WorkerContext {
                    worker: 0,
                    worker_count: workers,
                },
                options: bincode::serialize(&options)?,
                buffer: None,
                shape: None,
            };
            FoldEngine::Pool(WorkerPool::start(&config, job).await?)
        };

        Ok(Self {
            items,
            options,
            engine,
            stats: PoolStats::default(),
        })
    }

    pub fn stats(&self) -> PoolStats {
        match &self.engine {
            FoldEngine::Pool(pool) => pool.stats().clone(),
            _ => self.stats.clone(),
        }
    }

    /// Folds every item and returns the per-worker values.
    ///
    /// Runs once; later calls return an empty vector.
    pub async fn run(&mut self) -> Result<Vec<T::Output>> {
        match std::mem::replace(&mut self.engine, FoldEngine::Done) {
            FoldEngine::Serial(task) => self.run_serial(task).map(|output| vec![output]),
            FoldEngine::Pool(mut pool) => {
                let folded = self.run_pool(&mut pool).await;
                self.stats = pool.stats().clone();
                folded
            }
            FoldEngine::Done => Ok(Vec::new()),
        }
    }

    fn run_serial(&mut self, mut task: T) -> Result<T::Output> {
        let context = WorkerContext::serial();
        let options = &self.options;
        for (index, item) in self.items.by_ref().enumerate() {
            guarded(&context, Some(index), || task.fold(item, index, options))
                .map_err(DispatchError::Worker)?;
            self.stats.completed += 1;
        }
        guarded(&context, None, || task.finish(options)).map_err(DispatchError::Worker)
    }

    async fn run_pool(&mut self, pool: &mut WorkerPool) -> Result<Vec<T::Output>> {
        self.fold_all(pool).await?;

        let (partials, mut inbox) = mpsc::channel::<(usize, T::Output)>(pool.worker_count());
        let shutdown = pool.shutdown(Some(&partials)).await;
        drop(partials);

        let mut outputs = Vec::with_capacity(pool.worker_count());
        while let Some(partial) = inbox.recv().await {
            outputs.push(partial);
        }

        if let Some(failure) = shutdown? {
            return Err(DispatchError::from_failure(failure));
        }
        outputs.sort_by_key(|(worker, _)| *worker);
        info!(
            items = pool.stats().completed,
            values = outputs.len(),
            "fold finished"
        );
        Ok(outputs.into_iter().map(|(_, output)| output).collect())
    }

    async fn fold_all(&mut self, pool: &mut WorkerPool) -> Result<()> {
        let mut next_index = 0;
        let mut outstanding = 0usize;
        let mut exhausted = false;
        loop {
            while !exhausted {
                let Some(worker) = pool.available_worker() else {
                    break;
                };
                let Some(payload) = self.items.next() else {
                    exhausted = true;
                    break;
                };
                let index = next_index;
                next_index += 1;
                pool.dispatch(worker, &WorkerCommand::Work { index, payload })
                    .await?;
                outstanding += 1;
            }

            if outstanding == 0 {
                return Ok(());
            }

            match pool.recv::<T::Output>().await? {
                (_, WorkerReply::Folded { index }) if index < next_index => outstanding -= 1,
                (_, WorkerReply::Folded { index }) => {
                    pool.abort().await;
                    return Err(ProtocolError::UnknownIndex {
                        index,
                        total: next_index,
                    }
                    .into());
                }
                (_, WorkerReply::Failed(failure)) => {
                    warn!(%failure, "item failed, shutting the pool down");
                    pool.transition(CoordinatorState::Propagating);
                    match pool.close::<T::Output>().await {
                        Ok(Some(later)) => debug!(%later, "further failure while draining"),
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "pool teardown after failure was not clean"),
                    }
                    return Err(DispatchError::from_failure(failure));
                }
                (worker, other) => {
                    pool.abort().await;
                    return Err(ProtocolError::UnexpectedReply {
                        worker,
                        reply: other.name(),
                    }
                    .into());
                }
            }
        }
    }
}
