// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::config::PoolConfig;
use crate::worker_pool::{PoolStats, WorkerPool};
use futures::Stream;
use task_dispatch_core::{
    guarded, CoordinatorState, DispatchError, JobSpec, MapTask, ProtocolError, TaskKind,
    WorkerCommand, WorkerContext, WorkerReply,
};
use tracing::{debug, warn};

type Result<T> = std::result::Result<T, DispatchError>;

enum Engine<T> {
    Pending,
    Serial(T),
    Pool(WorkerPool),
    Done,
}

/// Lazy sequence of `(index, result)` pairs produced by [`process_mp`].
///
/// Results arrive in completion order when workers run, in input order otherwise.
/// The pool is spawned on the first call to [`MapStream::next`], and items are
/// pulled from the input only when a worker has room for them. Dropping the
/// stream kills any worker still running.
pub struct MapStream<T: MapTask, I> {
    config: PoolConfig,
    options: T::Options,
    items: I,
    exhausted: bool,
    /// One flag per dispatched item, set when its result arrives
    seen: Vec<bool>,
    received: usize,
    engine: Engine<T>,
    stats: PoolStats,
}

/// Maps `T` over `items` on `config.worker_count` processes.
///
/// The worker count is clamped to the upper bound of the iterator's size hint.
/// Below two workers the map runs in the caller's process and spawns nothing.
pub fn process_mp<T, I>(items: I, options: T::Options, config: &PoolConfig) -> MapStream<T, I::IntoIter>
where
    T: MapTask,
    I: IntoIterator<Item = T::Input>,
{
    MapStream {
        config: config.clone(),
        options,
        items: items.into_iter(),
        exhausted: false,
        seen: Vec::new(),
        received: 0,
        engine: Engine::Pending,
        stats: PoolStats::default(),
    }
}

/// Streams `items` through the pool with at most `queue_limit` unanswered items
/// per worker.
///
/// Suited to large or unbounded inputs: memory held by the coordinator is bounded
/// by `queue_limit * worker_count` items no matter how long `items` is.
pub fn for_process_mp<T, I>(
    items: I,
    options: T::Options,
    queue_limit: usize,
    config: &PoolConfig,
) -> MapStream<T, I::IntoIter>
where
    T: MapTask,
    I: IntoIterator<Item = T::Input>,
{
    let config = PoolConfig {
        queue_capacity: queue_limit,
        ..config.clone()
    };
    process_mp(items, options, &config)
}

impl<T, I> MapStream<T, I>
where
    T: MapTask,
    I: Iterator<Item = T::Input>,
{
    pub fn stats(&self) -> PoolStats {
        match &self.engine {
            Engine::Pool(pool) => pool.stats().clone(),
            _ => self.stats.clone(),
        }
    }

    pub async fn next(&mut self) -> Option<Result<(usize, T::Output)>> {
        loop {
            match &mut self.engine {
                Engine::Pending => {
                    if let Err(e) = self.start().await {
                        self.engine = Engine::Done;
                        return Some(Err(e));
                    }
                }
                Engine::Serial(task) => {
                    let Some(input) = self.items.next() else {
                        self.engine = Engine::Done;
                        return None;
                    };
                    let index = self.seen.len();
                    self.seen.push(true);
                    let options = &self.options;
                    let context = WorkerContext::serial();
                    return match guarded(&context, Some(index), || {
                        task.process(input, index, options)
                    }) {
                        Ok(output) => {
                            self.received += 1;
                            self.stats.completed += 1;
                            Some(Ok((index, output)))
                        }
                        Err(failure) => {
                            self.engine = Engine::Done;
                            Some(Err(DispatchError::Worker(failure)))
                        }
                    };
                }
                Engine::Pool(_) => return self.next_from_pool().await,
                Engine::Done => return None,
            }
        }
    }

    async fn start(&mut self) -> Result<()> {
        let upper = self.items.size_hint().1;
        if upper == Some(0) {
            self.engine = Engine::Done;
            return Ok(());
        }
        let workers = self.config.effective_workers(upper);
        if workers < 2 {
            debug!("running map in the calling process");
            let context = WorkerContext::serial();
            let options = &self.options;
            let task = guarded(&context, None, || T::init(&context, options)).map_err(|f| {
                DispatchError::PoolStartup {
                    worker: 0,
                    reason: f.message,
                }
            })?;
            self.engine = Engine::Serial(task);
            return Ok(());
        }

        let config = PoolConfig {
            worker_count: workers,
            ..self.config.clone()
        };
        let job = JobSpec {
            task: T::NAME.to_string(),
            kind: TaskKind::Map,
            context: WorkerContext {
                worker: 0,
                worker_count: workers,
            },
            options: bincode::serialize(&self.options)?,
            buffer: None,
            shape: None,
        };
        self.engine = Engine::Pool(WorkerPool::start(&config, job).await?);
        Ok(())
    }

    async fn next_from_pool(&mut self) -> Option<Result<(usize, T::Output)>> {
        let Engine::Pool(mut pool) = std::mem::replace(&mut self.engine, Engine::Done) else {
            return None;
        };

        match self.advance(&mut pool).await {
            Ok(Some(item)) => {
                self.engine = Engine::Pool(pool);
                Some(Ok(item))
            }
            Ok(None) => {
                let outcome = pool.close::<T::Output>().await;
                self.stats = pool.stats().clone();
                match outcome {
                    Ok(None) => None,
                    Ok(Some(failure)) => Some(Err(DispatchError::from_failure(failure))),
                    Err(e) => Some(Err(e)),
                }
            }
            Err(e) => {
                self.exhausted = true;
                self.stats = pool.stats().clone();
                Some(Err(e))
            }
        }
    }

    /// Pulls items for every worker with room, then waits for the next result.
    /// Returns `None` once the input is exhausted and every item was answered.
    async fn advance(&mut self, pool: &mut WorkerPool) -> Result<Option<(usize, T::Output)>> {
        while !self.exhausted {
            let Some(worker) = pool.available_worker() else {
                break;
            };
            let Some(payload) = self.items.next() else {
                self.exhausted = true;
                break;
            };
            let index = self.seen.len();
            self.seen.push(false);
            pool.dispatch(worker, &WorkerCommand::Work { index, payload })
                .await?;
        }

        if self.received == self.seen.len() {
            return Ok(None);
        }

        match pool.recv::<T::Output>().await? {
            (_, WorkerReply::Completed { index, payload }) => {
                let total = self.seen.len();
                let Some(seen) = self.seen.get_mut(index) else {
                    pool.abort().await;
                    return Err(ProtocolError::UnknownIndex { index, total }.into());
                };
                if *seen {
                    pool.abort().await;
                    return Err(ProtocolError::DuplicateCompletion { index }.into());
                }
                *seen = true;
                self.received += 1;
                Ok(Some((index, payload)))
            }
            (_, WorkerReply::Failed(failure)) => {
                warn!(%failure, "item failed, shutting the pool down");
                pool.transition(CoordinatorState::Propagating);
                match pool.close::<T::Output>().await {
                    Ok(Some(later)) => debug!(%later, "further failure while draining"),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "pool teardown after failure was not clean"),
                }
                Err(DispatchError::from_failure(failure))
            }
            (worker, other) => {
                pool.abort().await;
                Err(ProtocolError::UnexpectedReply {
                    worker,
                    reply: other.name(),
                }
                .into())
            }
        }
    }

    /// Adapts the stream to a [`futures::Stream`]
    pub fn into_stream(self) -> impl Stream<Item = Result<(usize, T::Output)>> {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|item| (item, stream))
        })
    }

    /// Drains the stream and returns the results in input order
    pub async fn collect_ordered(mut self) -> Result<Vec<T::Output>> {
        let mut slots: Vec<Option<T::Output>> = Vec::new();
        while let Some(item) = self.next().await {
            let (index, output) = item?;
            if index >= slots.len() {
                slots.resize_with(index + 1, || None);
            }
            slots[index] = Some(output);
        }
        Ok(slots.into_iter().flatten().collect())
    }
}
