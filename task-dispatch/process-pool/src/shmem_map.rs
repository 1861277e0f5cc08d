// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::config::PoolConfig;
use crate::slot_feeder::SlotFeeder;
use crate::worker_pool::PoolStats;
use task_dispatch_core::{
    guarded, DispatchError, ProtocolError, Shape, SlotEvent, SlotMut, SlotRef, SlotTask,
    TaskKind, WorkerContext,
};
use tracing::debug;

type Result<T> = std::result::Result<T, DispatchError>;

enum SlotEngine<T: SlotTask> {
    Pending,
    Serial { task: T, scratch: Vec<T::Elem> },
    Pool(SlotFeeder<T::Elem>),
    Done,
}

/// Lazy sequence of `(index, slot view)` pairs produced by [`for_process_mp_shmem`].
///
/// The view borrows the stream: the slot it shows is handed back to the pool on the
/// following call to [`SlotStream::next`], and only then may it be overwritten.
pub struct SlotStream<T: SlotTask, I: Iterator> {
    items: I,
    shape: Shape,
    options: T::Options,
    config: PoolConfig,
    engine: SlotEngine<T>,
    next_index: usize,
    yielded: Option<usize>,
    stats: PoolStats,
    history: Vec<SlotEvent>,
}

/// Runs `T` in place on every item, each copied into a slot of a shared buffer.
///
/// The buffer holds one slot of `shape` per worker. Items are pulled from `items`
/// only when a slot frees up. Below two workers the items are processed in the
/// caller's process.
pub fn for_process_mp_shmem<T, I>(
    items: I,
    shape: impl Into<Shape>,
    options: T::Options,
    config: &PoolConfig,
) -> SlotStream<T, I::IntoIter>
where
    T: SlotTask,
    I: IntoIterator,
    I::Item: AsRef<[T::Elem]>,
{
    SlotStream {
        items: items.into_iter(),
        shape: shape.into(),
        options,
        config: config.clone(),
        engine: SlotEngine::Pending,
        next_index: 0,
        yielded: None,
        stats: PoolStats::default(),
        history: Vec::new(),
    }
}

impl<T, I> SlotStream<T, I>
where
    T: SlotTask,
    I: Iterator,
    I::Item: AsRef<[T::Elem]>,
{
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn stats(&self) -> PoolStats {
        match &self.engine {
            SlotEngine::Pool(feeder) => feeder.pool.stats().clone(),
            _ => self.stats.clone(),
        }
    }

    /// Slot ownership changes so far
    pub fn slot_history(&self) -> &[SlotEvent] {
        match &self.engine {
            SlotEngine::Pool(feeder) => feeder.ledger.history(),
            _ => &self.history,
        }
    }

    pub async fn next(&mut self) -> Option<Result<(usize, SlotRef<'_, T::Elem>)>> {
        let (index, slot) = match self.step().await {
            Ok(Some(step)) => step,
            Ok(None) => return None,
            Err(e) => return Some(Err(e)),
        };
        let view = match (&self.engine, slot) {
            (SlotEngine::Serial { scratch, .. }, None) => Some(SlotRef::new(scratch, &self.shape)),
            (SlotEngine::Pool(feeder), Some(slot)) => feeder.buffer.slot(slot, &self.shape),
            _ => None,
        };
        Some(view.map(|view| (index, view)).ok_or_else(|| {
            ProtocolError::InvalidSlot {
                slot: slot.unwrap_or_default(),
                slots: self.config.worker_count,
            }
            .into()
        }))
    }

    async fn step(&mut self) -> Result<Option<(usize, Option<usize>)>> {
        loop {
            match &mut self.engine {
                SlotEngine::Pending => self.start().await?,
                SlotEngine::Serial { task, scratch } => {
                    let Some(item) = self.items.next() else {
                        self.engine = SlotEngine::Done;
                        return Ok(None);
                    };
                    let index = self.next_index;
                    self.next_index += 1;

                    let item = item.as_ref();
                    if item.len() != scratch.len() {
                        let expected = scratch.len();
                        self.engine = SlotEngine::Done;
                        return Err(DispatchError::ItemShape {
                            index,
                            expected,
                            actual: item.len(),
                        });
                    }
                    scratch.copy_from_slice(item);

                    let view = SlotMut::new(scratch, &self.shape);
                    let options = &self.options;
                    let context = WorkerContext::serial();
                    if let Err(failure) =
                        guarded(&context, Some(index), || task.process(view, index, options))
                    {
                        self.engine = SlotEngine::Done;
                        return Err(DispatchError::Worker(failure));
                    }
                    self.stats.completed += 1;
                    return Ok(Some((index, None)));
                }
                SlotEngine::Pool(_) => return self.step_pool().await,
                SlotEngine::Done => return Ok(None),
            }
        }
    }

    async fn start(&mut self) -> Result<()> {
        let workers = self.config.effective_workers(self.items.size_hint().1);
        if workers < 2 {
            debug!("running shared-buffer map in the calling process");
            let context = WorkerContext::serial();
            let options = &self.options;
            let task = guarded(&context, None, || T::init(&context, options)).map_err(|f| {
                DispatchError::PoolStartup {
                    worker: 0,
                    reason: f.message,
                }
            });
            let task = match task {
                Ok(task) => task,
                Err(e) => {
                    self.engine = SlotEngine::Done;
                    return Err(e);
                }
            };
            self.engine = SlotEngine::Serial {
                task,
                scratch: vec![bytemuck::Zeroable::zeroed(); self.shape.len()],
            };
            return Ok(());
        }

        let config = PoolConfig {
            worker_count: workers,
            ..self.config.clone()
        };
        let started = match bincode::serialize(&self.options) {
            Ok(options) => {
                SlotFeeder::start(T::NAME, TaskKind::Slot, options, self.shape.clone(), &config)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        match started {
            Ok(feeder) => {
                self.engine = SlotEngine::Pool(feeder);
                Ok(())
            }
            Err(e) => {
                self.engine = SlotEngine::Done;
                Err(e)
            }
        }
    }

    async fn step_pool(&mut self) -> Result<Option<(usize, Option<usize>)>> {
        let SlotEngine::Pool(feeder) = &mut self.engine else {
            return Ok(None);
        };

        let advanced = Self::advance(feeder, &mut self.yielded, &mut self.items).await;

        match advanced {
            Ok(Some((slot, index))) => {
                self.yielded = Some(slot);
                Ok(Some((index, Some(slot))))
            }
            Ok(None) => {
                let outcome = feeder.pool.close::<()>().await;
                self.retire();
                match outcome? {
                    Some(failure) => Err(DispatchError::from_failure(failure)),
                    None => Ok(None),
                }
            }
            Err(e) => {
                self.retire();
                Err(e)
            }
        }
    }

    async fn advance(
        feeder: &mut SlotFeeder<T::Elem>,
        yielded: &mut Option<usize>,
        items: &mut I,
    ) -> Result<Option<(usize, usize)>> {
        if let Some(slot) = yielded.take() {
            feeder.release(slot).await?;
        }
        feeder.fill(items).await?;
        feeder.next_completion().await
    }

    /// Drops the pool and the buffer, keeping their record
    fn retire(&mut self) {
        if let SlotEngine::Pool(feeder) = std::mem::replace(&mut self.engine, SlotEngine::Done) {
            self.stats = feeder.pool.stats().clone();
            self.history = feeder.ledger.history().to_vec();
        }
    }
}
