// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Coordinator side of the shared-buffer protocol.
//!
//! The feeder owns the pool, the buffer and the ledger. It copies items into free
//! slots, tells a worker which slot to process and records every ownership change,
//! so a slot is only rewritten after its previous occupant was released.

use crate::config::PoolConfig;
use crate::worker_pool::WorkerPool;
use bytemuck::Pod;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use task_dispatch_core::{
    CoordinatorState, DispatchError, JobSpec, ProtocolError, Shape, SharedBuffer, SlotLedger,
    TaskKind, WorkerCommand, WorkerContext, WorkerReply,
};
use tracing::{debug, warn};

type Result<T> = std::result::Result<T, DispatchError>;

/// `R` is the type of the partial workers send at shutdown, `()` when there is none
pub(crate) struct SlotFeeder<E: Pod, R = ()> {
    pub(crate) pool: WorkerPool,
    pub(crate) buffer: SharedBuffer<E>,
    pub(crate) ledger: SlotLedger,
    pub(crate) shape: Shape,
    next_index: usize,
    exhausted: bool,
    partial: PhantomData<fn() -> R>,
}

impl<E: Pod, R: DeserializeOwned> SlotFeeder<E, R> {
    /// Allocates one slot per worker and starts the pool on it
    pub(crate) async fn start(
        task: &str,
        kind: TaskKind,
        options: Vec<u8>,
        shape: Shape,
        config: &PoolConfig,
    ) -> Result<Self> {
        let workers = config.worker_count;
        let buffer = SharedBuffer::<E>::allocate(shape.len() * workers)?;
        let job = JobSpec {
            task: task.to_string(),
            kind,
            context: WorkerContext {
                worker: 0,
                worker_count: workers,
            },
            options,
            buffer: Some(buffer.handle().clone()),
            shape: Some(shape.clone()),
        };
        let pool = WorkerPool::start(config, job).await?;
        Ok(Self {
            pool,
            buffer,
            ledger: SlotLedger::new(workers),
            shape,
            next_index: 0,
            exhausted: false,
            partial: PhantomData,
        })
    }

    /// Copies items into every free slot and hands them to idle workers
    pub(crate) async fn fill<I>(&mut self, items: &mut I) -> Result<()>
    where
        I: Iterator,
        I::Item: AsRef<[E]>,
    {
        while !self.exhausted {
            let Some(slot) = self.ledger.free_slot() else {
                break;
            };
            let Some(worker) = self.pool.available_worker() else {
                break;
            };
            let Some(item) = items.next() else {
                self.exhausted = true;
                break;
            };
            let index = self.next_index;
            self.next_index += 1;

            let item = item.as_ref();
            if item.len() != self.shape.len() {
                warn!(index, "item does not fit its slot, shutting the pool down");
                self.pool.transition(CoordinatorState::Propagating);
                if let Err(e) = self.pool.close::<R>().await {
                    warn!(error = %e, "pool teardown after a bad item was not clean");
                }
                return Err(DispatchError::ItemShape {
                    index,
                    expected: self.shape.len(),
                    actual: item.len(),
                });
            }

            let slots = self.ledger.slot_count();
            let Some(mut view) = self.buffer.slot_mut(slot, &self.shape) else {
                self.pool.abort().await;
                return Err(ProtocolError::InvalidSlot { slot, slots }.into());
            };
            view.copy_from_slice(item);
            self.assign(slot, index).await?;
            self.pool
                .dispatch(worker, &WorkerCommand::<()>::Slot { slot, index })
                .await?;
            debug!(worker, slot, index, "item dispatched");
        }
        Ok(())
    }

    async fn assign(&mut self, slot: usize, index: usize) -> Result<()> {
        if let Err(e) = self.ledger.assign(slot, index) {
            self.pool.abort().await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Waits for the next finished slot.
    ///
    /// Returns `None` once nothing is in flight. A failed item shuts the pool down
    /// gracefully before its error is returned.
    pub(crate) async fn next_completion(&mut self) -> Result<Option<(usize, usize)>> {
        if self.ledger.in_flight() == 0 {
            return Ok(None);
        }
        match self.pool.recv::<R>().await? {
            (_, WorkerReply::SlotCompleted { slot, index }) => {
                if let Err(e) = self.ledger.complete(slot, index) {
                    self.pool.abort().await;
                    return Err(e.into());
                }
                Ok(Some((slot, index)))
            }
            (_, WorkerReply::Failed(failure)) => {
                warn!(%failure, "item failed, shutting the pool down");
                self.pool.transition(CoordinatorState::Propagating);
                match self.pool.close::<R>().await {
                    Ok(Some(later)) => debug!(%later, "further failure while draining"),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "pool teardown after failure was not clean"),
                }
                Err(DispatchError::from_failure(failure))
            }
            (worker, other) => {
                self.pool.abort().await;
                Err(ProtocolError::UnexpectedReply {
                    worker,
                    reply: other.name(),
                }
                .into())
            }
        }
    }

    pub(crate) async fn release(&mut self, slot: usize) -> Result<usize> {
        match self.ledger.release(slot) {
            Ok(index) => Ok(index),
            Err(e) => {
                self.pool.abort().await;
                Err(e.into())
            }
        }
    }
}
