// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::error::WorkerFailure;
use crate::shared_buffer::SlotMut;
use crate::worker_message::WorkerContext;
use bytemuck::Pod;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Task whose items and results travel through the channels.
///
/// `init` runs once per worker before the first item; whatever state it builds is
/// reused for every item that worker processes.
///
/// Worker processes speak the protocol on their stdout. Task code of every kind
/// must log through `tracing` or write to stderr: a `println!` inside a worker
/// corrupts the stream and the coordinator kills the pool with a malformed frame.
pub trait MapTask: Sized + Send + 'static {
    /// Name the worker binary registers the task under
    const NAME: &'static str;

    type Input: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;
    /// Configuration forwarded verbatim to every invocation
    type Options: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    fn init(context: &WorkerContext, options: &Self::Options) -> anyhow::Result<Self>;

    fn process(
        &mut self,
        input: Self::Input,
        index: usize,
        options: &Self::Options,
    ) -> anyhow::Result<Self::Output>;
}

/// Task that transforms a fixed-shape array in place inside a shared buffer slot
pub trait SlotTask: Sized + Send + 'static {
    const NAME: &'static str;

    type Elem: Pod + Send + Sync;
    type Options: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    fn init(context: &WorkerContext, options: &Self::Options) -> anyhow::Result<Self>;

    fn process(
        &mut self,
        slot: SlotMut<'_, Self::Elem>,
        index: usize,
        options: &Self::Options,
    ) -> anyhow::Result<()>;
}

/// Slot task whose results are folded into one value.
///
/// Each worker folds the items it sees into its own state with `map`, hands the
/// state over with `into_partial` at shutdown, and the coordinator's reducer merges
/// the partials with `combine`.
pub trait ReduceTask: Sized + Send + 'static {
    const NAME: &'static str;

    type Elem: Pod + Send + Sync;
    type Options: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
    type Partial: Serialize + DeserializeOwned + Send + 'static;

    fn init(context: &WorkerContext, options: &Self::Options) -> anyhow::Result<Self>;

    fn map(
        &mut self,
        slot: SlotMut<'_, Self::Elem>,
        index: usize,
        options: &Self::Options,
    ) -> anyhow::Result<()>;

    /// `None` when this worker saw no items
    fn into_partial(self) -> anyhow::Result<Option<Self::Partial>>;

    fn combine(acc: Self::Partial, next: Self::Partial) -> anyhow::Result<Self::Partial>;
}

/// Task that folds the channel items it receives into one value per worker.
///
/// Items are dealt to whichever worker has room, so each worker sees an arbitrary
/// subset. Every worker hands back `finish` at shutdown, including workers that saw
/// no item.
pub trait FoldTask: Sized + Send + 'static {
    const NAME: &'static str;

    type Input: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;
    type Options: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    fn init(context: &WorkerContext, options: &Self::Options) -> anyhow::Result<Self>;

    fn fold(
        &mut self,
        input: Self::Input,
        index: usize,
        options: &Self::Options,
    ) -> anyhow::Result<()>;

    fn finish(self, options: &Self::Options) -> anyhow::Result<Self::Output>;
}

/// Runs task code, turning both errors and panics into a computation failure
pub fn guarded<T>(
    context: &WorkerContext,
    index: Option<usize>,
    f: impl FnOnce() -> anyhow::Result<T>,
) -> Result<T, WorkerFailure> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(WorkerFailure::computation(
            context.worker,
            index,
            format!("{e:#}"),
        )),
        Err(panic) => Err(WorkerFailure::computation(
            context.worker,
            index,
            format!("task panicked: {}", panic_message(panic.as_ref())),
        )),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use anyhow::Context;

    #[test]
    fn test_guarded_keeps_error_chain() {
        let ctx = WorkerContext {
            worker: 2,
            worker_count: 4,
        };
        let failure = guarded::<()>(&ctx, Some(9), || {
            Err(anyhow::anyhow!("bad pixel")).context("masking image")
        })
        .unwrap_err();
        assert_eq!(failure.worker, 2);
        assert_eq!(failure.index, Some(9));
        assert_eq!(failure.kind, FailureKind::Computation);
        assert_eq!(failure.message, "masking image: bad pixel");
    }

    #[test]
    fn test_guarded_catches_panics() {
        let failure = guarded::<()>(&WorkerContext::serial(), Some(0), || {
            panic!("index out of range")
        })
        .unwrap_err();
        assert_eq!(failure.message, "task panicked: index out of range");
    }
}
