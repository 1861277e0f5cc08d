// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

pub mod config;
pub use config::{ConfigError, PoolConfig};

pub mod demo_tasks;

mod iterate_reduce;
pub use iterate_reduce::{iterate_reduce, IterateReduceJob};

pub mod logging;

mod map_reduce;
pub use map_reduce::{map_reduce, MapReduceJob};

mod process_mp;
pub use process_mp::{for_process_mp, process_mp, MapStream};

pub mod registry;
pub use registry::{TaskRegistry, WorkerIo};

mod shmem_map;
pub use shmem_map::{for_process_mp_shmem, SlotStream};

mod slot_feeder;

pub mod worker_pool;
pub use worker_pool::{PoolStats, WorkerPool, WORKER_ENV};

pub use task_dispatch_core::{
    DispatchError, FoldTask, MapTask, ProtocolError, ReduceTask, Shape, SlotEvent, SlotMut,
    SlotRef, SlotTask, WorkerContext, WorkerFailure,
};
