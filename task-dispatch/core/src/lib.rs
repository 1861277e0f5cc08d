// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

pub mod error;
pub use error::{DispatchError, FailureKind, ProtocolError, TransportError, WorkerFailure};

pub mod lifecycle;
pub use lifecycle::{CoordinatorState, WorkerLifecycle, WorkerState};

pub mod shared_buffer;
pub use shared_buffer::{BufferHandle, Shape, SharedBuffer, SharedBufferError, SlotMut, SlotRef};

pub mod slot_ledger;
pub use slot_ledger::{SlotEvent, SlotLedger, SlotState};

pub mod task;
pub use task::{guarded, FoldTask, MapTask, ReduceTask, SlotTask};

pub mod worker_io;
pub use worker_io::{FramedIo, WorkerTransport, DEFAULT_MAX_FRAME};

pub mod worker_loop;
pub use worker_loop::{serve_fold, serve_map, serve_reduce, serve_slot, WorkerExit};

pub mod worker_message;
pub use worker_message::{JobSpec, TaskKind, WorkerCommand, WorkerContext, WorkerReply};
