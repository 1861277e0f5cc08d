// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use task_dispatch_core::{DispatchError, DEFAULT_MAX_FRAME};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Settings of a worker pool.
///
/// Every field has a default, so a config file only lists what it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Worker processes to spawn; 0 or 1 runs in the caller's process
    pub worker_count: usize,
    /// Items in flight per worker before dispatch waits for results
    pub queue_capacity: usize,
    /// Program run as a worker; the current executable when unset
    pub worker_program: Option<PathBuf>,
    pub worker_args: Vec<String>,
    pub startup_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub max_frame_length: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            queue_capacity: 8,
            worker_program: None,
            worker_args: Vec::new(),
            startup_timeout_ms: 10_000,
            shutdown_timeout_ms: 10_000,
            max_frame_length: DEFAULT_MAX_FRAME,
        }
    }
}

impl PoolConfig {
    pub fn with_workers(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Self::default()
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.queue_capacity == 0 {
            return Err(DispatchError::Config(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_frame_length < 64 {
            return Err(DispatchError::Config(format!(
                "max_frame_length of {} bytes cannot carry a message",
                self.max_frame_length
            )));
        }
        Ok(())
    }

    /// Worker count after clamping to the number of items, when it is known
    pub fn effective_workers(&self, items: Option<usize>) -> usize {
        match items {
            Some(items) => self.worker_count.min(items),
            None => self.worker_count,
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn worker_program(&self) -> std::io::Result<PathBuf> {
        match &self.worker_program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe(),
        }
    }
}
