// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Stderr logging for coordinators and workers; stdout is the worker protocol.

use tracing_subscriber::EnvFilter;

fn install(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    // A subscriber may already be installed by the embedding program or a test
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Logging for the coordinating process
pub fn init() {
    install("info");
}

/// Logging for a worker process; quieter by default
pub fn init_worker() {
    install("warn");
    tracing::debug!(pid = std::process::id(), "worker logging ready");
}
