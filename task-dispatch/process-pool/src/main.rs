// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::Rng;
use std::path::PathBuf;
use std::time::Instant;
use task_dispatch_process_pool::demo_tasks::{
    ElementSum, Halve, Scale, ScaleOptions, Square, SquareOptions, SumOptions, Tally,
    TallyOptions,
};
use task_dispatch_process_pool::{
    for_process_mp_shmem, logging, process_mp, IterateReduceJob, MapReduceJob, PoolConfig,
    PoolStats, TaskRegistry,
};
use tracing::warn;

fn registry() -> TaskRegistry {
    TaskRegistry::new()
        .register_map::<Square>()
        .register_map::<Halve>()
        .register_slot::<Scale>()
        .register_reduce::<ElementSum>()
        .register_fold::<Tally>()
}

#[derive(Parser)]
#[command(name = "task-dispatch", about = "Process pool task dispatch demo")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one of the dispatchers on generated data
    Run(RunArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    /// Square integers through the channels
    Map,
    /// Scale arrays in place in shared memory
    Shmem,
    /// Elementwise mean of arrays through shared memory
    Reduce,
    /// Sum integers into one tally per worker
    Fold,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, value_enum, default_value = "map")]
    mode: Mode,

    /// Pool configuration file (JSON)
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Overrides `worker_count` from the configuration
    #[arg(long)]
    workers: Option<usize>,

    /// Number of items to generate
    #[arg(long, default_value_t = 1_000)]
    count: usize,

    /// Elements per array in the shared-memory modes
    #[arg(long, default_value_t = 64)]
    width: usize,
}

fn main() -> anyhow::Result<()> {
    // Worker processes never get past this call
    registry().serve_if_worker();

    let cli = Cli::parse();
    logging::init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the tokio runtime")?;

    match cli.command {
        Commands::Run(args) => runtime.block_on(run(args)),
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = match PoolConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "using default pool configuration");
            PoolConfig::default()
        }
    };
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }

    println!("=== TASK DISPATCH ===");
    println!("Configuration:");
    println!("  - Workers: {}", config.worker_count);
    println!("  - Queue capacity: {}", config.queue_capacity);
    println!("  - Items: {}", args.count);

    let start_time = Instant::now();
    let stats = match args.mode {
        Mode::Map => run_map(&args, &config).await?,
        Mode::Shmem => run_shmem(&args, &config).await?,
        Mode::Reduce => run_reduce(&args, &config).await?,
        Mode::Fold => run_fold(&args, &config).await?,
    };

    println!("\nFinished in {:.2?}", start_time.elapsed());
    print_stats(&stats);
    Ok(())
}

async fn run_map(args: &RunArgs, config: &PoolConfig) -> anyhow::Result<PoolStats> {
    let mut rng = rand::rng();
    let items: Vec<i64> = (0..args.count)
        .map(|_| rng.random_range(-1_000..=1_000))
        .collect();
    let expected: i64 = items.iter().map(|x| x * x).sum();

    let mut results = process_mp::<Square, _>(items, SquareOptions::default(), config);
    let mut total = 0;
    let mut received = 0;
    while let Some(result) = results.next().await {
        let (_, squared) = result?;
        total += squared;
        received += 1;
    }

    println!("\nSquared {received} integers");
    println!("  - Sum of squares: {total} (expected {expected})");
    Ok(results.stats())
}

fn random_arrays(count: usize, width: usize) -> Vec<Vec<f64>> {
    let mut rng = rand::rng();
    (0..count)
        .map(|_| (0..width).map(|_| rng.random_range(0.0..1.0)).collect())
        .collect()
}

async fn run_shmem(args: &RunArgs, config: &PoolConfig) -> anyhow::Result<PoolStats> {
    let items = random_arrays(args.count, args.width);
    let expected: f64 = items.iter().flatten().sum::<f64>() * ScaleOptions::default().factor;

    let mut results =
        for_process_mp_shmem::<Scale, _>(&items, [args.width], ScaleOptions::default(), config);
    let mut total = 0.0;
    let mut received = 0;
    while let Some(result) = results.next().await {
        let (_, slot) = result?;
        total += slot.iter().sum::<f64>();
        received += 1;
    }

    println!("\nScaled {received} arrays of {} elements", args.width);
    println!("  - Sum: {total:.4} (expected {expected:.4})");
    println!("  - Slot events: {}", results.slot_history().len());
    Ok(results.stats())
}

async fn run_reduce(args: &RunArgs, config: &PoolConfig) -> anyhow::Result<PoolStats> {
    let items = random_arrays(args.count, args.width);

    let mut job =
        MapReduceJob::<ElementSum, _>::start(&items, [args.width], SumOptions::default(), config)
            .await?;
    let reduced = job.run().await?;

    match reduced {
        Some(partial) => {
            let mean = partial.mean();
            let overall = mean.iter().sum::<f64>() / mean.len().max(1) as f64;
            println!("\nAveraged {} arrays of {} elements", partial.count, args.width);
            println!("  - Mean of means: {overall:.4}");
        }
        None => println!("\nNo arrays to average"),
    }
    Ok(job.stats())
}

async fn run_fold(args: &RunArgs, config: &PoolConfig) -> anyhow::Result<PoolStats> {
    let mut rng = rand::rng();
    let items: Vec<i64> = (0..args.count)
        .map(|_| rng.random_range(-1_000..=1_000))
        .collect();
    let expected: i64 = items.iter().sum();

    let mut job = IterateReduceJob::<Tally, _>::start(items, TallyOptions::default(), config).await?;
    let tallies = job.run().await?;

    println!("\nFolded {} integers into {} tallies", args.count, tallies.len());
    for (worker, tally) in tallies.iter().enumerate() {
        println!("  - Worker {worker}: {} items, sum {}", tally.items, tally.total);
    }
    let total: i64 = tallies.iter().map(|t| t.total).sum();
    println!("  - Sum: {total} (expected {expected})");
    Ok(job.stats())
}

fn print_stats(stats: &PoolStats) {
    println!("Pool:");
    println!("  - Spawned: {}", stats.spawned);
    println!("  - Dispatched: {}", stats.dispatched);
    println!("  - Completed: {}", stats.completed);
    println!("  - Acknowledgements: {}", stats.acknowledgements);
    println!("  - Discarded: {}", stats.discarded);
}
