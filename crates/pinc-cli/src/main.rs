//! Pinc demo driver
//!
//! Runs small task graphs on the pinc runtime and exits with the runtime's
//! exit code. `RUST_LOG=pinc=debug` shows scheduler lifecycle events.

use anyhow::Context;
use clap::{Parser, Subcommand};
use pinc::{gather, sleep, wait_until, yield_now, Handle, Runtime, RuntimeConfig, Task};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "pinc")]
#[command(about = "Cooperative task scheduler demos", long_about = None)]
#[command(version)]
struct Cli {
    /// Worker threads (default: PINC_POOL_SIZE or the number of CPUs)
    #[arg(short, long, global = true)]
    pool_size: Option<usize>,

    /// Let detached tasks finish after the root task completes
    #[arg(long, global = true)]
    drain: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sleep concurrently for each delay and report the wall-clock time
    Gather {
        /// Delays in milliseconds
        #[arg(value_delimiter = ',', default_value = "1000,2000")]
        delays: Vec<u64>,
    },

    /// Race a sleeping task against a deadline
    Timeout {
        /// How long the work sleeps, in milliseconds
        #[arg(long, default_value_t = 5000)]
        work: u64,
        /// Deadline in milliseconds
        #[arg(long, default_value_t = 1000)]
        limit: u64,
    },

    /// Spawn many tasks that yield repeatedly and print per-worker stats
    Spin {
        /// Number of tasks
        #[arg(long, default_value_t = 64)]
        tasks: usize,
        /// Yields per task
        #[arg(long, default_value_t = 100)]
        yields: usize,
    },
}

fn gather_demo(delays: Vec<u64>) -> Task<()> {
    Task::named("gather-demo", async move {
        let started = Instant::now();
        let sleeps = delays
            .iter()
            .map(|ms| sleep(Duration::from_millis(*ms)))
            .collect();
        gather(sleeps).await?;
        println!("slept {:?} concurrently in {:?}", delays, started.elapsed());
        Ok(())
    })
}

fn timeout_demo(work: u64, limit: u64) -> Task<()> {
    Task::named("timeout-demo", async move {
        let started = Instant::now();
        let inner = sleep(Duration::from_millis(work));
        let inner_handle = inner.handle();
        match wait_until(inner, Duration::from_millis(limit)).await {
            Ok(()) => println!("work finished in {:?}", started.elapsed()),
            Err(err) if err.is_timeout() => println!(
                "{} after {:?}; inner task cancelled: {}",
                err,
                started.elapsed(),
                inner_handle.is_cancelled()
            ),
            Err(err) => return Err(err),
        }
        Ok(())
    })
}

fn spin_demo(tasks: usize, yields: usize) -> Task<()> {
    Task::named("spin-demo", async move {
        let started = Instant::now();
        let spinners = (0..tasks)
            .map(|_| {
                Task::new(async move {
                    for _ in 0..yields {
                        yield_now().await;
                    }
                    Ok(())
                })
            })
            .collect();
        gather(spinners).await?;
        println!("{} tasks x {} yields in {:?}", tasks, yields, started.elapsed());
        if let Some(handle) = Handle::current() {
            for stats in handle.pool_stats() {
                println!(
                    "  worker {}: {} resumptions",
                    stats.worker, stats.executed
                );
            }
        }
        Ok(())
    })
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default())
        .format_timestamp_millis()
        .try_init()
        .ok();

    let cli = Cli::parse();

    let mut config = RuntimeConfig::from_env().context("invalid PINC_* environment")?;
    if let Some(pool_size) = cli.pool_size {
        config = config.with_pool_size(pool_size);
    }
    if cli.drain {
        config = config.with_drain_on_exit(true);
    }
    log::debug!("runtime config: {:?}", config);
    let runtime = Runtime::new(config);

    let root = match cli.command {
        Commands::Gather { delays } => gather_demo(delays),
        Commands::Timeout { work, limit } => timeout_demo(work, limit),
        Commands::Spin { tasks, yields } => spin_demo(tasks, yields),
    };

    let code = runtime.start(root);
    std::process::exit(code);
}
