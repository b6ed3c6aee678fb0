//! # guest-threads
//!
//! Guest-thread lifecycle for a managed language runtime hosted on native threads.
//!
//! Every guest thread runs on its own native thread and drives a single root fiber. Blocking
//! operations (joins, sleeps, lock acquisition) go through an interruptible retry loop, and
//! cross-thread requests such as `kill` are delivered as actions the target runs on itself at
//! its next cooperative safepoint. Whatever locks a thread still holds when it dies are
//! released during its cleanup.
//!
//! The entry point is [`vm::ThreadManager`]; guest code talks to the runtime through the
//! [`vm::ThreadContext`] it runs with.
use clap::Parser;
use std::{process::ExitCode, time::Duration};
use tracing::Level;
use utils::sync::Arc;
use value::{Unwind, Value};
use vm::{GuestMutex, RuntimeConfig, ThreadContext, ThreadManager};

pub mod error;
pub mod utils;
pub mod value;
pub mod vm;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Runs guest-thread workers that contend for guest mutexes, kills some of them and joins the rest"
)]
pub struct Args {
    /// Number of worker threads
    #[arg(short, long, default_value_t = 4)]
    pub threads: usize,
    /// Number of shared guest mutexes
    #[arg(short, long, default_value_t = 2)]
    pub locks: usize,
    /// Length of one unit of work, during which a worker holds a mutex
    #[arg(long, value_name = "MS", default_value_t = 10)]
    pub slice_ms: u64,
    /// Total work per worker
    #[arg(long, value_name = "MS", default_value_t = 200)]
    pub work_ms: u64,
    /// Delay before every other worker is killed
    #[arg(long, value_name = "MS", default_value_t = 50)]
    pub kill_after_ms: u64,
    /// Limit for each join
    #[arg(long, value_name = "MS", default_value_t = 5000)]
    pub join_timeout_ms: u64,
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

pub fn run_cli() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let manager = ThreadManager::new(RuntimeConfig::default());
    let ctx = match manager.current_context() {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error starting runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    let mutexes: Vec<_> = (0..args.locks.max(1))
        .map(|_| Arc::new(GuestMutex::new()))
        .collect();
    let slice = Duration::from_millis(args.slice_ms.max(1));
    let slices = (args.work_ms / args.slice_ms.max(1)).max(1);

    let mut workers = Vec::with_capacity(args.threads);
    for index in 0..args.threads {
        let mutexes = mutexes.clone();
        let spawned = ctx.spawn(&format!("worker-{}", index), move |ctx| {
            work(ctx, index, &mutexes, slice, slices)
        });
        match spawned {
            Ok(thread) => workers.push(thread),
            Err(e) => {
                eprintln!("Error spawning worker {}: {}", index, e);
                let _ = manager.shutdown();
                return ExitCode::from(1);
            }
        }
    }

    if let Err(e) = ctx.sleep(Some(Duration::from_millis(args.kill_after_ms))) {
        eprintln!("Root thread interrupted: {}", e);
    }
    for worker in workers.iter().skip(1).step_by(2) {
        if let Err(e) = ctx.kill(worker) {
            eprintln!("Error killing {}: {}", worker.name(), e);
        }
    }

    let timeout = Duration::from_millis(args.join_timeout_ms);
    let mut all_joined = true;
    for worker in &workers {
        match ctx.join_for(worker, Some(timeout)) {
            Ok(Some(_)) => println!(
                "{}: status={} value={}",
                worker.name(),
                worker.status_value(),
                worker.value().unwrap_or_default()
            ),
            Ok(None) => {
                all_joined = false;
                println!("{}: still {} after {:?}", worker.name(), worker.status().as_str(), timeout);
            }
            Err(Unwind::Raise(failure)) => println!(
                "{}: status={} failure={}",
                worker.name(),
                worker.status_value(),
                failure
            ),
            Err(other) => println!("{}: {}", worker.name(), other),
        }
    }

    let all_unlocked = mutexes.iter().all(|m| !m.is_locked());
    println!("{}", manager.metrics());
    let torn_down = match manager.shutdown() {
        Ok(()) => true,
        Err(e) => {
            eprintln!("Error shutting down runtime: {}", e);
            false
        }
    };

    if all_joined && all_unlocked && torn_down {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

/// One worker: holds a mutex for each slice of work, polling between slices.
/// Locks are taken and released by hand so that a kill mid-slice leaves the
/// release to thread cleanup.
fn work(
    ctx: &ThreadContext,
    index: usize,
    mutexes: &[Arc<GuestMutex>],
    slice: Duration,
    slices: u64,
) -> Result<Value, Unwind> {
    for n in 0..slices {
        let mutex = &mutexes[(index + n as usize) % mutexes.len()];
        ctx.lock(mutex)?;
        ctx.sleep(Some(slice))?;
        ctx.unlock(mutex)?;
        ctx.safepoint()?;
    }
    Ok(Value::from(slices as i64))
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .try_init();
}
