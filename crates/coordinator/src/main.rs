mod error;
mod role;

use clap::Parser;
use error::{CoordinatorError, CoordinatorResult};
use flux::logging;
use mapreduce::batched::BatchedTaskManager;
use mapreduce::datasource::Datasource;
use mapreduce::memory::InMemoryTaskManager;
use mapreduce::sqlite::SqliteTaskManager;
use mapreduce::{jobs, FunctionRegistry, Phase, TaskManager};
use rusqlite::Connection as SqliteConnection;
use slog::{info, o, Logger};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Coordinator entry point: binds a listener, builds the task manager the
/// flags describe, and hands each authenticated worker connection the
/// assignment pump in `role::run_session`.
#[derive(Parser, Debug)]
#[command(name = "mr-coordinator", about = "Distributed map/reduce coordinator")]
struct Args {
    /// Shared secret both ends authenticate the handshake against.
    #[arg(long, default_value = "")]
    secret: String,

    /// Listening port.
    #[arg(long, default_value_t = flux::DEFAULT_PORT)]
    port: u16,

    /// Registered job name (datasource + mapfn/reducefn/collectfn triple).
    #[arg(long, default_value = "wordcount")]
    job: String,

    /// Path to a SQLite store. Omit for the in-memory task manager.
    #[arg(long)]
    store: Option<PathBuf>,

    /// Resume a job from an existing `--store` rather than starting fresh.
    #[arg(long)]
    resume: bool,

    /// Per-slice value count for the batched task manager. Requires `--store`.
    #[arg(long)]
    batch_size: Option<usize>,
}

fn main() {
    let args = Args::parse();
    let log = logging::init(slog::Level::Info);

    if let Err(err) = run(args, log.clone()) {
        slog::crit!(log, "coordinator exited with an error"; "error" => %err);
        std::process::exit(1);
    }
}

fn build_manager(args: &Args, job: mapreduce::JobDef) -> CoordinatorResult<Box<dyn TaskManager>> {
    let datasource: Box<dyn Datasource> = match job.name {
        "wordcount" => Box::new(jobs::wordcount::demo_datasource()),
        other => return Err(CoordinatorError::UnknownJob(other.to_string())),
    };

    let manager: Box<dyn TaskManager> = match (&args.store, args.batch_size) {
        (Some(path), Some(batch_size)) => {
            let conn = SqliteConnection::open(path)?;
            Box::new(BatchedTaskManager::new(conn, datasource, args.resume, batch_size)?)
        }
        (Some(path), None) => {
            let conn = SqliteConnection::open(path)?;
            Box::new(SqliteTaskManager::new(conn, datasource, args.resume)?)
        }
        (None, _) => Box::new(InMemoryTaskManager::new(datasource)),
    };

    Ok(manager)
}

fn run(args: Args, log: Logger) -> CoordinatorResult<()> {
    let job = FunctionRegistry::with_builtin_jobs()
        .get(&args.job)
        .copied()
        .ok_or_else(|| CoordinatorError::UnknownJob(args.job.clone()))?;

    let manager: Arc<Mutex<Box<dyn TaskManager>>> = Arc::new(Mutex::new(build_manager(&args, job)?));
    let secret = args.secret.clone().into_bytes();

    let listener = TcpListener::bind(("0.0.0.0", args.port))?;
    listener.set_nonblocking(true)?;
    info!(log, "coordinator listening"; "port" => args.port, "job" => &args.job);

    let mut handles = Vec::new();

    loop {
        if manager.lock().unwrap().phase() == Phase::Finished {
            break;
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                let manager = Arc::clone(&manager);
                let secret = secret.clone();
                let session_log = log.new(o!("peer" => peer.to_string()));

                handles.push(thread::spawn(move || {
                    if let Err(err) = role::run_session(stream, secret, job, manager, session_log.clone()) {
                        role::log_session_error(&session_log, &err);
                    }
                }));
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(log, "job finished, no longer accepting connections");
    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}
