mod error;
mod role;

use clap::Parser;
use error::WorkerError;
use flux::logging;
use mapreduce::FunctionRegistry;
use std::net::TcpStream;

/// Worker entry point: connects to a coordinator, answers its handshake,
/// resolves whichever job it's pushed against the local registry, and runs
/// `map`/`reduce`/`partialreduce` assignments until disconnected.
#[derive(Parser, Debug)]
#[command(name = "mr-worker", about = "Map/reduce worker")]
struct Args {
    /// Coordinator host to connect to.
    host: String,

    /// Coordinator port.
    #[arg(long, default_value_t = flux::DEFAULT_PORT)]
    port: u16,

    /// Shared secret, matching the coordinator's `--secret`.
    #[arg(long, default_value = "")]
    secret: String,

    /// Registered job name this worker is prepared to execute.
    #[arg(long, default_value = "wordcount")]
    job: String,

    /// Verbosity: unset is info, `-v` is debug, `-vv` is trace.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();
    let level = match args.verbose {
        0 => slog::Level::Info,
        1 => slog::Level::Debug,
        _ => slog::Level::Trace,
    };
    let log = logging::init(level);

    if let Err(err) = run(args, log.clone()) {
        slog::crit!(log, "worker exited with an error"; "error" => %err);
        std::process::exit(1);
    }
}

fn run(args: Args, log: slog::Logger) -> Result<(), WorkerError> {
    let registry = FunctionRegistry::with_builtin_jobs();
    if registry.get(&args.job).is_none() {
        return Err(WorkerError::UnknownJob(args.job));
    }

    let secret = args.secret.into_bytes();
    let stream = TcpStream::connect((args.host.as_str(), args.port))?;
    slog::info!(log, "connected to coordinator"; "host" => &args.host, "port" => args.port);

    role::run_worker(stream, secret, registry, log)
}
