//! Structured logging setup shared by the coordinator and worker binaries.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Level, Logger};

use slog_async::Async;
use slog_term::{FullFormat, TermDecorator};

/// Builds a root logger writing to stderr, filtered to `level`.
pub fn init(level: Level) -> Logger {
    let decorator = TermDecorator::new().stderr().build();
    let drain = FullFormat::new(decorator).build().fuse();
    let drain = Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();

    Logger::root(drain, o!())
}

/// A logger that discards everything, used by library callers and tests that
/// do not want to wire up their own sink.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
