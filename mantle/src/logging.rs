//! Thin facade over `slog` so the rest of the crate can say `logging::debug!`
//! without caring how the root logger was built.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds the stderr logger for the process. Verbose mode lowers the
/// threshold to debug.
pub fn init(verbose: bool) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(if verbose {
        Severity::Debug
    } else {
        Severity::Info
    });
    builder.destination(Destination::Stderr);
    builder.build().expect("logger construction failed")
}

/// A logger that swallows everything. Used by tests and optional call sites.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
