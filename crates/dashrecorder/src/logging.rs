//! Logging setup for the recorder daemon and the `dashrec` CLI.
//!
//! Log lines go to stderr so that command output on stdout (segment lists,
//! JSON reports) stays pipeable. Crash detection logs at `info` even when
//! the CLI runs quiet.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Target of the crash detection loop.
const CRASH_TARGET: &str = "dashrecorder::crash";

/// Verbosity level for logging output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Errors, plus crash detection.
    Quiet,
    /// Info and above.
    #[default]
    Normal,
    /// Debug and above: segment allocation, retention decisions.
    Verbose,
    /// Everything, including skipped directory entries.
    Trace,
}

impl Verbosity {
    /// Level applied to the crate as a whole.
    #[must_use]
    pub fn to_level_filter(&self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::INFO,
            Self::Verbose => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }

    /// `EnvFilter` directives used when `RUST_LOG` is not set.
    #[must_use]
    pub fn filter_directives(&self) -> String {
        let crate_level = self.to_level_filter();
        match self {
            Self::Quiet => format!("dashrecorder={crate_level},{CRASH_TARGET}={}", Level::INFO),
            _ => format!("dashrecorder={crate_level}"),
        }
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `verbosity` when set. Calling this twice is
/// harmless; the second call does nothing.
///
/// # Examples
///
/// ```no_run
/// use dashrecorder::{init_logging, logging::Verbosity};
///
/// init_logging(Verbosity::Verbose);
/// ```
pub fn init_logging(verbosity: Verbosity) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.filter_directives()));

    let subscriber = tracing_subscriber::registry().with(env_filter).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false),
    );

    let _ = subscriber.try_init();
}

/// Initialize logging for tests: warnings and errors only.
#[cfg(test)]
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}
