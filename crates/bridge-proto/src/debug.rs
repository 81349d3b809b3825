//! Logging setup shared by the binary and the test harnesses

use std::fs::OpenOptions;
use std::sync::Once;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

static INIT_LOG: Once = Once::new();

/// Sets up logging with maximum verbosity (trace level).
/// Mainly for unit tests.
pub fn setup_logging_verbose() {
    setup_logging(EnvFilter::new("trace"), None);
}

/// Sets up logging to stdout at the given level and optionally a verbose
/// log file. Returns a guard that needs to be kept alive for logging to
/// file to keep working.
pub fn setup_logging_default(stdout_level: &str, verbose_logfile: Option<String>) -> Option<WorkerGuard> {
    let stdout_filter = EnvFilter::new(stdout_level);
    let logfile_and_filter = verbose_logfile.map(|file| (file, EnvFilter::new("debug")));
    setup_logging(stdout_filter, logfile_and_filter)
}

fn setup_logging(stdout_filter: EnvFilter, outfile: Option<(String, EnvFilter)>) -> Option<WorkerGuard> {
    let mut guard = None;

    INIT_LOG.call_once(|| {
        let stdout_layer = fmt::layer()
            .with_target(false)
            .with_filter(stdout_filter);

        if let Some((outfile, outfile_filter)) = outfile {
            let file = match OpenOptions::new().create(true).append(true).open(&outfile) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Failed to open log file {}: {}", outfile, e);
                    tracing_subscriber::registry().with(stdout_layer).init();
                    return;
                }
            };
            let (non_blocking, file_guard) = tracing_appender::non_blocking(file);
            let file_layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(outfile_filter);
            tracing_subscriber::registry()
                .with(stdout_layer)
                .with(file_layer)
                .init();
            guard = Some(file_guard);
        } else {
            tracing_subscriber::registry().with(stdout_layer).init();
        }
    });

    guard
}
