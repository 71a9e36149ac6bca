//! Process-wide logging and metrics setup.
//!
//! The daemon, the CLI, and every forked maintenance subprocess all call
//! [`init`] once at startup. Each gets its own log file (daemon log vs.
//! error log, per the host paths table) but shares the same `tracing`
//! subscriber wiring.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

static INIT: OnceLock<()> = OnceLock::new();

/// Where a subsystem's log lines should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    /// Human-oriented ANSI output on stderr (interactive CLI use).
    Stderr,
    /// Newline-delimited JSON appended to a file (daemon / subprocess use).
    JsonFile,
}

/// Initializes the global `tracing` subscriber.
///
/// Idempotent: subsequent calls are no-ops. `RUST_LOG` (or `ENGRAMMAR_LOG`
/// if set) controls verbosity; defaults to `info`.
pub fn init(target: LogTarget, log_path: Option<&Path>) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_env("ENGRAMMAR_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let writer = match (target, log_path) {
            (LogTarget::JsonFile, Some(path)) => {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                match OpenOptions::new().create(true).append(true).open(path) {
                    Ok(file) => BoxMakeWriter::new(file),
                    Err(_) => BoxMakeWriter::new(std::io::stderr),
                }
            }
            _ => BoxMakeWriter::new(std::io::stderr),
        };

        let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer);

        if matches!(target, LogTarget::JsonFile) {
            builder.json().with_ansi(false).init();
        } else {
            builder.with_ansi(true).init();
        }
    });
}

/// Records a uniform outcome counter: one counter per operation, labeled
/// by outcome.
pub fn record_outcome(operation: &'static str, outcome: &'static str) {
    metrics::counter!("engrammar_operation_total", "operation" => operation, "outcome" => outcome)
        .increment(1);
}

/// Records a duration histogram for an operation, in seconds.
pub fn record_duration(operation: &'static str, seconds: f64) {
    metrics::histogram!("engrammar_operation_duration_seconds", "operation" => operation)
        .record(seconds);
}
