//! Tracing subscriber setup.
//!
//! `RUST_LOG` drives the filter (default `info`), `LOG_FORMAT=json` switches to structured
//! output and `LOG_DIR` redirects logs to a daily rolling file instead of stderr.

use std::env;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "aq-rollup.log";

/// Installs the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be held until exit.
pub fn init() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let (writer, guard, ansi) = match env::var("LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard), false)
        },
        _ => (BoxMakeWriter::new(std::io::stderr), None, true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }

    guard
}
