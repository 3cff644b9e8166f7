// Process logging
//
// Console output filtered by `RUST_LOG` (or the verbosity flag), plus an
// optional daily-rolling file for long-running processes.

use anyhow::Result;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize logging based on verbosity level.
///
/// With `log_dir`, records are also written to `<log_dir>/<file_prefix>.<date>`;
/// the returned guard flushes that file and must live until exit.
pub fn init_logging(
    verbose: bool,
    json: bool,
    log_dir: Option<&Path>,
    file_prefix: &str,
) -> Result<Option<WorkerGuard>> {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("msflow={},msflow_worker={}", log_level, log_level).into());

    let console = if json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let (file, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()?;

    Ok(guard)
}
