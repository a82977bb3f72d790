use std::{fs, io, path::Path};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

/// Filter directives for console logs, in `RUST_LOG` syntax.
pub const LOG_ENV: &str = "DUTRUN_LOG";
pub const FULL_LOG_FILENAME: &str = "full.txt";

/// Logs to stderr as filtered by [LOG_ENV], and everything down to debug level to
/// [FULL_LOG_FILENAME] in `results_dir` if one is given. Keep the returned guard alive until
/// exit, or buffered file logs are lost.
pub fn init(results_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let console_filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_filter(console_filter);

    let Some(results_dir) = results_dir else {
        tracing_subscriber::registry().with(console).try_init()?;
        return Ok(None);
    };

    fs::create_dir_all(results_dir)?;
    let appender = tracing_appender::rolling::never(results_dir, FULL_LOG_FILENAME);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let full = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(LevelFilter::DEBUG);

    tracing_subscriber::registry()
        .with(console)
        .with(full)
        .try_init()?;
    Ok(Some(guard))
}
