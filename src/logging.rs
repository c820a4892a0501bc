//! Logging initialization
//!
//! Structured lines to stdout and to `LOG_DIR/app.log` through a
//! non-blocking appender. The returned guard must live for the process
//! lifetime or buffered lines are lost on shutdown.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";

pub fn init(log_dir: &Path, level: &str) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::never(log_dir, "app.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("stalker_proxy={level}").into());

    let stdout_layer =
        tracing_subscriber::fmt::layer().with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}
