use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keeps the non-blocking writers flushing. Drop it only at shutdown.
#[must_use = "log output stops when the guard is dropped"]
pub struct LoggingGuard {
    _file: WorkerGuard,
    _console: WorkerGuard,
}

/// Installs the global subscriber: a daily-rotated file under `log_dir` plus colored
/// console output. `RUST_LOG` controls the filter and defaults to `info`.
pub fn init_logging(log_dir: &str, service_name: &str) -> Result<LoggingGuard, anyhow::Error> {
    std::fs::create_dir_all(log_dir)?;
    let backup = rotate_logs_on_startup(log_dir, service_name)?;

    let file_appender = rolling::daily(log_dir, format!("{service_name}.log"));
    let (non_blocking_file, file_guard) = non_blocking(file_appender);
    let (non_blocking_stdout, console_guard) = non_blocking(std::io::stdout());

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .with_writer(non_blocking_stdout)
        .with_ansi(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(false);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    info!("Logging initialized - logs will be written to {log_dir}/{service_name}.log");
    if let Some(backup) = backup {
        info!("Previous log file backed up to: {backup}");
    }

    Ok(LoggingGuard {
        _file: file_guard,
        _console: console_guard,
    })
}

/// Moves an existing `<service>.log` aside with a timestamp suffix. Returns the backup
/// path if there was anything to move.
pub fn rotate_logs_on_startup(
    log_dir: &str,
    service_name: &str,
) -> Result<Option<String>, anyhow::Error> {
    let log_file = format!("{log_dir}/{service_name}.log");
    if !Path::new(&log_file).exists() {
        return Ok(None);
    }

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let backup_file = format!("{log_dir}/{service_name}.{timestamp}.log");
    std::fs::rename(&log_file, &backup_file)?;
    Ok(Some(backup_file))
}
