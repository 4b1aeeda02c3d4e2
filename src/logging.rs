use crate::paths;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging to both console and file. `verbose` lowers the default
/// level to debug; `RUST_LOG` still wins when set.
pub fn init_logging(verbose: bool) -> Result<PathBuf> {
    let logs_dir = paths::logs_dir()?;
    std::fs::create_dir_all(&logs_dir)
        .with_context(|| format!("Failed to create log directory: {}", logs_dir.display()))?;

    let log_file = logs_dir.join(log_file_name(chrono::Local::now().date_naive()));

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .with_context(|| format!("Failed to open log file: {}", log_file.display()))?;

    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(true);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_writer(Mutex::new(file))
        .with_ansi(false);

    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Logging was already initialized")?;

    tracing::info!("Logging initialized. Log file: {}", log_file.display());

    Ok(log_file)
}

/// `discrescue-YYYY-MM-DD.log`
fn log_file_name(date: chrono::NaiveDate) -> String {
    format!("discrescue-{}.log", date.format("%Y-%m-%d"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_name() {
        let date = chrono::NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(log_file_name(date), "discrescue-2024-03-07.log");
    }
}
