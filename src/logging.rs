//! Logger initialization from [`LoggingConfig`]
//!
//! Structured logs via `tracing`, either JSON (for aggregation) or a
//! human-readable console format, to stdout or an append-only file.

use std::fs::OpenOptions;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{LbError, Result};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level so operators can
/// raise verbosity without touching the config file.
pub fn init(cfg: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.level.to_lowercase()));

    let json = cfg.format.eq_ignore_ascii_case("json");

    if cfg.output.eq_ignore_ascii_case("file") {
        if let Some(dir) = std::path::Path::new(&cfg.file_path).parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.file_path)
            .map_err(|e| {
                LbError::Config(format!("failed to open log file {}: {e}", cfg.file_path))
            })?;
        let writer = Arc::new(file);

        if json {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .json()
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
        }
    } else if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        level = cfg.level,
        format = cfg.format,
        output = cfg.output,
        "Logger initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // init() installs a process-global subscriber, so only the failure path
    // is exercised here; the success paths are covered by running the binary.
    #[test]
    fn test_unwritable_file_path_is_config_error() {
        let cfg = LoggingConfig {
            level: "info".to_string(),
            format: "json".to_string(),
            output: "file".to_string(),
            file_path: "/proc/definitely/not/writable.log".to_string(),
        };
        let err = init(&cfg).unwrap_err();
        assert!(matches!(
            err,
            LbError::Config(_) | LbError::Io(_)
        ));
    }
}
