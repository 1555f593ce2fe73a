//! Logger bootstrap.
//!
//! The libraries only emit through `log`; binaries call [`init_logging`] once
//! with the config's `log_spec`. Repeated calls keep the first logger.

use std::{path::Path, sync::OnceLock};

use flexi_logger::{FileSpec, Logger, LoggerHandle, WriteMode};
use thiserror::Error;

static LOGGER: OnceLock<LoggerHandle> = OnceLock::new();

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log spec `{spec}`: {source}")]
    Spec {
        spec: String,
        #[source]
        source: flexi_logger::FlexiLoggerError,
    },
    #[error("failed to start logger: {0}")]
    Start(#[source] flexi_logger::FlexiLoggerError),
}

/// Logs to stderr, and additionally to `log_dir` when given.
pub fn init_logging(spec: &str, log_dir: Option<&Path>) -> Result<(), LoggingError> {
    if LOGGER.get().is_some() {
        return Ok(());
    }

    let logger = Logger::try_with_str(spec).map_err(|source| LoggingError::Spec {
        spec: spec.to_owned(),
        source,
    })?;
    let logger = match log_dir {
        Some(dir) => logger
            .log_to_file(FileSpec::default().directory(dir).basename("vis"))
            .duplicate_to_stderr(flexi_logger::Duplicate::All)
            .write_mode(WriteMode::BufferAndFlush)
            .format_for_files(flexi_logger::detailed_format),
        None => logger.log_to_stderr(),
    };
    let handle = logger.start().map_err(LoggingError::Start)?;

    if LOGGER.set(handle).is_ok() {
        log::info!("logging started with `{spec}`");
    }
    Ok(())
}

pub fn logging_active() -> bool {
    LOGGER.get().is_some()
}
