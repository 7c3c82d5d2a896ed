//! Log subscriber installation.

use std::fs::OpenOptions;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

use crate::config::LoggingSection;

/// Failure to install the subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The log file could not be opened.
    #[error("failed to open log file: {0}")]
    Io(#[from] std::io::Error),

    /// A global subscriber is already set.
    #[error("failed to install log subscriber: {0}")]
    Init(#[from] TryInitError),
}

/// Filter for `directives`, falling back to `info` when they do not parse.
#[must_use]
pub fn filter(directives: &str) -> EnvFilter {
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global `tracing` subscriber described by `logging`.
///
/// Logs go to stdout, or are appended to `logging.file` without ANSI
/// colors.
pub fn init(logging: &LoggingSection) -> Result<(), TelemetryError> {
    let filter = filter(&logging.level);

    if let Some(path) = &logging.file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_directives_fall_back_to_info() {
        assert_eq!(filter("bulwark_transport=loud").to_string(), "info");
        assert_eq!(filter("bulwark_node=debug").to_string(), "bulwark_node=debug");
    }

    #[test]
    fn unwritable_log_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let logging = LoggingSection {
            level: "info".to_string(),
            file: Some(dir.path().join("missing").join("node.log")),
        };
        assert!(matches!(init(&logging), Err(TelemetryError::Io(_))));
    }
}
