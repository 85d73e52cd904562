//! Structured logging
//!
//! Pretty output for development, JSON output for log aggregation.
//! `RUST_LOG` takes precedence over the configured level.
//!
//! # Usage
//!
//! ```rust,no_run
//! use mpc_keysign::logging::{init_logging, LogLevel};
//!
//! init_logging(LogLevel::Info, false).expect("logging");
//! tracing::info!(session_id = %"abc", "Starting signing session");
//! ```

use crate::config::CoordinatorConfig;
use crate::types::SignatureAlgorithm;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Application log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// Logging errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    InitFailed(String),
}

/// Filter used when `RUST_LOG` is unset
fn default_filter(level: LogLevel) -> String {
    let level = level.as_str();
    format!("mpc_keysign={level},tower_http={level},axum={level}")
}

/// Initialize the global subscriber
pub fn init_logging(level: LogLevel, json_format: bool) -> Result<(), LoggingError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(level)));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    }

    Ok(())
}

/// Initialize logging from a coordinator config
pub fn init_from_config(config: &CoordinatorConfig, json_format: bool) -> Result<(), LoggingError> {
    init_logging(LogLevel::from(config.log_level.as_str()), json_format)
}

/// Log the outcome of a signing attempt
pub fn log_signing_event(
    session_id: &str,
    algorithm: SignatureAlgorithm,
    initiator: bool,
    error: Option<(&str, &str)>,
) {
    match error {
        None => tracing::info!(
            target: "mpc_keysign::signing",
            session_id = %session_id,
            algorithm = %algorithm,
            initiator,
            success = true,
            "Signing attempt finished"
        ),
        Some((code, message)) => tracing::error!(
            target: "mpc_keysign::signing",
            session_id = %session_id,
            algorithm = %algorithm,
            initiator,
            success = false,
            code = %code,
            error = %message,
            "Signing attempt failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::from("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::from("INFO"), LogLevel::Info);
        assert_eq!(LogLevel::from("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::from("unknown"), LogLevel::Info);
        assert_eq!(Level::from(LogLevel::Trace), Level::TRACE);
    }

    #[test]
    fn test_default_filter() {
        assert_eq!(
            default_filter(LogLevel::Debug),
            "mpc_keysign=debug,tower_http=debug,axum=debug"
        );
    }
}
