//! Logging Infrastructure
//!
//! The runtime logs through `tracing`. This module installs a
//! `tracing-subscriber` formatter for hosts that do not bring their own.
//!
//! # Filtering
//!
//! `RUST_LOG` takes precedence when set. Otherwise the configured
//! [`LogLevel`] applies to every target.
//!
//! # Example
//!
//! ```rust,ignore
//! use linmem_runtime::{init_logging, LinearMemoryConfig};
//!
//! let config = LinearMemoryConfig::from_env();
//! init_logging(&config.log)?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogLevel};

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Failure to install the global subscriber.
#[derive(Debug, Error)]
pub enum LogInitError {
    /// The `RUST_LOG` directive could not be parsed.
    #[error("invalid log filter '{directive}': {message}")]
    InvalidFilter {
        /// Offending directive.
        directive: String,
        /// Parser message.
        message: String,
    },

    /// Another global subscriber is already installed.
    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled,
}

/// Build the filter for `level`, letting `RUST_LOG` override it.
pub fn env_filter(level: LogLevel) -> Result<EnvFilter, LogInitError> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directive) if !directive.is_empty() => {
            EnvFilter::try_new(&directive).map_err(|e| LogInitError::InvalidFilter {
                directive,
                message: e.to_string(),
            })
        }
        _ => Ok(EnvFilter::new(level.as_str())),
    }
}

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> Result<(), LogInitError> {
    let filter = env_filter(config.level)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(config.thread_names)
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .try_init()
        .map_err(|_| LogInitError::AlreadyInstalled)?;
    INSTALLED.store(true, Ordering::Release);
    Ok(())
}

/// Install the subscriber if none has been installed through this module.
///
/// Repeated calls, and calls after a host installed its own subscriber, are
/// ignored.
pub fn try_init_logging(config: &LogConfig) {
    if INSTALLED.load(Ordering::Acquire) {
        return;
    }
    let _ = init_logging(config);
}

/// Whether [`init_logging`] installed the global subscriber.
pub fn is_installed() -> bool {
    INSTALLED.load(Ordering::Acquire)
}
