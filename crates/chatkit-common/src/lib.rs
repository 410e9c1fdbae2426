//! # ChatKit Common
//!
//! Common utilities, error types, and logging configuration shared by the ChatKit crates.
//!
//! ## Features
//!
//! - Unified error type with backtrace support for internal failures
//! - Logging configuration and setup
//! - Injectable wall clock
//! - Timeout and cancellation helpers
//! - JSON configuration loading

use std::time::Duration;
use thiserror::Error;

pub mod clock;
pub mod config;
pub mod logging;
pub mod timeout;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::load_json_config;
pub use logging::{init_logging, LogConfig, LogFormat};
pub use timeout::{with_cancel, with_timeout};

/// Unified error type for ChatKit.
#[derive(Error, Debug)]
pub enum ChatKitError {
    /// Network-related errors.
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Persistent store errors.
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Cancelled operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<backtrace::Backtrace>,
    },
}

impl ChatKitError {
    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create a storage error with source.
    pub fn storage_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create an internal error with backtrace.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            backtrace: Some(backtrace::Backtrace::new()),
        }
    }

    /// Whether the failure is expected to clear up on its own (connectivity, timeouts).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChatKitError::Network { .. } | ChatKitError::Timeout(_) | ChatKitError::Cancelled
        )
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            ChatKitError::Network { .. } => "network",
            ChatKitError::Storage { .. } => "storage",
            ChatKitError::Config { .. } => "config",
            ChatKitError::Io(_) => "io",
            ChatKitError::Json(_) => "json",
            ChatKitError::Timeout(_) => "timeout",
            ChatKitError::Cancelled => "cancelled",
            ChatKitError::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for ChatKit operations.
pub type Result<T> = std::result::Result<T, ChatKitError>;
