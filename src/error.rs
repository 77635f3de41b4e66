//! Unified error handling for the racesync crate
//!
//! This module provides a unified error type that consolidates the
//! domain-specific errors of the storage, scheduler and worker layers into a
//! single `Error` enum, while keeping the domain errors usable on their own.
//!
//! # Architecture
//!
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use racesync::error::{Error, ErrorCategory};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         tracing::warn!(error = %err, "retrying on next tick");
//!     } else {
//!         tracing::error!(error = %err, "giving up");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

pub use crate::scheduler::error::SchedulerError;
pub use crate::storage::StoreError;
pub use crate::worker::WorkerError;

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Database and I/O errors
    Storage,
    /// Invalid scheduling input (missing start time, broken linkage)
    Policy,
    /// Configuration and validation errors
    Config,
    /// Scheduler lifecycle errors
    Scheduler,
    /// Errors surfaced by provider clients
    Provider,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Short lowercase name used in logs and metrics labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Storage => "storage",
            Self::Policy => "policy",
            Self::Config => "config",
            Self::Scheduler => "scheduler",
            Self::Provider => "provider",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the racesync crate
#[derive(Error, Debug)]
pub enum Error {
    /// Job store and catalog errors
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Scheduler errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Job execution errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Check if this error is recoverable (worth retrying on the next cadence)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Scheduler(e) => e.is_recoverable(),
            Self::Worker(e) => e.is_retryable(),
            Self::Io(_) => true,
            Self::Json(_) => false,
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Store(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Scheduler(SchedulerError::PolicyInput { .. }) => ErrorCategory::Policy,
            Self::Scheduler(_) => ErrorCategory::Scheduler,
            Self::Worker(WorkerError::Store(_)) => ErrorCategory::Storage,
            Self::Worker(_) => ErrorCategory::Provider,
            Self::Json(_) => ErrorCategory::Storage,
            Self::Config(_) => ErrorCategory::Config,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
