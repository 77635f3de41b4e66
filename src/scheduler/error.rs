//! Error types for the scheduler module

use std::fmt;

use crate::storage::StoreError;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler-specific errors
#[derive(Debug)]
pub enum SchedulerError {
    /// Event cannot be scheduled from the data on hand (missing start time,
    /// missing or disabled tenant/provider linkage)
    PolicyInput {
        event: String,
        reason: String,
    },

    /// Catalog or job store failure
    Storage {
        operation: String,
        source: StoreError,
    },

    /// Manual trigger named an event the catalog does not track
    EventNotFound {
        event: String,
    },

    /// Manual trigger with an empty tenant or provider
    InvalidTarget {
        reason: String,
    },

    /// Trigger configuration error
    TriggerConfigError {
        field: String,
        reason: String,
    },

    /// Start requested while the tick loop is already running
    AlreadyRunning,

    /// Background task ended abnormally
    TaskFailed {
        reason: String,
    },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PolicyInput { event, reason } => {
                write!(f, "Cannot schedule event '{}': {}", event, reason)
            }
            Self::Storage { operation, source } => {
                write!(f, "Storage error during '{}': {}", operation, source)
            }
            Self::EventNotFound { event } => {
                write!(f, "Event not tracked: {}", event)
            }
            Self::InvalidTarget { reason } => {
                write!(f, "Invalid sync target: {}", reason)
            }
            Self::TriggerConfigError { field, reason } => {
                write!(f, "Trigger config error in '{}': {}", field, reason)
            }
            Self::AlreadyRunning => write!(f, "Scheduler is already running"),
            Self::TaskFailed { reason } => {
                write!(f, "Scheduler task failed: {}", reason)
            }
        }
    }
}

impl std::error::Error for SchedulerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<StoreError> for SchedulerError {
    fn from(err: StoreError) -> Self {
        Self::Storage {
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl SchedulerError {
    /// Create a policy input error
    pub fn policy_input(event: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PolicyInput {
            event: event.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a storage error with the operation that failed
    pub fn storage(operation: impl Into<String>, source: StoreError) -> Self {
        Self::Storage {
            operation: operation.into(),
            source,
        }
    }

    /// Create an event not found error
    pub fn event_not_found(event: impl Into<String>) -> Self {
        Self::EventNotFound {
            event: event.into(),
        }
    }

    /// Create a trigger config error
    pub fn trigger_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TriggerConfigError {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Storage { source, .. } => source.is_transient(),
            Self::PolicyInput { .. } | Self::TaskFailed { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_input_error() {
        let err = SchedulerError::policy_input("acme/runsignup/e1", "missing start time");
        assert!(err.to_string().contains("acme/runsignup/e1"));
        assert!(err.to_string().contains("missing start time"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_storage_error_keeps_source() {
        let err = SchedulerError::storage("list_candidates", StoreError::LockPoisoned);
        assert!(err.to_string().contains("list_candidates"));
        assert!(std::error::Error::source(&err).is_some());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_is_recoverable() {
        let busy = SchedulerError::from(StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        )));
        assert!(busy.is_recoverable());

        let config_err = SchedulerError::trigger_config("tick_interval_secs", "must be > 0");
        assert!(!config_err.is_recoverable());
        assert!(!SchedulerError::event_not_found("x").is_recoverable());
    }
}
