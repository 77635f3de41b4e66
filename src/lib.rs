//! racesync - Adaptive sync scheduler for race-registration providers
//!
//! Keeps locally tracked race events in step with the registration
//! providers that own them. A periodic tick reads the sync catalog, asks the
//! event horizon policy how often each event should refresh given how close
//! its start is, and enqueues deduplicated, prioritized jobs into a durable
//! SQLite job queue. Workers claim jobs atomically and record outcomes.
//!
//! # Architecture
//!
//! - [`policy`] - Event horizon policy: frequency and priority by time-to-start
//! - [`storage`] - SQLite bootstrap, sync catalog and job queue
//! - [`scheduler`] - Tick, schedule table and the periodic trigger
//! - [`engine`] - Composition root: start, stop, manual sync, inspection
//! - [`watchdog`] - Stuck job detection and requeue
//! - [`worker`] - Reference worker and provider client seam
//! - [`server`] - Operator HTTP API
//! - [`metrics`] - Prometheus metrics
//! - [`config`] - Configuration management
//! - [`models`] - Core data structures and types
//!
//! # Example
//!
//! ```no_run
//! use racesync::config::Config;
//! use racesync::engine::SyncEngine;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let engine = SyncEngine::start(&config).await?;
//!     engine.handle().manual_sync("acme", "runsignup", None).await?;
//!     engine.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod models;
pub mod policy;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod watchdog;
pub mod worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::engine::{EngineHandle, SyncEngine};
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::models::{
        EventKey, JobCompletion, JobPayload, JobStatus, NewSyncJob, OperationKind, SyncCandidate,
        SyncJob, SyncTrigger,
    };
    pub use crate::scheduler::{Scheduler, TickReport};
    pub use crate::storage::{Database, JobQueue, SqliteJobStore, SqliteSyncCatalog, SyncCatalog};
}

// Direct re-exports for convenience
pub use models::{EventKey, JobStatus, OperationKind, SyncJob};
