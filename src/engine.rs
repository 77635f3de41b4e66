//! Sync engine: composition root
//!
//! Opens storage, wires the catalog and job queue into the scheduler, and
//! owns the lifecycle of the tick loop and the watchdog sweep. The engine
//! never executes jobs itself; workers do that through the job queue.
//!
//! ```ignore
//! let engine = SyncEngine::start(&config).await?;
//! let handle = engine.handle();
//! handle.manual_sync("acme", "runsignup", None).await?;
//! engine.stop().await?;
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::ProviderJobCounts;
use crate::scheduler::{
    ManualSyncReport, ScheduleEntry, Scheduler, SchedulerError, TickEvent, TickReport,
    TickTrigger, TriggerStatus,
};
use crate::storage::{
    Database, JobQueue, RequeueReport, SqliteJobStore, SqliteSyncCatalog, SyncCatalog,
};
use crate::watchdog::Watchdog;

/// Point-in-time view of the engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    /// Distinguishes scheduler processes sharing one database in logs
    pub instance_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub database: Option<PathBuf>,
    pub tracked_events: usize,
    pub watchdog_enabled: bool,
    pub trigger: TriggerStatus,
}

struct WatchdogTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Cheap, cloneable access to a running engine for the API and CLI
#[derive(Clone)]
pub struct EngineHandle {
    scheduler: Arc<Scheduler>,
    queue: Arc<dyn JobQueue>,
    catalog: Arc<dyn SyncCatalog>,
    trigger: Arc<TickTrigger>,
    watchdog: Arc<Watchdog>,
    database: Database,
    watchdog_enabled: bool,
    instance_id: Uuid,
    started_at: DateTime<Utc>,
}

/// Composition root for the scheduler subsystem
pub struct SyncEngine {
    handle: EngineHandle,
    watchdog_task: Mutex<Option<WatchdogTask>>,
}

impl SyncEngine {
    /// Open storage and wire components without starting the tick loop
    ///
    /// A storage failure here is the one fatal error of the subsystem.
    pub fn open(config: &Config) -> Result<Self> {
        let database = Database::open(&config.database.path).map_err(|e| {
            tracing::error!(path = %config.database.path.display(), error = %e, "Cannot open sync database");
            Error::from(e)
        })?;
        Self::with_database(database, config)
    }

    /// Wire components on an already-open database
    pub fn with_database(database: Database, config: &Config) -> Result<Self> {
        config.validate().map_err(|e| Error::config(e.to_string()))?;

        let catalog: Arc<dyn SyncCatalog> = Arc::new(SqliteSyncCatalog::new(database.clone()));
        let queue: Arc<dyn JobQueue> = Arc::new(SqliteJobStore::new(database.clone()));
        let scheduler = Arc::new(Scheduler::new(
            catalog.clone(),
            queue.clone(),
            config.scheduler.window(),
        ));
        let trigger = Arc::new(TickTrigger::new(config.scheduler.clone(), scheduler.clone())?);
        let watchdog = Arc::new(Watchdog::new(queue.clone(), config.watchdog.clone()));

        Ok(Self {
            handle: EngineHandle {
                scheduler,
                queue,
                catalog,
                trigger,
                watchdog,
                database,
                watchdog_enabled: config.watchdog.enabled,
                instance_id: Uuid::new_v4(),
                started_at: Utc::now(),
            },
            watchdog_task: Mutex::new(None),
        })
    }

    /// Open storage and begin the tick loop (and watchdog) in the background
    pub async fn start(config: &Config) -> Result<Self> {
        let engine = Self::open(config)?;
        engine.begin().await?;
        Ok(engine)
    }

    /// Begin background work on an already-open engine
    pub async fn begin(&self) -> Result<()> {
        self.handle.trigger.start().await?;

        if self.handle.watchdog_enabled {
            let mut task = self.watchdog_task.lock().await;
            if task.is_none() {
                let (shutdown, rx) = watch::channel(false);
                let handle = self.handle.watchdog.clone().spawn(rx);
                *task = Some(WatchdogTask { shutdown, handle });
            }
        }

        tracing::info!(
            instance_id = %self.handle.instance_id,
            database = ?self.handle.database.path(),
            watchdog = self.handle.watchdog_enabled,
            "Sync engine started"
        );
        Ok(())
    }

    /// Halt the tick loop and the watchdog, letting an in-flight tick finish
    pub async fn stop(&self) -> Result<()> {
        self.handle.trigger.stop().await?;

        if let Some(task) = self.watchdog_task.lock().await.take() {
            let _ = task.shutdown.send(true);
            task.handle.await.map_err(|e| SchedulerError::TaskFailed {
                reason: e.to_string(),
            })?;
        }

        tracing::info!(instance_id = %self.handle.instance_id, "Sync engine stopped");
        Ok(())
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Subscribe to tick loop events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TickEvent> {
        self.handle.trigger.subscribe()
    }
}

impl EngineHandle {
    /// Enqueue full syncs now through the dedup-safe path
    pub async fn manual_sync(
        &self,
        tenant_id: &str,
        provider_id: &str,
        event_id: Option<&str>,
    ) -> Result<ManualSyncReport> {
        let scheduler = self.scheduler.clone();
        let tenant_id = tenant_id.to_string();
        let provider_id = provider_id.to_string();
        let event_id = event_id.map(str::to_string);

        let report = tokio::task::spawn_blocking(move || {
            scheduler.manual_sync(Utc::now(), &tenant_id, &provider_id, event_id.as_deref())
        })
        .await
        .map_err(|e| Error::with_source("manual sync task failed", e))??;
        Ok(report)
    }

    /// Run one scheduling pass immediately; `None` if one is already running
    pub async fn tick_now(&self) -> Result<Option<TickReport>> {
        let scheduler = self.scheduler.clone();
        let report = tokio::task::spawn_blocking(move || scheduler.try_tick(Utc::now()))
            .await
            .map_err(|e| Error::with_source("tick task failed", e))??;
        Ok(report)
    }

    /// Pending/running/success/failed counts per provider
    pub async fn job_stats(&self) -> Result<Vec<ProviderJobCounts>> {
        let queue = self.queue.clone();
        let counts = tokio::task::spawn_blocking(move || queue.counts_by_provider())
            .await
            .map_err(|e| Error::with_source("stats task failed", e))??;
        Ok(counts)
    }

    /// Run a watchdog sweep now
    pub async fn requeue_stuck(&self) -> Result<RequeueReport> {
        let watchdog = self.watchdog.clone();
        let report = tokio::task::spawn_blocking(move || watchdog.sweep(Utc::now()))
            .await
            .map_err(|e| Error::with_source("requeue task failed", e))??;
        Ok(report)
    }

    pub fn schedule(&self) -> Vec<ScheduleEntry> {
        self.scheduler.schedule_snapshot()
    }

    pub async fn status(&self) -> EngineStatus {
        EngineStatus {
            instance_id: self.instance_id,
            started_at: self.started_at,
            database: self.database.path().map(|p| p.to_path_buf()),
            tracked_events: self.scheduler.tracked_count(),
            watchdog_enabled: self.watchdog_enabled,
            trigger: self.trigger.status().await,
        }
    }

    pub fn catalog(&self) -> Arc<dyn SyncCatalog> {
        self.catalog.clone()
    }

    pub fn queue(&self) -> Arc<dyn JobQueue> {
        self.queue.clone()
    }
}
