//! Stuck job watchdog
//!
//! A worker that dies mid-job leaves its job `running` forever. The watchdog
//! periodically finds jobs whose claim is older than the stuck timeout and
//! either hands them back to the queue or, once they have used their attempt
//! budget, fails them with an outcome record.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::metrics;
use crate::models::SyncJob;
use crate::storage::{JobQueue, RequeueReport, StoreResult};

// ============================================================================
// Watchdog Configuration
// ============================================================================

/// Configuration for stuck-job detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Run the periodic sweep inside the engine
    pub enabled: bool,

    /// A running job older than this is considered stuck
    pub stuck_timeout_minutes: i64,

    /// Claims allowed before a stuck job is failed instead of requeued
    pub max_attempts: u32,

    /// Seconds between sweeps
    pub sweep_interval_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stuck_timeout_minutes: 60,
            max_attempts: 3,
            sweep_interval_secs: 300,
        }
    }
}

impl WatchdogConfig {
    pub fn stuck_timeout(&self) -> Duration {
        Duration::minutes(self.stuck_timeout_minutes)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.stuck_timeout_minutes <= 0 {
            return Err("watchdog.stuck_timeout_minutes must be positive".to_string());
        }
        if self.max_attempts == 0 {
            return Err("watchdog.max_attempts must be at least 1".to_string());
        }
        if self.sweep_interval_secs == 0 {
            return Err("watchdog.sweep_interval_secs must be positive".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Watchdog
// ============================================================================

pub struct Watchdog {
    queue: Arc<dyn JobQueue>,
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(queue: Arc<dyn JobQueue>, config: WatchdogConfig) -> Self {
        Self { queue, config }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Claim cutoff for "stuck" at `now`
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.config.stuck_timeout()
    }

    /// Jobs that would be handled by a sweep at `now`
    pub fn find_stuck(&self, now: DateTime<Utc>) -> StoreResult<Vec<SyncJob>> {
        self.queue.find_stuck(self.cutoff(now))
    }

    /// Requeue or fail every job stuck at `now`
    pub fn sweep(&self, now: DateTime<Utc>) -> StoreResult<RequeueReport> {
        let report = self
            .queue
            .requeue_stuck(self.cutoff(now), self.config.max_attempts)?;

        metrics::record_requeue(report.requeued.len(), report.failed.len());
        if !report.is_empty() {
            tracing::warn!(
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                timeout_minutes = self.config.stuck_timeout_minutes,
                "Watchdog handled stuck jobs"
            );
        }
        Ok(report)
    }

    /// Run `sweep` every `sweep_interval_secs` until `shutdown` flips
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = std::time::Duration::from_secs(self.config.sweep_interval_secs);
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let watchdog = self.clone();
                        let result =
                            tokio::task::spawn_blocking(move || watchdog.sweep(Utc::now())).await;
                        match result {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => tracing::error!(error = %e, "Watchdog sweep failed"),
                            Err(e) => tracing::error!(error = %e, "Watchdog task panicked"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Watchdog stopped");
        })
    }
}
