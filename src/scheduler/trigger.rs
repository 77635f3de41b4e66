//! Tick trigger
//!
//! Drives the scheduler on a fixed cadence from a single background task.
//! Each tick runs on a blocking thread and is awaited before the loop looks
//! at the clock or the stop signal again, so ticks never overlap and `stop`
//! lets an in-flight tick finish.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::error::{SchedulerError, SchedulerResult};
use super::tick::{Scheduler, TickReport};
use crate::storage::CandidateWindow;

// ============================================================================
// Trigger Configuration
// ============================================================================

/// Configuration for the tick loop and candidate window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Seconds between scheduling passes
    pub tick_interval_secs: u64,

    /// How long after its start an event stays a candidate
    pub lookback_minutes: i64,

    /// How far ahead of its start an event becomes a candidate
    pub lookahead_days: i64,

    /// Run a tick immediately when the loop starts
    pub run_on_start: bool,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            lookback_minutes: 60,
            lookahead_days: 7,
            run_on_start: true,
        }
    }
}

impl TriggerConfig {
    /// Create a new config builder
    pub fn builder() -> TriggerConfigBuilder {
        TriggerConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.tick_interval_secs == 0 {
            return Err(SchedulerError::trigger_config(
                "tick_interval_secs",
                "Tick interval must be at least one second",
            ));
        }

        if self.lookback_minutes < 0 {
            return Err(SchedulerError::trigger_config(
                "lookback_minutes",
                format!("Lookback cannot be negative (got {})", self.lookback_minutes),
            ));
        }

        if self.lookahead_days <= 0 {
            return Err(SchedulerError::trigger_config(
                "lookahead_days",
                format!("Lookahead must be positive (got {})", self.lookahead_days),
            ));
        }

        Ok(())
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tick_interval_secs)
    }

    /// Candidate window described by this config
    pub fn window(&self) -> CandidateWindow {
        CandidateWindow::new(
            Duration::minutes(self.lookback_minutes),
            Duration::days(self.lookahead_days),
        )
    }
}

/// Builder for TriggerConfig
#[derive(Debug, Default)]
pub struct TriggerConfigBuilder {
    tick_interval_secs: Option<u64>,
    lookback_minutes: Option<i64>,
    lookahead_days: Option<i64>,
    run_on_start: Option<bool>,
}

impl TriggerConfigBuilder {
    /// Set tick interval
    pub fn tick_interval_secs(mut self, secs: u64) -> Self {
        self.tick_interval_secs = Some(secs);
        self
    }

    /// Set lookback window
    pub fn lookback_minutes(mut self, minutes: i64) -> Self {
        self.lookback_minutes = Some(minutes);
        self
    }

    /// Set lookahead window
    pub fn lookahead_days(mut self, days: i64) -> Self {
        self.lookahead_days = Some(days);
        self
    }

    /// Run a tick as soon as the loop starts
    pub fn run_on_start(mut self, value: bool) -> Self {
        self.run_on_start = Some(value);
        self
    }

    /// Build the config
    pub fn build(self) -> SchedulerResult<TriggerConfig> {
        let defaults = TriggerConfig::default();
        let config = TriggerConfig {
            tick_interval_secs: self.tick_interval_secs.unwrap_or(defaults.tick_interval_secs),
            lookback_minutes: self.lookback_minutes.unwrap_or(defaults.lookback_minutes),
            lookahead_days: self.lookahead_days.unwrap_or(defaults.lookahead_days),
            run_on_start: self.run_on_start.unwrap_or(defaults.run_on_start),
        };
        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// Tick Events
// ============================================================================

/// Events emitted by the tick loop
#[derive(Debug, Clone)]
pub enum TickEvent {
    /// A scheduling pass finished
    Completed { report: TickReport },

    /// A pass was due while another was still running
    Skipped { at: DateTime<Utc> },

    /// A pass aborted; the next cadence retries
    Failed {
        at: DateTime<Utc>,
        reason: String,
        recoverable: bool,
    },

    /// The loop exited after a stop request
    Stopped,
}

/// Loop bookkeeping exposed through `status`
#[derive(Debug, Clone, Default, Serialize)]
pub struct TriggerStatus {
    pub is_running: bool,
    pub tick_interval_secs: u64,
    pub ticks_completed: u64,
    pub ticks_failed: u64,
    pub ticks_skipped: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_report: Option<TickReport>,
}

// ============================================================================
// Tick Trigger
// ============================================================================

struct RunningLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Background driver for [`Scheduler::try_tick`]
pub struct TickTrigger {
    config: TriggerConfig,
    scheduler: Arc<Scheduler>,
    event_sender: broadcast::Sender<TickEvent>,
    status: Arc<RwLock<TriggerStatus>>,
    running: Mutex<Option<RunningLoop>>,
}

impl TickTrigger {
    /// Create a new tick trigger
    pub fn new(config: TriggerConfig, scheduler: Arc<Scheduler>) -> SchedulerResult<Self> {
        config.validate()?;

        let (event_sender, _) = broadcast::channel(100);
        let status = TriggerStatus {
            tick_interval_secs: config.tick_interval_secs,
            ..Default::default()
        };

        Ok(Self {
            config,
            scheduler,
            event_sender,
            status: Arc::new(RwLock::new(status)),
            running: Mutex::new(None),
        })
    }

    /// Subscribe to tick events
    pub fn subscribe(&self) -> broadcast::Receiver<TickEvent> {
        self.event_sender.subscribe()
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    /// Spawn the tick loop in the background
    pub async fn start(&self) -> SchedulerResult<()> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(
            self.config.clone(),
            self.scheduler.clone(),
            self.event_sender.clone(),
            self.status.clone(),
            shutdown_rx,
        ));

        self.status.write().await.is_running = true;
        *running = Some(RunningLoop { shutdown, handle });

        tracing::info!(
            interval_secs = self.config.tick_interval_secs,
            run_on_start = self.config.run_on_start,
            "Tick loop started"
        );
        Ok(())
    }

    /// Stop the loop, waiting for an in-flight tick to finish
    pub async fn stop(&self) -> SchedulerResult<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };

        let _ = running.shutdown.send(true);
        let result = running.handle.await;
        self.status.write().await.is_running = false;

        result.map_err(|e| SchedulerError::TaskFailed {
            reason: e.to_string(),
        })?;
        tracing::info!("Tick loop stopped");
        Ok(())
    }

    /// Check if the loop is running
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Get loop status
    pub async fn status(&self) -> TriggerStatus {
        let mut status = self.status.read().await.clone();
        status.is_running = self.is_running().await;
        status
    }
}

async fn run_loop(
    config: TriggerConfig,
    scheduler: Arc<Scheduler>,
    events: broadcast::Sender<TickEvent>,
    status: Arc<RwLock<TriggerStatus>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = config.tick_interval();
    let first = if config.run_on_start {
        Instant::now()
    } else {
        Instant::now() + period
    };
    let mut interval = tokio::time::interval_at(first, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Utc::now();
                let sched = scheduler.clone();
                let outcome = tokio::task::spawn_blocking(move || sched.try_tick(now)).await;

                let event = match outcome {
                    Ok(Ok(Some(report))) => TickEvent::Completed { report },
                    Ok(Ok(None)) => TickEvent::Skipped { at: now },
                    Ok(Err(e)) => TickEvent::Failed {
                        at: now,
                        recoverable: e.is_recoverable(),
                        reason: e.to_string(),
                    },
                    Err(e) => {
                        tracing::error!(error = %e, "Tick task panicked");
                        TickEvent::Failed {
                            at: now,
                            recoverable: true,
                            reason: e.to_string(),
                        }
                    }
                };

                record_status(&status, &event, now).await;
                let _ = events.send(event);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    let _ = events.send(TickEvent::Stopped);
}

async fn record_status(status: &RwLock<TriggerStatus>, event: &TickEvent, now: DateTime<Utc>) {
    let mut status = status.write().await;
    match event {
        TickEvent::Completed { report } => {
            status.ticks_completed += 1;
            status.last_tick_at = Some(now);
            status.last_error = None;
            status.last_report = Some(report.clone());
        }
        TickEvent::Skipped { .. } => status.ticks_skipped += 1,
        TickEvent::Failed { reason, .. } => {
            status.ticks_failed += 1;
            status.last_tick_at = Some(now);
            status.last_error = Some(reason.clone());
        }
        TickEvent::Stopped => {}
    }
}

// ============================================================================
// Tests
// ============================================================================
