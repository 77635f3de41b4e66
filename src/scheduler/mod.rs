//! Adaptive sync scheduler
//!
//! Decides, for every tracked event, whether it needs a refresh and how
//! urgently, and turns that decision into durable jobs in the queue.
//!
//! # Overview
//!
//! ```text
//! ┌─────────────┐   candidates   ┌─────────────┐   enqueue    ┌───────────┐
//! │ SyncCatalog │ ─────────────▶ │  Scheduler  │ ───────────▶ │ JobQueue  │
//! └─────────────┘                │  (policy)   │              └─────┬─────┘
//!        ▲                       └──────▲──────┘                    │ claim
//!        │ outcomes                     │ tick                      ▼
//!        │                       ┌──────┴──────┐              ┌───────────┐
//!        └────────────────────── │ TickTrigger │              │  Workers  │
//!                                └─────────────┘              └───────────┘
//! ```
//!
//! Per event per tick the scheduler picks one of:
//!
//! - **NeedsFullSync**: never fully synced; enqueue "events" and
//!   "participants" full-sync jobs at the same priority
//! - **NeedsIncremental**: the required frequency has elapsed since the last
//!   successful participants sync; enqueue one incremental "participants" job
//! - **UpToDate**: nothing to do yet
//! - **Dormant**: the event is over; drop it from the schedule table
//!
//! Enqueue is idempotent in the job store, so re-running a tick (or racing a
//! manual trigger) never duplicates queued work.
//!
//! # Modules
//!
//! - [`tick`] - The scheduling pass and manual trigger
//! - [`schedule`] - In-memory schedule table and per-event state
//! - [`trigger`] - Fixed-cadence background loop
//! - [`error`] - Scheduler errors
//!
//! # Configuration
//!
//! | Setting | Default | Description |
//! |---------|---------|-------------|
//! | `tick_interval_secs` | 60 | Seconds between passes |
//! | `lookback_minutes` | 60 | Events started this long ago are still candidates |
//! | `lookahead_days` | 7 | Events starting within this range are candidates |
//! | `run_on_start` | true | Tick immediately when the loop starts |

pub mod error;
pub mod schedule;
pub mod tick;
pub mod trigger;

// Re-export main types
pub use error::{SchedulerError, SchedulerResult};
pub use schedule::{ScheduleEntry, ScheduleTable, SyncState};
pub use tick::{ManualSyncReport, Scheduler, TickReport};
pub use trigger::{TickEvent, TickTrigger, TriggerConfig, TriggerConfigBuilder, TriggerStatus};
