//! Event horizon policy
//!
//! Maps the distance between "now" and an event's start time to the sync
//! frequency the event needs and the priority its jobs are dispatched with.
//! Both functions are pure: given the same `now` they always return the same
//! answer, so the scheduler can be tested against a fixed clock.
//!
//! | Horizon (start - now)      | Frequency | Priority |
//! |----------------------------|-----------|----------|
//! | started more than 1h ago   | 0 (stop)  | 1        |
//! | up to 1h (incl. running)   | 1 min     | 1        |
//! | up to 4h                   | 1 min     | 2        |
//! | up to 24h                  | 5 min     | 3        |
//! | beyond 24h                 | 60 min    | 5        |

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// How long after its start an event keeps being synced
pub const SYNC_GRACE_AFTER_START: Duration = Duration::hours(1);

const IMMINENT_HORIZON: Duration = Duration::hours(4);
const SAME_DAY_HORIZON: Duration = Duration::hours(24);
const URGENT_PRIORITY_HORIZON: Duration = Duration::hours(1);

/// Lowest priority value (most urgent)
pub const HIGHEST_PRIORITY: u8 = 1;

/// Proximity band an event currently falls in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncBand {
    /// More than an hour past the start; no further syncs
    Finished,
    /// Within 4h of the start, or started less than an hour ago
    Imminent,
    /// Within 24h of the start
    SameDay,
    /// More than 24h away
    Distant,
}

impl SyncBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Finished => "finished",
            Self::Imminent => "imminent",
            Self::SameDay => "same_day",
            Self::Distant => "distant",
        }
    }

    /// Required minutes between syncs for this band
    pub fn frequency_minutes(&self) -> u32 {
        match self {
            Self::Finished => 0,
            Self::Imminent => 1,
            Self::SameDay => 5,
            Self::Distant => 60,
        }
    }
}

/// Frequency and priority for one event at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HorizonDecision {
    pub band: SyncBand,
    pub frequency_minutes: u32,
    pub priority: u8,
}

impl HorizonDecision {
    /// The event is over and should leave the active schedule
    pub fn is_dormant(&self) -> bool {
        self.frequency_minutes == 0
    }

    pub fn frequency(&self) -> Duration {
        Duration::minutes(i64::from(self.frequency_minutes))
    }
}

/// Band for an event starting at `event_start`
pub fn band(now: DateTime<Utc>, event_start: DateTime<Utc>) -> SyncBand {
    if now - event_start > SYNC_GRACE_AFTER_START {
        return SyncBand::Finished;
    }

    let until_start = event_start - now;
    if until_start <= IMMINENT_HORIZON {
        SyncBand::Imminent
    } else if until_start <= SAME_DAY_HORIZON {
        SyncBand::SameDay
    } else {
        SyncBand::Distant
    }
}

/// Required sync frequency in minutes; 0 means stop syncing
pub fn frequency(now: DateTime<Utc>, event_start: DateTime<Utc>) -> u32 {
    band(now, event_start).frequency_minutes()
}

/// Dispatch priority; lower values are claimed first
pub fn priority(now: DateTime<Utc>, event_start: DateTime<Utc>) -> u8 {
    let until_start = event_start - now;
    if until_start <= URGENT_PRIORITY_HORIZON {
        1
    } else if until_start <= IMMINENT_HORIZON {
        2
    } else if until_start <= SAME_DAY_HORIZON {
        3
    } else {
        5
    }
}

/// Frequency and priority as one value pair
pub fn evaluate(now: DateTime<Utc>, event_start: DateTime<Utc>) -> HorizonDecision {
    let band = band(now, event_start);
    HorizonDecision {
        band,
        frequency_minutes: band.frequency_minutes(),
        priority: priority(now, event_start),
    }
}
