//! Per-event schedule bookkeeping
//!
//! The schedule table is a best-effort cache owned by the scheduler. It is
//! rebuilt from the catalog on every tick, so losing it (restart, crash) only
//! costs the first tick a little more work.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::models::{EventKey, SyncCandidate};
use crate::policy::{HorizonDecision, SyncBand};

// ============================================================================
// Sync State
// ============================================================================

/// What an event needs on this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Never fully synced; eligible immediately
    NeedsFullSync,
    /// Due for a "changed since" refresh
    NeedsIncremental { last_sync: DateTime<Utc> },
    /// Synced recently enough; next refresh at `next_due`
    UpToDate { next_due: DateTime<Utc> },
    /// Event is over; stop tracking
    Dormant,
}

impl SyncState {
    /// Classify a candidate given the horizon decision for it
    pub fn decide(
        now: DateTime<Utc>,
        candidate: &SyncCandidate,
        decision: &HorizonDecision,
    ) -> Self {
        if decision.is_dormant() {
            return Self::Dormant;
        }

        let last_sync = match candidate.last_successful_sync {
            Some(last) if candidate.full_sync_completed => last,
            _ => return Self::NeedsFullSync,
        };

        let next_due = last_sync + decision.frequency();
        if now >= next_due {
            Self::NeedsIncremental { last_sync }
        } else {
            Self::UpToDate { next_due }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NeedsFullSync => "needs_full_sync",
            Self::NeedsIncremental { .. } => "needs_incremental",
            Self::UpToDate { .. } => "up_to_date",
            Self::Dormant => "dormant",
        }
    }

    /// Earliest time this event should produce work
    pub fn next_eligible_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::NeedsFullSync | Self::NeedsIncremental { .. } => Some(now),
            Self::UpToDate { next_due } => Some(*next_due),
            Self::Dormant => None,
        }
    }
}

// ============================================================================
// Schedule Entry
// ============================================================================

/// In-memory bookkeeping for one tracked event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleEntry {
    pub key: EventKey,
    pub band: SyncBand,
    pub frequency_minutes: u32,
    pub priority: u8,
    pub state: &'static str,
    pub last_evaluated: DateTime<Utc>,
    pub next_eligible_at: DateTime<Utc>,
    /// Last tick that inserted a job for this event
    pub last_enqueued_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Schedule Table
// ============================================================================

/// Map of tracked event to its schedule entry
#[derive(Debug, Default)]
pub struct ScheduleTable {
    entries: HashMap<EventKey, ScheduleEntry>,
}

impl ScheduleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an evaluation. Keeps `last_enqueued_at` from the previous entry
    /// unless this evaluation enqueued something.
    pub fn record(
        &mut self,
        key: &EventKey,
        decision: &HorizonDecision,
        state: &SyncState,
        now: DateTime<Utc>,
        enqueued: bool,
    ) {
        let previous_enqueue = self.entries.get(key).and_then(|e| e.last_enqueued_at);
        let entry = ScheduleEntry {
            key: key.clone(),
            band: decision.band,
            frequency_minutes: decision.frequency_minutes,
            priority: decision.priority,
            state: state.as_str(),
            last_evaluated: now,
            next_eligible_at: state.next_eligible_at(now).unwrap_or(now),
            last_enqueued_at: if enqueued { Some(now) } else { previous_enqueue },
        };
        self.entries.insert(key.clone(), entry);
    }

    pub fn remove(&mut self, key: &EventKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop entries not evaluated in the current pass; returns how many went
    pub fn retain_evaluated_at(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.last_evaluated == now);
        before - self.entries.len()
    }

    pub fn get(&self, key: &EventKey) -> Option<&ScheduleEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &EventKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries ordered by next eligible time
    pub fn snapshot(&self) -> Vec<ScheduleEntry> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.next_eligible_at
                .cmp(&b.next_eligible_at)
                .then_with(|| a.key.cmp(&b.key))
        });
        entries
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 12, 6, 0, 0).unwrap()
    }

    fn candidate(start: DateTime<Utc>, last: Option<DateTime<Utc>>, full: bool) -> SyncCandidate {
        SyncCandidate {
            key: EventKey::new("acme", "runsignup", "e1"),
            start_time: Some(start),
            last_successful_sync: last,
            full_sync_completed: full,
            events_listed: full,
            linked: true,
        }
    }

    #[test]
    fn test_never_synced_needs_full_sync() {
        let start = now() + Duration::hours(30);
        let decision = policy::evaluate(now(), start);
        let state = SyncState::decide(now(), &candidate(start, None, false), &decision);
        assert_eq!(state, SyncState::NeedsFullSync);
    }

    #[test]
    fn test_incremental_when_frequency_elapsed() {
        let start = now() + Duration::hours(2);
        let last = now() - Duration::minutes(3);
        let decision = policy::evaluate(now(), start);
        let state = SyncState::decide(now(), &candidate(start, Some(last), true), &decision);
        assert_eq!(state, SyncState::NeedsIncremental { last_sync: last });
    }

    #[test]
    fn test_up_to_date_within_frequency() {
        let start = now() + Duration::hours(30);
        let last = now() - Duration::minutes(20);
        let decision = policy::evaluate(now(), start);
        let state = SyncState::decide(now(), &candidate(start, Some(last), true), &decision);
        assert_eq!(
            state,
            SyncState::UpToDate {
                next_due: last + Duration::minutes(60)
            }
        );
    }

    #[test]
    fn test_dormant_takes_precedence() {
        let start = now() - Duration::minutes(90);
        let decision = policy::evaluate(now(), start);
        let state = SyncState::decide(now(), &candidate(start, None, false), &decision);
        assert_eq!(state, SyncState::Dormant);
    }

    #[test]
    fn test_table_prunes_unevaluated_entries() {
        let mut table = ScheduleTable::new();
        let decision = policy::evaluate(now(), now() + Duration::hours(3));
        let a = EventKey::new("acme", "runsignup", "a");
        let b = EventKey::new("acme", "runsignup", "b");

        table.record(&a, &decision, &SyncState::NeedsFullSync, now(), true);
        table.record(&b, &decision, &SyncState::NeedsFullSync, now(), true);

        let later = now() + Duration::minutes(1);
        table.record(&a, &decision, &SyncState::NeedsFullSync, later, false);
        assert_eq!(table.retain_evaluated_at(later), 1);
        assert!(table.contains(&a));
        assert!(!table.contains(&b));

        // Enqueue timestamp survives a pass that enqueued nothing
        assert_eq!(table.get(&a).unwrap().last_enqueued_at, Some(now()));
    }
}
