//! The scheduling pass
//!
//! One tick reads the candidate set, applies the horizon policy to every
//! event, and enqueues whatever is due. Ticks never overlap: a tick that
//! starts while another is in flight returns immediately with `None`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use super::error::{SchedulerError, SchedulerResult};
use super::schedule::{ScheduleEntry, ScheduleTable, SyncState};
use crate::metrics;
use crate::models::{
    EventKey, JobId, JobPayload, NewSyncJob, OperationKind, SyncCandidate, SyncTrigger,
};
use crate::policy::{self, HorizonDecision, HIGHEST_PRIORITY};
use crate::storage::{CandidateWindow, JobQueue, SyncCatalog};

// ============================================================================
// Reports
// ============================================================================

/// Summary of one scheduling pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub started_at: Option<DateTime<Utc>>,
    pub candidates: usize,
    pub jobs_enqueued: usize,
    pub already_queued: usize,
    pub full_syncs: usize,
    pub incremental_syncs: usize,
    pub up_to_date: usize,
    pub dormant: usize,
    pub policy_skipped: usize,
    pub pruned: usize,
    pub enqueued_job_ids: Vec<JobId>,
}

/// Result of a manual trigger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManualSyncReport {
    pub tenant_id: String,
    pub provider_id: String,
    pub event_id: Option<String>,
    pub events_matched: usize,
    pub enqueued_job_ids: Vec<JobId>,
    pub already_queued: usize,
    pub skipped: usize,
}

enum EnqueueResult {
    Inserted(JobId),
    AlreadyQueued,
}

// ============================================================================
// Reentrancy Guard
// ============================================================================

struct TickGuard<'a>(&'a AtomicBool);

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Adaptive sync scheduler
///
/// Owns the in-memory schedule table; talks to workers only through the job
/// queue. All methods are blocking (SQLite), so async callers should run them
/// on a blocking thread.
pub struct Scheduler {
    catalog: Arc<dyn SyncCatalog>,
    queue: Arc<dyn JobQueue>,
    window: CandidateWindow,
    table: Mutex<ScheduleTable>,
    tick_in_progress: AtomicBool,
}

impl Scheduler {
    pub fn new(
        catalog: Arc<dyn SyncCatalog>,
        queue: Arc<dyn JobQueue>,
        window: CandidateWindow,
    ) -> Self {
        Self {
            catalog,
            queue,
            window,
            table: Mutex::new(ScheduleTable::new()),
            tick_in_progress: AtomicBool::new(false),
        }
    }

    pub fn window(&self) -> &CandidateWindow {
        &self.window
    }

    pub fn is_ticking(&self) -> bool {
        self.tick_in_progress.load(Ordering::Acquire)
    }

    /// Run one scheduling pass at `now`
    ///
    /// Returns `Ok(None)` when another pass is still running. A catalog
    /// failure aborts the pass before anything is enqueued.
    pub fn try_tick(&self, now: DateTime<Utc>) -> SchedulerResult<Option<TickReport>> {
        let Some(_guard) = TickGuard::acquire(&self.tick_in_progress) else {
            tracing::debug!("Tick already in progress, skipping");
            metrics::record_tick("skipped", 0.0);
            return Ok(None);
        };

        let started = Instant::now();
        let result = self.run_tick(now);
        let elapsed = started.elapsed().as_secs_f64();

        match &result {
            Ok(report) => {
                metrics::record_tick("ok", elapsed);
                tracing::info!(
                    candidates = report.candidates,
                    enqueued = report.jobs_enqueued,
                    already_queued = report.already_queued,
                    up_to_date = report.up_to_date,
                    dormant = report.dormant,
                    skipped = report.policy_skipped,
                    elapsed_ms = (elapsed * 1000.0) as u64,
                    "Scheduler tick complete"
                );
            }
            Err(e) => {
                metrics::record_tick("failed", elapsed);
                tracing::error!(error = %e, recoverable = e.is_recoverable(), "Scheduler tick aborted");
            }
        }

        result.map(Some)
    }

    fn run_tick(&self, now: DateTime<Utc>) -> SchedulerResult<TickReport> {
        let candidates = self
            .catalog
            .list_candidates(now, &self.window)
            .map_err(|e| SchedulerError::storage("list_candidates", e))?;

        let mut report = TickReport {
            started_at: Some(now),
            candidates: candidates.len(),
            ..Default::default()
        };
        let mut table = self.table();

        for candidate in &candidates {
            let (start, decision) = match Self::validate(now, candidate) {
                Ok(valid) => valid,
                Err((reason_label, err)) => {
                    tracing::warn!(
                        tenant_id = %candidate.key.tenant_id,
                        provider_id = %candidate.key.provider_id,
                        event_id = %candidate.key.event_id,
                        error = %err,
                        "Skipping event"
                    );
                    metrics::record_policy_skip(reason_label);
                    report.policy_skipped += 1;
                    table.remove(&candidate.key);
                    continue;
                }
            };

            let state = SyncState::decide(now, candidate, &decision);
            let mut enqueued_any = false;

            match state {
                SyncState::Dormant => {
                    if table.remove(&candidate.key) {
                        tracing::debug!(event = %candidate.key, %start, "Event finished, dropped from schedule");
                    }
                    report.dormant += 1;
                    continue;
                }
                SyncState::UpToDate { .. } => {
                    report.up_to_date += 1;
                }
                SyncState::NeedsFullSync => {
                    report.full_syncs += 1;
                    let payload = JobPayload::full(SyncTrigger::Scheduled);
                    // Once the listing succeeded only participants remain outstanding
                    let kinds: &[OperationKind] = if candidate.events_listed {
                        &[OperationKind::Participants]
                    } else {
                        &[OperationKind::Events, OperationKind::Participants]
                    };
                    for &kind in kinds {
                        enqueued_any |= self.enqueue_into(
                            &mut report,
                            &candidate.key,
                            kind,
                            decision.priority,
                            payload.clone(),
                            now,
                        )?;
                    }
                }
                SyncState::NeedsIncremental { last_sync } => {
                    report.incremental_syncs += 1;
                    enqueued_any = self.enqueue_into(
                        &mut report,
                        &candidate.key,
                        OperationKind::Participants,
                        decision.priority,
                        JobPayload::incremental(last_sync),
                        now,
                    )?;
                }
            }

            table.record(&candidate.key, &decision, &state, now, enqueued_any);
        }

        report.pruned = table.retain_evaluated_at(now);
        metrics::set_tracked_events(table.len());

        Ok(report)
    }

    /// Reject candidates the policy cannot be applied to
    fn validate(
        now: DateTime<Utc>,
        candidate: &SyncCandidate,
    ) -> Result<(DateTime<Utc>, HorizonDecision), (&'static str, SchedulerError)> {
        let event = candidate.key.to_string();
        if !candidate.key.is_well_formed() {
            return Err((
                "malformed_key",
                SchedulerError::policy_input(event, "tenant, provider and event ids must be non-empty"),
            ));
        }
        if !candidate.linked {
            return Err((
                "unlinked",
                SchedulerError::policy_input(event, "no enabled credential for tenant and provider"),
            ));
        }
        let Some(start) = candidate.start_time else {
            return Err((
                "missing_start_time",
                SchedulerError::policy_input(event, "missing or unreadable start time"),
            ));
        };
        Ok((start, policy::evaluate(now, start)))
    }

    fn enqueue(
        &self,
        key: &EventKey,
        kind: OperationKind,
        priority: u8,
        payload: JobPayload,
        now: DateTime<Utc>,
    ) -> SchedulerResult<EnqueueResult> {
        let trigger = match payload.trigger {
            SyncTrigger::Scheduled => "scheduled",
            SyncTrigger::Manual => "manual",
        };
        let job = NewSyncJob::new(key.clone(), kind, priority, payload, now);
        let result = self
            .queue
            .enqueue(&job)
            .map_err(|e| SchedulerError::storage("enqueue", e))?;

        metrics::record_enqueue(kind.as_str(), trigger, result.is_some());
        Ok(match result {
            Some(id) => EnqueueResult::Inserted(id),
            None => EnqueueResult::AlreadyQueued,
        })
    }

    fn enqueue_into(
        &self,
        report: &mut TickReport,
        key: &EventKey,
        kind: OperationKind,
        priority: u8,
        payload: JobPayload,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        match self.enqueue(key, kind, priority, payload, now)? {
            EnqueueResult::Inserted(id) => {
                report.jobs_enqueued += 1;
                report.enqueued_job_ids.push(id);
                Ok(true)
            }
            EnqueueResult::AlreadyQueued => {
                report.already_queued += 1;
                Ok(false)
            }
        }
    }

    /// Operator-triggered sync for one provider, or one event of it
    ///
    /// Enqueues a full "events" and "participants" job per matching event
    /// through the same dedup-safe path the tick uses. An explicit event must
    /// be tracked and linked; provider-wide triggers skip events the tick
    /// would skip.
    pub fn manual_sync(
        &self,
        now: DateTime<Utc>,
        tenant_id: &str,
        provider_id: &str,
        event_id: Option<&str>,
    ) -> SchedulerResult<ManualSyncReport> {
        if tenant_id.trim().is_empty() || provider_id.trim().is_empty() {
            return Err(SchedulerError::InvalidTarget {
                reason: "tenant and provider are required".to_string(),
            });
        }

        let mut report = ManualSyncReport {
            tenant_id: tenant_id.to_string(),
            provider_id: provider_id.to_string(),
            event_id: event_id.map(str::to_string),
            ..Default::default()
        };

        let targets: Vec<(EventKey, u8)> = match event_id {
            Some(event_id) => {
                let key = EventKey::new(tenant_id, provider_id, event_id);
                let candidate = self
                    .catalog
                    .find_candidate(&key)
                    .map_err(|e| SchedulerError::storage("find_candidate", e))?
                    .ok_or_else(|| SchedulerError::event_not_found(key.to_string()))?;
                if !candidate.linked {
                    return Err(SchedulerError::policy_input(
                        key.to_string(),
                        "no enabled credential for tenant and provider",
                    ));
                }
                let priority = candidate
                    .start_time
                    .map(|start| policy::priority(now, start))
                    .unwrap_or(HIGHEST_PRIORITY);
                vec![(key, priority)]
            }
            None => {
                let candidates = self
                    .catalog
                    .list_for_provider(tenant_id, provider_id, now, &self.window)
                    .map_err(|e| SchedulerError::storage("list_for_provider", e))?;

                let mut targets = Vec::with_capacity(candidates.len());
                for candidate in candidates {
                    match Self::validate(now, &candidate) {
                        Ok((_, decision)) if !decision.is_dormant() => {
                            targets.push((candidate.key, decision.priority));
                        }
                        Ok(_) => report.skipped += 1,
                        Err((_, err)) => {
                            tracing::warn!(error = %err, "Manual sync skipping event");
                            report.skipped += 1;
                        }
                    }
                }
                targets
            }
        };

        report.events_matched = targets.len();
        for (key, priority) in targets {
            for kind in [OperationKind::Events, OperationKind::Participants] {
                match self.enqueue(&key, kind, priority, JobPayload::full(SyncTrigger::Manual), now)? {
                    EnqueueResult::Inserted(id) => report.enqueued_job_ids.push(id),
                    EnqueueResult::AlreadyQueued => report.already_queued += 1,
                }
            }
        }

        tracing::info!(
            tenant_id,
            provider_id,
            event_id = ?event_id,
            matched = report.events_matched,
            enqueued = report.enqueued_job_ids.len(),
            already_queued = report.already_queued,
            "Manual sync requested"
        );

        Ok(report)
    }

    /// Current schedule table, ordered by next eligible time
    pub fn schedule_snapshot(&self) -> Vec<ScheduleEntry> {
        self.table().snapshot()
    }

    pub fn tracked_count(&self) -> usize {
        self.table().len()
    }

    // The table is a rebuildable cache, so a poisoned lock just means the
    // previous holder panicked mid-update; keep using it.
    fn table(&self) -> MutexGuard<'_, ScheduleTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("window", &self.window)
            .field("tick_in_progress", &self.is_ticking())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobCompletion, JobStatus, ProviderCredential, ProviderEvent};
    use crate::storage::{Database, SqliteJobStore, SqliteSyncCatalog, StoreError, StoreResult};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 18, 12, 0, 0).unwrap()
    }

    struct Fixture {
        catalog: Arc<SqliteSyncCatalog>,
        queue: Arc<SqliteJobStore>,
        scheduler: Scheduler,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        let catalog = Arc::new(SqliteSyncCatalog::new(db.clone()));
        let queue = Arc::new(SqliteJobStore::new(db));
        catalog
            .upsert_credential(&ProviderCredential {
                tenant_id: "acme".into(),
                provider_id: "runsignup".into(),
                api_key: None,
                enabled: true,
            })
            .unwrap();
        let scheduler = Scheduler::new(
            catalog.clone(),
            queue.clone(),
            CandidateWindow::default(),
        );
        Fixture {
            catalog,
            queue,
            scheduler,
        }
    }

    fn track(f: &Fixture, provider: &str, event_id: &str, start: Option<DateTime<Utc>>) {
        f.catalog
            .upsert_event(
                "acme",
                provider,
                &ProviderEvent {
                    event_id: event_id.into(),
                    name: None,
                    start_time: start,
                },
                now(),
            )
            .unwrap();
    }

    #[test]
    fn test_tick_enqueues_full_sync_pair() {
        let f = fixture();
        track(&f, "runsignup", "e1", Some(now() + Duration::hours(30)));

        let report = f.scheduler.try_tick(now()).unwrap().unwrap();
        assert_eq!(report.jobs_enqueued, 2);
        assert_eq!(report.full_syncs, 1);

        let first = f.queue.claim_next("w").unwrap().unwrap();
        let second = f.queue.claim_next("w").unwrap().unwrap();
        assert_eq!(first.operation_kind, OperationKind::Events);
        assert_eq!(second.operation_kind, OperationKind::Participants);
        assert_eq!(first.priority, 5);
        assert_eq!(second.priority, 5);
        assert!(!second.payload.is_incremental);
    }

    #[test]
    fn test_full_sync_retry_skips_completed_events_job() {
        let f = fixture();
        track(&f, "runsignup", "e1", Some(now() + Duration::hours(30)));
        f.scheduler.try_tick(now()).unwrap().unwrap();

        let events = f.queue.claim_next("w").unwrap().unwrap();
        assert_eq!(events.operation_kind, OperationKind::Events);
        f.queue
            .complete(events.job_id, events.attempts, &JobCompletion::success(1))
            .unwrap();
        let participants = f.queue.claim_next("w").unwrap().unwrap();
        f.queue
            .complete(
                participants.job_id,
                participants.attempts,
                &JobCompletion::failed("HTTP 502"),
            )
            .unwrap();

        let retry = f.scheduler.try_tick(now() + Duration::minutes(1)).unwrap().unwrap();
        assert_eq!(retry.full_syncs, 1);
        assert_eq!(retry.jobs_enqueued, 1);

        let job = f.queue.claim_next("w").unwrap().unwrap();
        assert_eq!(job.operation_kind, OperationKind::Participants);
        assert!(!job.payload.is_incremental);
        assert!(f.queue.claim_next("w").unwrap().is_none());
    }

    #[test]
    fn test_retick_without_change_enqueues_nothing() {
        let f = fixture();
        track(&f, "runsignup", "e1", Some(now() + Duration::hours(3)));
        track(&f, "runsignup", "e2", Some(now() + Duration::days(2)));

        let first = f.scheduler.try_tick(now()).unwrap().unwrap();
        assert_eq!(first.jobs_enqueued, 4);

        let second = f.scheduler.try_tick(now()).unwrap().unwrap();
        assert_eq!(second.jobs_enqueued, 0);
        assert_eq!(second.already_queued, 4);
    }

    #[test]
    fn test_tick_skips_unlinked_and_undated_events() {
        let f = fixture();
        track(&f, "runsignup", "undated", None);
        track(&f, "raceroster", "unlinked", Some(now() + Duration::hours(2)));
        track(&f, "runsignup", "ok", Some(now() + Duration::hours(2)));

        let report = f.scheduler.try_tick(now()).unwrap().unwrap();
        assert_eq!(report.policy_skipped, 2);
        assert_eq!(report.jobs_enqueued, 2);
        assert_eq!(f.scheduler.tracked_count(), 1);
    }

    #[test]
    fn test_dormant_event_is_dropped_from_table() {
        let f = fixture();
        track(&f, "runsignup", "e1", Some(now() + Duration::minutes(30)));
        f.scheduler.try_tick(now()).unwrap();
        assert_eq!(f.scheduler.tracked_count(), 1);

        // Two hours later the event started 90 minutes ago
        let later = now() + Duration::hours(2);
        let report = f.scheduler.try_tick(later).unwrap().unwrap();
        assert_eq!(report.jobs_enqueued, 0);
        assert_eq!(f.scheduler.tracked_count(), 0);
    }

    #[test]
    fn test_tick_is_not_reentrant() {
        let f = fixture();
        let guard = TickGuard::acquire(&f.scheduler.tick_in_progress).unwrap();
        assert!(f.scheduler.try_tick(now()).unwrap().is_none());
        drop(guard);
        assert!(f.scheduler.try_tick(now()).unwrap().is_some());
    }

    #[test]
    fn test_manual_sync_single_event() {
        let f = fixture();
        track(&f, "runsignup", "e1", Some(now() + Duration::hours(2)));

        let report = f
            .scheduler
            .manual_sync(now(), "acme", "runsignup", Some("e1"))
            .unwrap();
        assert_eq!(report.events_matched, 1);
        assert_eq!(report.enqueued_job_ids.len(), 2);

        let job = f.queue.get(report.enqueued_job_ids[1]).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 2);
        assert_eq!(job.payload.trigger, SyncTrigger::Manual);

        // A second trigger hits the dedup path
        let again = f
            .scheduler
            .manual_sync(now(), "acme", "runsignup", Some("e1"))
            .unwrap();
        assert!(again.enqueued_job_ids.is_empty());
        assert_eq!(again.already_queued, 2);
    }

    #[test]
    fn test_manual_sync_unknown_event() {
        let f = fixture();
        let err = f
            .scheduler
            .manual_sync(now(), "acme", "runsignup", Some("missing"))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::EventNotFound { .. }));

        let err = f.scheduler.manual_sync(now(), "", "runsignup", None).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTarget { .. }));
    }

    #[test]
    fn test_manual_sync_whole_provider() {
        let f = fixture();
        track(&f, "runsignup", "a", Some(now() + Duration::hours(5)));
        track(&f, "runsignup", "b", Some(now() + Duration::days(3)));
        track(&f, "runsignup", "c", None);

        let report = f
            .scheduler
            .manual_sync(now(), "acme", "runsignup", None)
            .unwrap();
        assert_eq!(report.events_matched, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.enqueued_job_ids.len(), 4);
    }

    struct FailingCatalog;

    impl SyncCatalog for FailingCatalog {
        fn list_candidates(
            &self,
            _now: DateTime<Utc>,
            _window: &CandidateWindow,
        ) -> StoreResult<Vec<SyncCandidate>> {
            Err(StoreError::LockPoisoned)
        }
        fn list_for_provider(
            &self,
            _tenant_id: &str,
            _provider_id: &str,
            _now: DateTime<Utc>,
            _window: &CandidateWindow,
        ) -> StoreResult<Vec<SyncCandidate>> {
            Err(StoreError::LockPoisoned)
        }
        fn find_candidate(&self, _key: &EventKey) -> StoreResult<Option<SyncCandidate>> {
            Err(StoreError::LockPoisoned)
        }
        fn upsert_event(
            &self,
            _tenant_id: &str,
            _provider_id: &str,
            _event: &ProviderEvent,
            _now: DateTime<Utc>,
        ) -> StoreResult<bool> {
            Err(StoreError::LockPoisoned)
        }
        fn find_event(&self, _key: &EventKey) -> StoreResult<Option<crate::models::TrackedEvent>> {
            Err(StoreError::LockPoisoned)
        }
        fn list_events(
            &self,
            _tenant_id: &str,
            _provider_id: &str,
        ) -> StoreResult<Vec<crate::models::TrackedEvent>> {
            Err(StoreError::LockPoisoned)
        }
        fn upsert_credential(&self, _credential: &ProviderCredential) -> StoreResult<()> {
            Err(StoreError::LockPoisoned)
        }
        fn outcomes_for_event(
            &self,
            _key: &EventKey,
            _limit: usize,
        ) -> StoreResult<Vec<crate::models::SyncOutcomeRecord>> {
            Err(StoreError::LockPoisoned)
        }
    }

    #[test]
    fn test_catalog_failure_aborts_tick_without_enqueue() {
        let queue = Arc::new(SqliteJobStore::new(Database::in_memory().unwrap()));
        let scheduler = Scheduler::new(
            Arc::new(FailingCatalog),
            queue.clone(),
            CandidateWindow::default(),
        );

        let err = scheduler.try_tick(now()).unwrap_err();
        assert!(matches!(err, SchedulerError::Storage { .. }));
        assert!(queue.claim_next("w").unwrap().is_none());

        // Guard was released, so the next tick runs (and fails the same way)
        assert!(scheduler.try_tick(now()).is_err());
    }
}
