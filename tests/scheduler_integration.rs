//! Integration tests for the scheduling pass
//!
//! These tests drive the scheduler against an on-disk database and verify:
//! - Full sync pairs for never-synced events
//! - Incremental syncs driven by the event horizon policy
//! - Dormant and finished events dropping out of tracking
//! - Idempotent re-ticks and start-time ordering

mod common;

use chrono::{Duration, Utc};
use racesync::models::{EventKey, JobCompletion, OperationKind, SyncTrigger};
use racesync::scheduler::Scheduler;
use racesync::storage::{CandidateWindow, JobQueue, SyncCatalog};

use common::{link, open_stores, temp_db_path, track, Stores, PROVIDER, TENANT};

fn scheduler(stores: &Stores, window: CandidateWindow) -> Scheduler {
    Scheduler::new(stores.catalog.clone(), stores.queue.clone(), window)
}

// ============================================================================
// Horizon Scenarios
// ============================================================================

#[test]
fn test_far_event_never_synced_gets_full_sync_pair() {
    let (_dir, path) = temp_db_path();
    let stores = open_stores(&path);
    let now = Utc::now();
    link(stores.catalog.as_ref(), TENANT, PROVIDER);
    track(stores.catalog.as_ref(), TENANT, PROVIDER, "marathon", Some(now + Duration::hours(30)), now);

    let scheduler = scheduler(&stores, CandidateWindow::default());
    let report = scheduler.try_tick(now).unwrap().unwrap();

    assert_eq!(report.full_syncs, 1);
    assert_eq!(report.jobs_enqueued, 2);

    let key = EventKey::new(TENANT, PROVIDER, "marathon");
    for kind in OperationKind::all() {
        let job = stores.queue.active_job(&key, kind).unwrap().unwrap();
        assert_eq!(job.priority, 5);
        assert!(!job.payload.is_incremental);
        assert_eq!(job.payload.trigger, SyncTrigger::Scheduled);
    }

    let entry = &scheduler.schedule_snapshot()[0];
    assert_eq!(entry.frequency_minutes, 60);
    assert_eq!(entry.priority, 5);
    assert_eq!(entry.state, "needs_full_sync");
}

#[test]
fn test_near_event_synced_minutes_ago_gets_one_incremental_job() {
    let (_dir, path) = temp_db_path();
    let stores = open_stores(&path);
    let now = Utc::now();
    link(stores.catalog.as_ref(), TENANT, PROVIDER);
    track(stores.catalog.as_ref(), TENANT, PROVIDER, "10k", Some(now + Duration::hours(2)), now);

    let scheduler = scheduler(&stores, CandidateWindow::default());
    scheduler.try_tick(now).unwrap().unwrap();

    // A worker finishes the initial full sync
    while let Some(job) = stores.queue.claim_next("worker-1").unwrap() {
        stores
            .queue
            .complete(job.job_id, job.attempts, &JobCompletion::success(12))
            .unwrap();
    }

    let later = now + Duration::minutes(3);
    let report = scheduler.try_tick(later).unwrap().unwrap();

    assert_eq!(report.incremental_syncs, 1);
    assert_eq!(report.jobs_enqueued, 1);

    let key = EventKey::new(TENANT, PROVIDER, "10k");
    assert!(stores.queue.active_job(&key, OperationKind::Events).unwrap().is_none());
    let job = stores
        .queue
        .active_job(&key, OperationKind::Participants)
        .unwrap()
        .unwrap();
    assert_eq!(job.priority, 2);
    assert!(job.payload.is_incremental);
    assert!(job.payload.last_sync_time.is_some());

    let entry = &scheduler.schedule_snapshot()[0];
    assert_eq!(entry.frequency_minutes, 1);
}

#[test]
fn test_incremental_cursor_starts_at_previous_fetch_start() {
    let (_dir, path) = temp_db_path();
    let stores = open_stores(&path);
    let now = Utc::now();
    link(stores.catalog.as_ref(), TENANT, PROVIDER);
    track(stores.catalog.as_ref(), TENANT, PROVIDER, "half", Some(now + Duration::hours(2)), now);

    let scheduler = scheduler(&stores, CandidateWindow::default());
    scheduler.try_tick(now).unwrap().unwrap();

    // Both jobs are claimed before either finishes, so the fetch window
    // stays open for a while
    let mut claimed = Vec::new();
    while let Some(job) = stores.queue.claim_next("worker-1").unwrap() {
        claimed.push(job);
    }
    let fetch_started = claimed
        .iter()
        .find(|j| j.operation_kind == OperationKind::Participants)
        .and_then(|j| j.started_time)
        .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(50));
    for job in &claimed {
        stores
            .queue
            .complete(job.job_id, job.attempts, &JobCompletion::success(5))
            .unwrap();
    }

    let report = scheduler.try_tick(now + Duration::minutes(3)).unwrap().unwrap();
    assert_eq!(report.incremental_syncs, 1);

    let key = EventKey::new(TENANT, PROVIDER, "half");
    let job = stores
        .queue
        .active_job(&key, OperationKind::Participants)
        .unwrap()
        .unwrap();
    let cursor = job.payload.last_sync_time.unwrap();
    assert!(cursor <= fetch_started);

    let finished = stores.catalog.outcomes_for_event(&key, 10).unwrap()[0].sync_time;
    assert!(cursor < finished);
}

#[test]
fn test_recently_synced_event_waits_for_its_frequency() {
    let (_dir, path) = temp_db_path();
    let stores = open_stores(&path);
    let now = Utc::now();
    link(stores.catalog.as_ref(), TENANT, PROVIDER);
    track(stores.catalog.as_ref(), TENANT, PROVIDER, "trail", Some(now + Duration::hours(10)), now);

    let scheduler = scheduler(&stores, CandidateWindow::default());
    scheduler.try_tick(now).unwrap().unwrap();
    while let Some(job) = stores.queue.claim_next("worker-1").unwrap() {
        stores
            .queue
            .complete(job.job_id, job.attempts, &JobCompletion::success(1))
            .unwrap();
    }

    // 10h out: every 5 minutes
    let report = scheduler.try_tick(now + Duration::minutes(2)).unwrap().unwrap();
    assert_eq!(report.up_to_date, 1);
    assert_eq!(report.jobs_enqueued, 0);

    let report = scheduler.try_tick(now + Duration::minutes(6)).unwrap().unwrap();
    assert_eq!(report.incremental_syncs, 1);
    assert_eq!(report.jobs_enqueued, 1);
}

#[test]
fn test_finished_event_is_dropped_from_tracking() {
    let (_dir, path) = temp_db_path();
    let stores = open_stores(&path);
    let now = Utc::now();
    link(stores.catalog.as_ref(), TENANT, PROVIDER);
    track(stores.catalog.as_ref(), TENANT, PROVIDER, "5k", Some(now + Duration::minutes(30)), now);

    let scheduler = scheduler(&stores, CandidateWindow::default());
    scheduler.try_tick(now).unwrap().unwrap();
    assert_eq!(scheduler.tracked_count(), 1);

    // Started 90 minutes ago
    let report = scheduler.try_tick(now + Duration::minutes(120)).unwrap().unwrap();
    assert_eq!(report.jobs_enqueued, 0);
    assert_eq!(report.pruned, 1);
    assert_eq!(scheduler.tracked_count(), 0);
}

#[test]
fn test_dormant_event_inside_wide_window_enqueues_nothing() {
    let (_dir, path) = temp_db_path();
    let stores = open_stores(&path);
    let now = Utc::now();
    link(stores.catalog.as_ref(), TENANT, PROVIDER);
    track(stores.catalog.as_ref(), TENANT, PROVIDER, "relay", Some(now - Duration::minutes(90)), now);

    let window = CandidateWindow::new(Duration::hours(3), Duration::days(7));
    let scheduler = scheduler(&stores, window);
    let report = scheduler.try_tick(now).unwrap().unwrap();

    assert_eq!(report.candidates, 1);
    assert_eq!(report.dormant, 1);
    assert_eq!(report.jobs_enqueued, 0);
    assert_eq!(scheduler.tracked_count(), 0);
}

// ============================================================================
// Tick Properties
// ============================================================================

#[test]
fn test_retick_without_data_change_enqueues_nothing() {
    let (_dir, path) = temp_db_path();
    let stores = open_stores(&path);
    let now = Utc::now();
    link(stores.catalog.as_ref(), TENANT, PROVIDER);
    for (id, hours) in [("a", 3), ("b", 20), ("c", 72)] {
        track(stores.catalog.as_ref(), TENANT, PROVIDER, id, Some(now + Duration::hours(hours)), now);
    }

    let scheduler = scheduler(&stores, CandidateWindow::default());
    let first = scheduler.try_tick(now).unwrap().unwrap();
    assert_eq!(first.jobs_enqueued, 6);

    let second = scheduler.try_tick(now + Duration::seconds(30)).unwrap().unwrap();
    assert_eq!(second.jobs_enqueued, 0);
    assert_eq!(second.already_queued, 6);
}

#[test]
fn test_enqueue_order_follows_start_time() {
    let (_dir, path) = temp_db_path();
    let stores = open_stores(&path);
    let now = Utc::now();
    link(stores.catalog.as_ref(), TENANT, PROVIDER);
    track(stores.catalog.as_ref(), TENANT, PROVIDER, "late", Some(now + Duration::days(5)), now);
    track(stores.catalog.as_ref(), TENANT, PROVIDER, "early", Some(now + Duration::hours(1)), now);
    track(stores.catalog.as_ref(), TENANT, PROVIDER, "middle", Some(now + Duration::hours(12)), now);

    let scheduler = scheduler(&stores, CandidateWindow::default());
    let report = scheduler.try_tick(now).unwrap().unwrap();

    let order: Vec<String> = report
        .enqueued_job_ids
        .iter()
        .map(|id| stores.queue.get(*id).unwrap().unwrap().key.event_id)
        .collect();
    assert_eq!(order, ["early", "early", "middle", "middle", "late", "late"]);
}

#[test]
fn test_unlinked_provider_is_skipped_but_tick_continues() {
    let (_dir, path) = temp_db_path();
    let stores = open_stores(&path);
    let now = Utc::now();
    link(stores.catalog.as_ref(), TENANT, PROVIDER);
    track(stores.catalog.as_ref(), TENANT, PROVIDER, "ok", Some(now + Duration::hours(6)), now);
    track(stores.catalog.as_ref(), TENANT, "unknown-provider", "orphan", Some(now + Duration::hours(6)), now);
    track(stores.catalog.as_ref(), TENANT, PROVIDER, "undated", None, now);

    let scheduler = scheduler(&stores, CandidateWindow::default());
    let report = scheduler.try_tick(now).unwrap().unwrap();

    assert_eq!(report.policy_skipped, 2);
    assert_eq!(report.jobs_enqueued, 2);
}

#[test]
fn test_schedule_table_is_rebuilt_from_store_after_restart() {
    let (_dir, path) = temp_db_path();
    let now = Utc::now();
    {
        let stores = open_stores(&path);
        link(stores.catalog.as_ref(), TENANT, PROVIDER);
        track(stores.catalog.as_ref(), TENANT, PROVIDER, "x", Some(now + Duration::hours(8)), now);
        let report = scheduler(&stores, CandidateWindow::default())
            .try_tick(now)
            .unwrap()
            .unwrap();
        assert_eq!(report.jobs_enqueued, 2);
    }

    let stores = open_stores(&path);
    let fresh = scheduler(&stores, CandidateWindow::default());
    let report = fresh.try_tick(now + Duration::minutes(1)).unwrap().unwrap();

    assert_eq!(report.jobs_enqueued, 0);
    assert_eq!(report.already_queued, 2);
    assert_eq!(fresh.tracked_count(), 1);
}
