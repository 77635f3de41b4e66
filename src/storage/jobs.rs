//! Sync job queue
//!
//! The job store is the only source of truth for "is work already queued".
//! Two guarantees carry the whole subsystem:
//!
//! - **Dedup on enqueue**: a partial unique index allows at most one
//!   `pending`/`running` job per (tenant, provider, event, kind). `enqueue`
//!   is a single `INSERT .. ON CONFLICT DO NOTHING`, so concurrent schedulers
//!   and manual triggers can never race past each other.
//! - **Exclusive claim**: `claim_next` is one conditional `UPDATE .. WHERE
//!   status = 'pending' RETURNING ..` inside an immediate transaction. Exactly
//!   one caller receives any given job.
//!
//! Every claim bumps `attempts`; completion and release must present the
//! attempt they were handed, so a worker whose job was force-requeued by the
//! watchdog cannot overwrite the next owner's result.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::Serialize;
use std::collections::BTreeMap;

use super::{decode_opt_time, decode_time, encode_time, Database, StoreError, StoreResult};
use crate::models::{
    EventKey, JobCompletion, JobId, JobPayload, JobStatus, NewSyncJob, OperationKind,
    OutcomeStatus, ProviderJobCounts, SyncDirection, SyncJob,
};

// ============================================================================
// Repository Trait
// ============================================================================

/// Durable queue of sync jobs shared by the scheduler and the workers
pub trait JobQueue: Send + Sync {
    /// Insert a pending job. Returns `None` when an active job already exists
    /// for the same (tenant, provider, event, kind).
    fn enqueue(&self, job: &NewSyncJob) -> StoreResult<Option<JobId>>;

    /// Atomically move the most urgent pending job to `running` and return it
    fn claim_next(&self, worker_id: &str) -> StoreResult<Option<SyncJob>>;

    /// Terminate a running job and append its outcome to sync history
    fn complete(&self, job_id: JobId, attempt: u32, completion: &JobCompletion) -> StoreResult<()>;

    /// Hand a running job back to the queue (worker shutdown)
    fn release(&self, job_id: JobId, attempt: u32) -> StoreResult<()>;

    /// Force a running job back to `pending`, regardless of owner
    fn requeue(&self, job_id: JobId) -> StoreResult<bool>;

    /// Running jobs whose claim is older than `started_before`
    fn find_stuck(&self, started_before: DateTime<Utc>) -> StoreResult<Vec<SyncJob>>;

    /// Requeue stuck jobs, failing those that already used `max_attempts`
    fn requeue_stuck(
        &self,
        started_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> StoreResult<RequeueReport>;

    fn get(&self, job_id: JobId) -> StoreResult<Option<SyncJob>>;

    /// The pending or running job for this tuple, if any
    fn active_job(&self, key: &EventKey, kind: OperationKind) -> StoreResult<Option<SyncJob>>;

    /// Job counts by status, grouped by provider
    fn counts_by_provider(&self) -> StoreResult<Vec<ProviderJobCounts>>;
}

/// Result of a watchdog sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequeueReport {
    /// Jobs moved back to `pending`
    pub requeued: Vec<JobId>,
    /// Jobs that exhausted their attempts and were marked `failed`
    pub failed: Vec<JobId>,
}

impl RequeueReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.requeued.len() + self.failed.len()
    }
}

// ============================================================================
// SQLite Implementation
// ============================================================================

const JOB_COLUMNS: &str = "job_id, tenant_id, provider_id, event_id, operation_kind, direction, \
     priority, status, scheduled_time, started_time, completed_time, payload, attempts, \
     worker_id, failure_reason";

/// SQLite implementation of [`JobQueue`]
#[derive(Clone, Debug)]
pub struct SqliteJobStore {
    db: Database,
}

impl SqliteJobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn job_from_row(row: &Row<'_>) -> StoreResult<SyncJob> {
        let kind: String = row.get(4)?;
        let direction: String = row.get(5)?;
        let priority: i64 = row.get(6)?;
        let status: String = row.get(7)?;
        let scheduled: String = row.get(8)?;
        let payload: String = row.get(11)?;
        let attempts: i64 = row.get(12)?;

        Ok(SyncJob {
            job_id: row.get(0)?,
            key: EventKey {
                tenant_id: row.get(1)?,
                provider_id: row.get(2)?,
                event_id: row.get(3)?,
            },
            operation_kind: OperationKind::parse(&kind)
                .ok_or_else(|| StoreError::invalid_row("operation_kind", kind.clone()))?,
            direction: SyncDirection::parse(&direction)
                .ok_or_else(|| StoreError::invalid_row("direction", direction.clone()))?,
            priority: u8::try_from(priority)
                .map_err(|_| StoreError::invalid_row("priority", priority.to_string()))?,
            status: JobStatus::parse(&status)
                .ok_or_else(|| StoreError::invalid_row("status", status.clone()))?,
            scheduled_time: decode_time("scheduled_time", &scheduled)?,
            started_time: decode_opt_time("started_time", row.get(9)?)?,
            completed_time: decode_opt_time("completed_time", row.get(10)?)?,
            payload: serde_json::from_str::<JobPayload>(&payload)?,
            attempts: u32::try_from(attempts)
                .map_err(|_| StoreError::invalid_row("attempts", attempts.to_string()))?,
            worker_id: row.get(13)?,
            failure_reason: row.get(14)?,
        })
    }

    fn query_jobs(
        conn: &rusqlite::Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> StoreResult<Vec<SyncJob>> {
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next()? {
            jobs.push(Self::job_from_row(row)?);
        }
        Ok(jobs)
    }

    fn append_outcome(
        tx: &Transaction<'_>,
        job: &SyncJob,
        completion: &JobCompletion,
        sync_time: DateTime<Utc>,
    ) -> StoreResult<()> {
        tx.execute(
            r#"
                INSERT INTO sync_outcomes (job_id, tenant_id, provider_id, event_id, operation_kind,
                                           sync_time, records_synced, status, failure_reason)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            params![
                job.job_id,
                job.key.tenant_id,
                job.key.provider_id,
                job.key.event_id,
                job.operation_kind.as_str(),
                encode_time(sync_time),
                i64::try_from(completion.records_synced).unwrap_or(i64::MAX),
                completion.status.as_str(),
                completion.failure_reason,
            ],
        )?;

        if completion.status == OutcomeStatus::Success
            && job.operation_kind == OperationKind::Participants
        {
            tx.execute(
                r#"
                    UPDATE tracked_events
                    SET full_sync_completed = 1, updated_at = ?4
                    WHERE tenant_id = ?1 AND provider_id = ?2 AND event_id = ?3
                    "#,
                params![
                    job.key.tenant_id,
                    job.key.provider_id,
                    job.key.event_id,
                    encode_time(sync_time),
                ],
            )?;
        }

        Ok(())
    }

    /// Distinguish "no such job" from "job exists but is not ours any more"
    fn lease_error(tx: &Transaction<'_>, job_id: JobId, attempt: u32) -> StoreError {
        let exists = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sync_jobs WHERE job_id = ?1)",
                params![job_id],
                |row| row.get::<_, bool>(0),
            )
            .unwrap_or(false);

        if exists {
            StoreError::LeaseLost { job_id, attempt }
        } else {
            StoreError::JobNotFound(job_id)
        }
    }
}

impl JobQueue for SqliteJobStore {
    fn enqueue(&self, job: &NewSyncJob) -> StoreResult<Option<JobId>> {
        let payload = serde_json::to_string(&job.payload)?;

        self.db.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let job_id = tx
                .query_row(
                    r#"
                        INSERT INTO sync_jobs (tenant_id, provider_id, event_id, operation_kind,
                                               direction, priority, status, scheduled_time, payload)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8)
                        ON CONFLICT DO NOTHING
                        RETURNING job_id
                        "#,
                    params![
                        job.key.tenant_id,
                        job.key.provider_id,
                        job.key.event_id,
                        job.operation_kind.as_str(),
                        job.direction.as_str(),
                        i64::from(job.priority),
                        encode_time(job.scheduled_time),
                        payload,
                    ],
                    |row| row.get::<_, JobId>(0),
                )
                .optional()?;
            tx.commit()?;

            match job_id {
                Some(id) => tracing::debug!(
                    job_id = id,
                    event = %job.key,
                    kind = %job.operation_kind,
                    priority = job.priority,
                    "Job enqueued"
                ),
                None => tracing::debug!(
                    event = %job.key,
                    kind = %job.operation_kind,
                    "Active job already queued, enqueue skipped"
                ),
            }

            Ok(job_id)
        })
    }

    fn claim_next(&self, worker_id: &str) -> StoreResult<Option<SyncJob>> {
        let now = encode_time(Utc::now());

        self.db.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let claimed = {
                let sql = format!(
                    r#"
                        UPDATE sync_jobs
                        SET status = 'running', started_time = ?1, worker_id = ?2,
                            attempts = attempts + 1, completed_time = NULL
                        WHERE job_id = (
                            SELECT job_id FROM sync_jobs
                            WHERE status = 'pending'
                            ORDER BY priority ASC, scheduled_time ASC, job_id ASC
                            LIMIT 1
                        )
                        AND status = 'pending'
                        RETURNING {JOB_COLUMNS}
                        "#
                );
                let mut jobs = Self::query_jobs(&tx, &sql, params![now, worker_id])?;
                jobs.pop()
            };
            tx.commit()?;

            if let Some(job) = &claimed {
                tracing::debug!(
                    job_id = job.job_id,
                    worker_id,
                    event = %job.key,
                    kind = %job.operation_kind,
                    attempt = job.attempts,
                    "Job claimed"
                );
            }

            Ok(claimed)
        })
    }

    fn complete(&self, job_id: JobId, attempt: u32, completion: &JobCompletion) -> StoreResult<()> {
        let now = Utc::now();

        self.db.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let finished = {
                let sql = format!(
                    r#"
                        UPDATE sync_jobs
                        SET status = ?1, completed_time = ?2, failure_reason = ?3
                        WHERE job_id = ?4 AND attempts = ?5 AND status = 'running'
                        RETURNING {JOB_COLUMNS}
                        "#
                );
                let mut jobs = Self::query_jobs(
                    &tx,
                    &sql,
                    params![
                        completion.status.job_status().as_str(),
                        encode_time(now),
                        completion.failure_reason,
                        job_id,
                        i64::from(attempt),
                    ],
                )?;
                jobs.pop()
            };

            let Some(job) = finished else {
                return Err(Self::lease_error(&tx, job_id, attempt));
            };

            Self::append_outcome(&tx, &job, completion, now)?;
            tx.commit()?;

            tracing::info!(
                job_id,
                event = %job.key,
                kind = %job.operation_kind,
                status = completion.status.as_str(),
                records = completion.records_synced,
                reason = ?completion.failure_reason,
                "Job completed"
            );
            Ok(())
        })
    }

    fn release(&self, job_id: JobId, attempt: u32) -> StoreResult<()> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let updated = tx.execute(
                r#"
                    UPDATE sync_jobs
                    SET status = 'pending', started_time = NULL, worker_id = NULL
                    WHERE job_id = ?1 AND attempts = ?2 AND status = 'running'
                    "#,
                params![job_id, i64::from(attempt)],
            )?;

            if updated == 0 {
                return Err(Self::lease_error(&tx, job_id, attempt));
            }
            tx.commit()?;

            tracing::info!(job_id, attempt, "Job released back to queue");
            Ok(())
        })
    }

    fn requeue(&self, job_id: JobId) -> StoreResult<bool> {
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                r#"
                    UPDATE sync_jobs
                    SET status = 'pending', started_time = NULL, worker_id = NULL
                    WHERE job_id = ?1 AND status = 'running'
                    "#,
                params![job_id],
            )?;

            if updated > 0 {
                tracing::warn!(job_id, "Running job forced back to pending");
            }
            Ok(updated > 0)
        })
    }

    fn find_stuck(&self, started_before: DateTime<Utc>) -> StoreResult<Vec<SyncJob>> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM sync_jobs
                 WHERE status = 'running' AND started_time < ?1
                 ORDER BY started_time ASC"
            );
            Self::query_jobs(conn, &sql, params![encode_time(started_before)])
        })
    }

    fn requeue_stuck(
        &self,
        started_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> StoreResult<RequeueReport> {
        let now = Utc::now();

        self.db.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM sync_jobs
                 WHERE status = 'running' AND started_time < ?1
                 ORDER BY started_time ASC"
            );
            let stuck = Self::query_jobs(&tx, &sql, params![encode_time(started_before)])?;

            let mut report = RequeueReport::default();
            for job in stuck {
                if job.attempts >= max_attempts {
                    let reason = format!(
                        "stalled in running state after {} attempt(s)",
                        job.attempts
                    );
                    tx.execute(
                        r#"
                            UPDATE sync_jobs
                            SET status = 'failed', completed_time = ?1, failure_reason = ?2
                            WHERE job_id = ?3 AND status = 'running'
                            "#,
                        params![encode_time(now), reason, job.job_id],
                    )?;
                    Self::append_outcome(&tx, &job, &JobCompletion::failed(reason), now)?;
                    tracing::warn!(
                        job_id = job.job_id,
                        event = %job.key,
                        attempts = job.attempts,
                        "Stuck job exhausted its attempts, marked failed"
                    );
                    report.failed.push(job.job_id);
                } else {
                    tx.execute(
                        r#"
                            UPDATE sync_jobs
                            SET status = 'pending', started_time = NULL, worker_id = NULL
                            WHERE job_id = ?1 AND status = 'running'
                            "#,
                        params![job.job_id],
                    )?;
                    tracing::warn!(
                        job_id = job.job_id,
                        event = %job.key,
                        worker_id = ?job.worker_id,
                        "Stuck job requeued"
                    );
                    report.requeued.push(job.job_id);
                }
            }

            tx.commit()?;
            Ok(report)
        })
    }

    fn get(&self, job_id: JobId) -> StoreResult<Option<SyncJob>> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE job_id = ?1");
            Ok(Self::query_jobs(conn, &sql, params![job_id])?.pop())
        })
    }

    fn active_job(&self, key: &EventKey, kind: OperationKind) -> StoreResult<Option<SyncJob>> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM sync_jobs
                 WHERE tenant_id = ?1 AND provider_id = ?2 AND event_id = ?3
                   AND operation_kind = ?4 AND status IN ('pending', 'running')"
            );
            Ok(Self::query_jobs(
                conn,
                &sql,
                params![key.tenant_id, key.provider_id, key.event_id, kind.as_str()],
            )?
            .pop())
        })
    }

    fn counts_by_provider(&self) -> StoreResult<Vec<ProviderJobCounts>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT provider_id, status, COUNT(*) FROM sync_jobs
                 GROUP BY provider_id, status",
            )?;
            let mut rows = stmt.query([])?;

            let mut by_provider: BTreeMap<String, ProviderJobCounts> = BTreeMap::new();
            while let Some(row) = rows.next()? {
                let provider: String = row.get(0)?;
                let status: String = row.get(1)?;
                let count = u64::try_from(row.get::<_, i64>(2)?).unwrap_or(0);

                let entry = by_provider
                    .entry(provider.clone())
                    .or_insert_with(|| ProviderJobCounts::new(provider));
                match JobStatus::parse(&status) {
                    Some(JobStatus::Pending) => entry.pending += count,
                    Some(JobStatus::Running) => entry.running += count,
                    Some(JobStatus::Success) => entry.success += count,
                    Some(JobStatus::Failed) => entry.failed += count,
                    None => return Err(StoreError::invalid_row("status", status)),
                }
            }

            Ok(by_provider.into_values().collect())
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
