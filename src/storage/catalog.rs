//! Sync catalog: tracked events, provider linkage and sync history reads
//!
//! The catalog produces the scheduler's candidate set. The window filter and
//! the join against credentials and outcomes run inside SQLite, so a tick
//! reads one ordered result set instead of assembling it in memory.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{decode_opt_time, decode_time, encode_time, Database, StoreError, StoreResult};
use crate::models::{
    EventKey, OperationKind, OutcomeStatus, ProviderCredential, ProviderEvent, SyncCandidate,
    SyncOutcomeRecord, TrackedEvent,
};

/// Start-time window for candidate selection, relative to "now"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateWindow {
    /// How far back an event may have started and still be considered
    pub lookback: Duration,
    /// How far ahead an event may start and still be considered
    pub lookahead: Duration,
}

impl Default for CandidateWindow {
    fn default() -> Self {
        Self {
            lookback: Duration::hours(1),
            lookahead: Duration::days(7),
        }
    }
}

impl CandidateWindow {
    pub fn new(lookback: Duration, lookahead: Duration) -> Self {
        Self { lookback, lookahead }
    }

    /// Inclusive bounds as (earliest start, latest start)
    pub fn bounds(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (now - self.lookback, now + self.lookahead)
    }

    pub fn contains(&self, now: DateTime<Utc>, start: DateTime<Utc>) -> bool {
        let (from, to) = self.bounds(now);
        start >= from && start <= to
    }
}

/// Read/write access to tracked events and their sync state
pub trait SyncCatalog: Send + Sync {
    /// Tracked events starting inside `window` around `now`, ordered by start
    /// time. Events with no readable start time are appended last so the
    /// scheduler can report them.
    fn list_candidates(
        &self,
        now: DateTime<Utc>,
        window: &CandidateWindow,
    ) -> StoreResult<Vec<SyncCandidate>>;

    /// `list_candidates` restricted to one tenant and provider
    fn list_for_provider(
        &self,
        tenant_id: &str,
        provider_id: &str,
        now: DateTime<Utc>,
        window: &CandidateWindow,
    ) -> StoreResult<Vec<SyncCandidate>>;

    /// Candidate view of a single event regardless of the window
    fn find_candidate(&self, key: &EventKey) -> StoreResult<Option<SyncCandidate>>;

    /// Record an event seen in a provider listing. Returns `true` when the
    /// event was not tracked before.
    fn upsert_event(
        &self,
        tenant_id: &str,
        provider_id: &str,
        event: &ProviderEvent,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    fn find_event(&self, key: &EventKey) -> StoreResult<Option<TrackedEvent>>;

    fn list_events(&self, tenant_id: &str, provider_id: &str) -> StoreResult<Vec<TrackedEvent>>;

    fn upsert_credential(&self, credential: &ProviderCredential) -> StoreResult<()>;

    /// Most recent outcomes for an event, newest first
    fn outcomes_for_event(&self, key: &EventKey, limit: usize)
        -> StoreResult<Vec<SyncOutcomeRecord>>;
}

/// SQLite implementation of [`SyncCatalog`]
#[derive(Clone, Debug)]
pub struct SqliteSyncCatalog {
    db: Database,
}

// Cursor is the fetch start of the latest successful participants job, so
// records changed while that fetch ran are returned again next time.
const LAST_SUCCESS: &str = "(SELECT MAX(COALESCE(j.started_time, o.sync_time)) FROM sync_outcomes o
      LEFT JOIN sync_jobs j ON j.job_id = o.job_id
      WHERE o.tenant_id = e.tenant_id AND o.provider_id = e.provider_id
        AND o.event_id = e.event_id AND o.operation_kind = 'participants'
        AND o.status = 'success')";

const EVENTS_LISTED: &str = "EXISTS (SELECT 1 FROM sync_outcomes o
      WHERE o.tenant_id = e.tenant_id AND o.provider_id = e.provider_id
        AND o.event_id = e.event_id AND o.operation_kind = 'events'
        AND o.status = 'success')";

impl SqliteSyncCatalog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn candidate_sql(filter: &str) -> String {
        format!(
            "SELECT e.tenant_id, e.provider_id, e.event_id, e.start_time, e.full_sync_completed,
                    COALESCE(c.enabled, 0), {LAST_SUCCESS}, {EVENTS_LISTED}
             FROM tracked_events e
             LEFT JOIN provider_credentials c
               ON c.tenant_id = e.tenant_id AND c.provider_id = e.provider_id
             WHERE {filter}
             ORDER BY e.start_time IS NULL, e.start_time ASC, e.event_id ASC"
        )
    }

    fn candidate_from_row(row: &Row<'_>) -> StoreResult<SyncCandidate> {
        let key = EventKey {
            tenant_id: row.get(0)?,
            provider_id: row.get(1)?,
            event_id: row.get(2)?,
        };
        let start_raw: Option<String> = row.get(3)?;
        let start_time = match start_raw.as_deref().map(|s| decode_time("start_time", s)) {
            Some(Ok(start)) => Some(start),
            Some(Err(err)) => {
                tracing::warn!(event = %key, error = %err, "Unreadable event start time");
                None
            }
            None => None,
        };

        Ok(SyncCandidate {
            start_time,
            full_sync_completed: row.get(4)?,
            linked: row.get(5)?,
            last_successful_sync: decode_opt_time("last_successful_sync", row.get(6)?)?,
            events_listed: row.get(7)?,
            key,
        })
    }

    fn event_from_row(row: &Row<'_>) -> StoreResult<TrackedEvent> {
        let first_seen: String = row.get(6)?;
        let updated: String = row.get(7)?;
        Ok(TrackedEvent {
            key: EventKey {
                tenant_id: row.get(0)?,
                provider_id: row.get(1)?,
                event_id: row.get(2)?,
            },
            name: row.get(3)?,
            start_time: decode_opt_time("start_time", row.get(4)?)?,
            full_sync_completed: row.get(5)?,
            first_seen_at: decode_time("first_seen_at", &first_seen)?,
            updated_at: decode_time("updated_at", &updated)?,
            last_successful_sync: decode_opt_time("last_successful_sync", row.get(8)?)?,
        })
    }

    fn query_candidates(
        &self,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> StoreResult<Vec<SyncCandidate>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&Self::candidate_sql(filter))?;
            let mut rows = stmt.query(params)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(Self::candidate_from_row(row)?);
            }
            Ok(out)
        })
    }

    fn event_sql(filter: &str) -> String {
        format!(
            "SELECT e.tenant_id, e.provider_id, e.event_id, e.name, e.start_time,
                    e.full_sync_completed, e.first_seen_at, e.updated_at, {LAST_SUCCESS}
             FROM tracked_events e
             WHERE {filter}
             ORDER BY e.start_time IS NULL, e.start_time ASC, e.event_id ASC"
        )
    }
}

impl SyncCatalog for SqliteSyncCatalog {
    fn list_candidates(
        &self,
        now: DateTime<Utc>,
        window: &CandidateWindow,
    ) -> StoreResult<Vec<SyncCandidate>> {
        let (from, to) = window.bounds(now);
        let candidates = self.query_candidates(
            "e.start_time IS NULL OR (e.start_time >= ?1 AND e.start_time <= ?2)",
            params![encode_time(from), encode_time(to)],
        )?;

        tracing::debug!(count = candidates.len(), "Candidate set loaded");
        Ok(candidates)
    }

    fn list_for_provider(
        &self,
        tenant_id: &str,
        provider_id: &str,
        now: DateTime<Utc>,
        window: &CandidateWindow,
    ) -> StoreResult<Vec<SyncCandidate>> {
        let (from, to) = window.bounds(now);
        self.query_candidates(
            "e.tenant_id = ?1 AND e.provider_id = ?2
             AND (e.start_time IS NULL OR (e.start_time >= ?3 AND e.start_time <= ?4))",
            params![tenant_id, provider_id, encode_time(from), encode_time(to)],
        )
    }

    fn find_candidate(&self, key: &EventKey) -> StoreResult<Option<SyncCandidate>> {
        Ok(self
            .query_candidates(
                "e.tenant_id = ?1 AND e.provider_id = ?2 AND e.event_id = ?3",
                params![key.tenant_id, key.provider_id, key.event_id],
            )?
            .pop())
    }

    fn upsert_event(
        &self,
        tenant_id: &str,
        provider_id: &str,
        event: &ProviderEvent,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let now = encode_time(now);
        let start = event.start_time.map(encode_time);

        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let existed: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM tracked_events
                 WHERE tenant_id = ?1 AND provider_id = ?2 AND event_id = ?3)",
                params![tenant_id, provider_id, event.event_id],
                |row| row.get(0),
            )?;

            tx.execute(
                r#"
                    INSERT INTO tracked_events (tenant_id, provider_id, event_id, name, start_time,
                                                first_seen_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                    ON CONFLICT (tenant_id, provider_id, event_id) DO UPDATE SET
                        name = COALESCE(excluded.name, tracked_events.name),
                        start_time = COALESCE(excluded.start_time, tracked_events.start_time),
                        updated_at = excluded.updated_at
                    "#,
                params![tenant_id, provider_id, event.event_id, event.name, start, now],
            )?;
            tx.commit()?;

            if !existed {
                tracing::info!(
                    tenant_id,
                    provider_id,
                    event_id = %event.event_id,
                    "Tracking new event"
                );
            }
            Ok(!existed)
        })
    }

    fn find_event(&self, key: &EventKey) -> StoreResult<Option<TrackedEvent>> {
        self.db.with_conn(|conn| {
            let sql = Self::event_sql("e.tenant_id = ?1 AND e.provider_id = ?2 AND e.event_id = ?3");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![key.tenant_id, key.provider_id, key.event_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(Self::event_from_row(row)?)),
                None => Ok(None),
            }
        })
    }

    fn list_events(&self, tenant_id: &str, provider_id: &str) -> StoreResult<Vec<TrackedEvent>> {
        self.db.with_conn(|conn| {
            let sql = Self::event_sql("e.tenant_id = ?1 AND e.provider_id = ?2");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![tenant_id, provider_id])?;
            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                events.push(Self::event_from_row(row)?);
            }
            Ok(events)
        })
    }

    fn upsert_credential(&self, credential: &ProviderCredential) -> StoreResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                r#"
                    INSERT INTO provider_credentials (tenant_id, provider_id, api_key, enabled, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT (tenant_id, provider_id) DO UPDATE SET
                        api_key = excluded.api_key,
                        enabled = excluded.enabled,
                        updated_at = excluded.updated_at
                    "#,
                params![
                    credential.tenant_id,
                    credential.provider_id,
                    credential.api_key,
                    credential.enabled,
                    encode_time(Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    fn outcomes_for_event(
        &self,
        key: &EventKey,
        limit: usize,
    ) -> StoreResult<Vec<SyncOutcomeRecord>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT outcome_id, job_id, operation_kind, sync_time, records_synced, status,
                        failure_reason
                 FROM sync_outcomes
                 WHERE tenant_id = ?1 AND provider_id = ?2 AND event_id = ?3
                 ORDER BY sync_time DESC, outcome_id DESC
                 LIMIT ?4",
            )?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let mut rows =
                stmt.query(params![key.tenant_id, key.provider_id, key.event_id, limit])?;

            let mut outcomes = Vec::new();
            while let Some(row) = rows.next()? {
                let kind: String = row.get(2)?;
                let sync_time: String = row.get(3)?;
                let records: i64 = row.get(4)?;
                let status: String = row.get(5)?;
                outcomes.push(SyncOutcomeRecord {
                    outcome_id: row.get(0)?,
                    job_id: row.get(1)?,
                    key: key.clone(),
                    operation_kind: OperationKind::parse(&kind)
                        .ok_or_else(|| StoreError::invalid_row("operation_kind", kind.clone()))?,
                    sync_time: decode_time("sync_time", &sync_time)?,
                    records_synced: u64::try_from(records).unwrap_or(0),
                    status: OutcomeStatus::parse(&status)
                        .ok_or_else(|| StoreError::invalid_row("status", status.clone()))?,
                    failure_reason: row.get(6)?,
                });
            }
            Ok(outcomes)
        })
    }
}

impl SqliteSyncCatalog {
    /// Credential for (tenant, provider), if one was ever registered
    pub fn credential(
        &self,
        tenant_id: &str,
        provider_id: &str,
    ) -> StoreResult<Option<ProviderCredential>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT tenant_id, provider_id, api_key, enabled FROM provider_credentials
                     WHERE tenant_id = ?1 AND provider_id = ?2",
                    params![tenant_id, provider_id],
                    |row| {
                        Ok(ProviderCredential {
                            tenant_id: row.get(0)?,
                            provider_id: row.get(1)?,
                            api_key: row.get(2)?,
                            enabled: row.get(3)?,
                        })
                    },
                )
                .optional()?)
        })
    }
}
