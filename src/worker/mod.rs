//! Reference sync worker
//!
//! Workers are independent of the scheduler: they only talk to the job
//! queue. A worker claims the most urgent pending job, calls the provider
//! client registered for the job's tenant and provider, hands the result to
//! storage, and completes the job with its outcome.
//!
//! - "events" jobs refresh the provider's event listing into the catalog
//! - "participants" jobs fetch the participant list (incrementally when the
//!   payload carries a `last_sync_time`) and pass it to a [`ParticipantSink`]
//!
//! A worker asked to stop while a job is in flight releases the job back to
//! `pending` instead of leaving it `running`.

pub mod client;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use crate::metrics;
use crate::models::{EventKey, JobCompletion, JobId, OperationKind, Participant, SyncJob};
use crate::storage::{JobQueue, StoreError, SyncCatalog};

pub use client::{ClientRegistry, ProviderClient, RateLimitedClient};

/// Result type for job execution
pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

/// Job execution errors
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("provider '{provider}' request failed: {reason}")]
    Provider {
        provider: String,
        reason: String,
        retryable: bool,
    },

    #[error("no client registered for tenant '{tenant_id}' and provider '{provider_id}'")]
    NoClient {
        tenant_id: String,
        provider_id: String,
    },

    #[error("participant sink rejected the batch: {0}")]
    Sink(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("worker stopped before the job finished")]
    Cancelled,
}

impl WorkerError {
    pub fn provider(provider: impl Into<String>, reason: impl Into<String>, retryable: bool) -> Self {
        Self::Provider {
            provider: provider.into(),
            reason: reason.into(),
            retryable,
        }
    }

    /// Whether a later attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { retryable, .. } => *retryable,
            Self::NoClient { .. } => false,
            Self::Sink(_) => true,
            Self::Store(e) => e.is_transient(),
            Self::Cancelled => true,
        }
    }
}

// ============================================================================
// Participant Sink
// ============================================================================

/// Destination for fetched participant records
#[async_trait]
pub trait ParticipantSink: Send + Sync {
    /// Persist a batch for one event; returns the number of records written
    async fn store(
        &self,
        key: &EventKey,
        participants: &[Participant],
        incremental: bool,
    ) -> WorkerResult<u64>;
}

/// Sink that keeps participants in memory, keyed by event
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<HashMap<EventKey, HashMap<String, Participant>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Participants currently held for an event
    pub fn participants(&self, key: &EventKey) -> Vec<Participant> {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<_> = records
            .get(key)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        out
    }
}

#[async_trait]
impl ParticipantSink for MemorySink {
    async fn store(
        &self,
        key: &EventKey,
        participants: &[Participant],
        incremental: bool,
    ) -> WorkerResult<u64> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| WorkerError::Sink("sink lock poisoned".to_string()))?;
        let entry = records.entry(key.clone()).or_default();
        if !incremental {
            entry.clear();
        }
        for participant in participants {
            entry.insert(participant.participant_id.clone(), participant.clone());
        }
        Ok(participants.len() as u64)
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Outcome of processing one claimed job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRun {
    pub job_id: JobId,
    pub key: EventKey,
    pub operation_kind: OperationKind,
    pub attempt: u32,
    pub completion: JobCompletion,
}

pub struct Worker {
    id: String,
    queue: Arc<dyn JobQueue>,
    catalog: Arc<dyn SyncCatalog>,
    clients: Arc<ClientRegistry>,
    sink: Arc<dyn ParticipantSink>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<dyn JobQueue>,
        catalog: Arc<dyn SyncCatalog>,
        clients: Arc<ClientRegistry>,
        sink: Arc<dyn ParticipantSink>,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            catalog,
            clients,
            sink,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// How long to wait before polling again when the queue is empty
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim and process one job. Returns `None` when the queue is empty.
    pub async fn run_once(&self) -> WorkerResult<Option<JobRun>> {
        let Some(job) = self.claim()? else {
            return Ok(None);
        };
        let result = self.execute(&job).await;
        self.finish(&job, result).map(Some)
    }

    /// Process jobs until `shutdown` flips to `true`
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> WorkerResult<()> {
        tracing::info!(worker_id = %self.id, "Worker started");

        while !*shutdown.borrow() {
            let job = match self.claim() {
                Ok(job) => job,
                Err(e) => {
                    tracing::error!(worker_id = %self.id, error = %e, "Claim failed");
                    None
                }
            };

            let Some(job) = job else {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            };

            tokio::select! {
                result = self.execute(&job) => {
                    if let Err(e) = self.finish(&job, result) {
                        tracing::warn!(worker_id = %self.id, job_id = job.job_id, error = %e, "Could not record job outcome");
                    }
                }
                _ = shutdown.changed() => {
                    self.queue.release(job.job_id, job.attempts)?;
                    tracing::info!(worker_id = %self.id, job_id = job.job_id, "Released in-flight job on shutdown");
                    break;
                }
            }
        }

        tracing::info!(worker_id = %self.id, "Worker stopped");
        Ok(())
    }

    fn claim(&self) -> WorkerResult<Option<SyncJob>> {
        let job = self.queue.claim_next(&self.id)?;
        if job.is_some() {
            metrics::record_claim();
        }
        Ok(job)
    }

    async fn execute(&self, job: &SyncJob) -> WorkerResult<u64> {
        let key = &job.key;
        let client = self
            .clients
            .get(&key.tenant_id, &key.provider_id)
            .ok_or_else(|| WorkerError::NoClient {
                tenant_id: key.tenant_id.clone(),
                provider_id: key.provider_id.clone(),
            })?;
        let since = job.payload.since();

        match job.operation_kind {
            OperationKind::Events => {
                let events = client.list_events(since).await?;
                let now = Utc::now();
                for event in &events {
                    self.catalog
                        .upsert_event(&key.tenant_id, &key.provider_id, event, now)?;
                }
                Ok(events.len() as u64)
            }
            OperationKind::Participants => {
                let participants = client.list_participants(&key.event_id, since).await?;
                self.sink
                    .store(key, &participants, job.payload.is_incremental)
                    .await
            }
        }
    }

    fn finish(&self, job: &SyncJob, result: WorkerResult<u64>) -> WorkerResult<JobRun> {
        let completion = match result {
            Ok(records) => JobCompletion::success(records),
            Err(e) => {
                tracing::warn!(
                    worker_id = %self.id,
                    job_id = job.job_id,
                    event = %job.key,
                    kind = %job.operation_kind,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Job failed"
                );
                JobCompletion::failed(e.to_string())
            }
        };

        self.queue.complete(job.job_id, job.attempts, &completion)?;
        metrics::record_completion(job.operation_kind.as_str(), completion.status.as_str());

        Ok(JobRun {
            job_id: job.job_id,
            key: job.key.clone(),
            operation_kind: job.operation_kind,
            attempt: job.attempts,
            completion,
        })
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("clients", &self.clients)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        JobPayload, JobStatus, NewSyncJob, OutcomeStatus, ProviderCredential, ProviderEvent,
        SyncTrigger,
    };
    use crate::storage::{Database, SqliteJobStore, SqliteSyncCatalog};
    use chrono::{DateTime, Duration};

    struct FakeClient {
        fail: bool,
    }

    #[async_trait]
    impl ProviderClient for FakeClient {
        fn provider_id(&self) -> &str {
            "runsignup"
        }

        async fn list_events(
            &self,
            _since: Option<DateTime<Utc>>,
        ) -> WorkerResult<Vec<ProviderEvent>> {
            Ok(vec![ProviderEvent {
                event_id: "e1".into(),
                name: Some("City Marathon".into()),
                start_time: Some(Utc::now() + Duration::days(2)),
            }])
        }

        async fn list_participants(
            &self,
            event_id: &str,
            since: Option<DateTime<Utc>>,
        ) -> WorkerResult<Vec<Participant>> {
            if self.fail {
                return Err(WorkerError::provider("runsignup", "HTTP 503", true));
            }
            let count = if since.is_some() { 1 } else { 3 };
            Ok((0..count)
                .map(|i| Participant {
                    participant_id: format!("p{i}"),
                    event_id: event_id.to_string(),
                    data: serde_json::json!({ "bib": i }),
                })
                .collect())
        }
    }

    struct Fixture {
        queue: Arc<SqliteJobStore>,
        catalog: Arc<SqliteSyncCatalog>,
        sink: Arc<MemorySink>,
        worker: Worker,
    }

    fn fixture(fail: bool) -> Fixture {
        let db = Database::in_memory().unwrap();
        let queue = Arc::new(SqliteJobStore::new(db.clone()));
        let catalog = Arc::new(SqliteSyncCatalog::new(db));
        catalog
            .upsert_credential(&ProviderCredential {
                tenant_id: "acme".into(),
                provider_id: "runsignup".into(),
                api_key: None,
                enabled: true,
            })
            .unwrap();
        let mut clients = ClientRegistry::new();
        clients.register("acme", Arc::new(FakeClient { fail }));
        let sink = Arc::new(MemorySink::new());
        let worker = Worker::new(
            "worker-1",
            queue.clone(),
            catalog.clone(),
            Arc::new(clients),
            sink.clone(),
        )
        .with_poll_interval(Duration::milliseconds(10).to_std().unwrap());
        Fixture {
            queue,
            catalog,
            sink,
            worker,
        }
    }

    fn enqueue(queue: &SqliteJobStore, tenant: &str, kind: OperationKind, payload: JobPayload) -> JobId {
        queue
            .enqueue(&NewSyncJob::new(
                EventKey::new(tenant, "runsignup", "e1"),
                kind,
                2,
                payload,
                Utc::now(),
            ))
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_once_on_empty_queue() {
        let f = fixture(false);
        assert!(f.worker.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_events_job_tracks_provider_events() {
        let f = fixture(false);
        enqueue(&f.queue, "acme", OperationKind::Events, JobPayload::full(SyncTrigger::Scheduled));

        let run = f.worker.run_once().await.unwrap().unwrap();
        assert_eq!(run.completion.records_synced, 1);

        let event = f
            .catalog
            .find_event(&EventKey::new("acme", "runsignup", "e1"))
            .unwrap()
            .unwrap();
        assert_eq!(event.name.as_deref(), Some("City Marathon"));
    }

    #[tokio::test]
    async fn test_participants_job_full_then_incremental() {
        let f = fixture(false);
        let key = EventKey::new("acme", "runsignup", "e1");

        let id = enqueue(&f.queue, "acme", OperationKind::Participants, JobPayload::full(SyncTrigger::Scheduled));
        let run = f.worker.run_once().await.unwrap().unwrap();
        assert_eq!(run.job_id, id);
        assert_eq!(run.completion.records_synced, 3);
        assert_eq!(f.queue.get(id).unwrap().unwrap().status, JobStatus::Success);

        enqueue(
            &f.queue,
            "acme",
            OperationKind::Participants,
            JobPayload::incremental(Utc::now() - Duration::minutes(5)),
        );
        let run = f.worker.run_once().await.unwrap().unwrap();
        assert_eq!(run.completion.records_synced, 1);
        // Incremental batches merge into what is already stored
        assert_eq!(f.sink.participants(&key).len(), 3);
    }

    #[tokio::test]
    async fn test_provider_failure_completes_job_as_failed() {
        let f = fixture(true);
        let id = enqueue(&f.queue, "acme", OperationKind::Participants, JobPayload::default());

        let run = f.worker.run_once().await.unwrap().unwrap();
        assert_eq!(run.completion.status, OutcomeStatus::Failed);
        let job = f.queue.get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.failure_reason.unwrap().contains("HTTP 503"));
    }

    #[tokio::test]
    async fn test_missing_client_fails_job() {
        let f = fixture(false);
        let id = enqueue(&f.queue, "globex", OperationKind::Participants, JobPayload::default());

        let run = f.worker.run_once().await.unwrap().unwrap();
        assert_eq!(run.completion.status, OutcomeStatus::Failed);
        assert_eq!(f.queue.get(id).unwrap().unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_stops() {
        let f = fixture(false);
        enqueue(&f.queue, "acme", OperationKind::Participants, JobPayload::default());
        enqueue(&f.queue, "acme", OperationKind::Events, JobPayload::default());

        let (tx, rx) = watch::channel(false);
        let worker = Arc::new(f.worker);
        let handle = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run(rx).await })
        };

        for _ in 0..100 {
            let counts = f.queue.counts_by_provider().unwrap();
            if counts.iter().all(|c| c.active() == 0) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let counts = f.queue.counts_by_provider().unwrap();
        assert_eq!(counts[0].success, 2);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(WorkerError::provider("p", "timeout", true).is_retryable());
        assert!(!WorkerError::provider("p", "bad credentials", false).is_retryable());
        assert!(!WorkerError::NoClient {
            tenant_id: "t".into(),
            provider_id: "p".into()
        }
        .is_retryable());
        assert!(WorkerError::Cancelled.is_retryable());
    }
}
