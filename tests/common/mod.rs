//! Common test utilities

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use racesync::models::{Participant, ProviderCredential, ProviderEvent};
use racesync::storage::{Database, SqliteJobStore, SqliteSyncCatalog, SyncCatalog};
use racesync::worker::{ProviderClient, WorkerError, WorkerResult};

pub const TENANT: &str = "acme";
pub const PROVIDER: &str = "runsignup";

/// An on-disk database that lives as long as the returned `TempDir`
pub fn temp_db_path() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("racesync.db");
    (dir, path)
}

/// Store and catalog sharing one connection
pub struct Stores {
    pub db: Database,
    pub queue: Arc<SqliteJobStore>,
    pub catalog: Arc<SqliteSyncCatalog>,
}

pub fn open_stores(path: &std::path::Path) -> Stores {
    let db = Database::open(path).unwrap();
    Stores {
        queue: Arc::new(SqliteJobStore::new(db.clone())),
        catalog: Arc::new(SqliteSyncCatalog::new(db.clone())),
        db,
    }
}

/// Link a tenant to a provider with an enabled credential
pub fn link(catalog: &dyn SyncCatalog, tenant: &str, provider: &str) {
    catalog
        .upsert_credential(&ProviderCredential {
            tenant_id: tenant.to_string(),
            provider_id: provider.to_string(),
            api_key: Some("test-key".to_string()),
            enabled: true,
        })
        .unwrap();
}

/// Track an event as if a provider listing had just reported it
pub fn track(
    catalog: &dyn SyncCatalog,
    tenant: &str,
    provider: &str,
    event_id: &str,
    start: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) {
    catalog
        .upsert_event(
            tenant,
            provider,
            &ProviderEvent {
                event_id: event_id.to_string(),
                name: Some(format!("Race {event_id}")),
                start_time: start,
            },
            now,
        )
        .unwrap();
}

/// Provider client returning canned data
pub struct FakeProvider {
    pub provider_id: String,
    pub events: Vec<ProviderEvent>,
    pub participants: usize,
    pub fail_participants: bool,
    pub calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new(provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            events: Vec::new(),
            participants: 3,
            fail_participants: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_events(mut self, events: Vec<ProviderEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_participants = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClient for FakeProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn list_events(&self, _since: Option<DateTime<Utc>>) -> WorkerResult<Vec<ProviderEvent>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.events.clone())
    }

    async fn list_participants(
        &self,
        event_id: &str,
        _since: Option<DateTime<Utc>>,
    ) -> WorkerResult<Vec<Participant>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_participants {
            return Err(WorkerError::provider(&self.provider_id, "HTTP 502", true));
        }
        Ok((0..self.participants)
            .map(|i| Participant {
                participant_id: format!("{event_id}-p{i}"),
                event_id: event_id.to_string(),
                data: serde_json::json!({ "bib": 100 + i }),
            })
            .collect())
    }
}
