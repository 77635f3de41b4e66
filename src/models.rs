// Core data structures for the racesync scheduler

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier assigned to a job by the job store
pub type JobId = i64;

/// Composite key of a tracked event: (tenant, provider, event)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub tenant_id: String,
    pub provider_id: String,
    pub event_id: String,
}

impl EventKey {
    pub fn new(
        tenant_id: impl Into<String>,
        provider_id: impl Into<String>,
        event_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            provider_id: provider_id.into(),
            event_id: event_id.into(),
        }
    }

    /// True when every component is non-empty
    pub fn is_well_formed(&self) -> bool {
        !self.tenant_id.trim().is_empty()
            && !self.provider_id.trim().is_empty()
            && !self.event_id.trim().is_empty()
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.provider_id, self.event_id)
    }
}

/// Kind of work a sync job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Refresh event metadata from the provider's event listing
    Events,
    /// Refresh the participant list of one event
    Participants,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::Participants => "participants",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "events" => Some(Self::Events),
            "participants" => Some(Self::Participants),
            _ => None,
        }
    }

    pub fn all() -> [Self; 2] {
        [Self::Events, Self::Participants]
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data direction of a job. Only inbound pulls are scheduled today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    #[default]
    Inbound,
    Outbound,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

/// Lifecycle status of a sync job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Pending and running jobs count against the active-job unique index
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status recorded in sync history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn job_status(&self) -> JobStatus {
        match self {
            Self::Success => JobStatus::Success,
            Self::Failed => JobStatus::Failed,
        }
    }
}

/// What caused a job to be enqueued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncTrigger {
    #[default]
    Scheduled,
    Manual,
}

/// Context handed to the worker alongside a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct JobPayload {
    /// Whether the worker may use "changed since" semantics
    pub is_incremental: bool,

    /// Last successful participants sync, used as the "since" cursor
    pub last_sync_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub trigger: SyncTrigger,
}

impl JobPayload {
    /// Payload for a first-ever (or operator-forced) full sync
    pub fn full(trigger: SyncTrigger) -> Self {
        Self {
            is_incremental: false,
            last_sync_time: None,
            trigger,
        }
    }

    /// Payload for an incremental sync since `last_sync_time`
    pub fn incremental(last_sync_time: DateTime<Utc>) -> Self {
        Self {
            is_incremental: true,
            last_sync_time: Some(last_sync_time),
            trigger: SyncTrigger::Scheduled,
        }
    }

    /// Cursor to pass to the provider client
    pub fn since(&self) -> Option<DateTime<Utc>> {
        if self.is_incremental {
            self.last_sync_time
        } else {
            None
        }
    }
}

/// An event the catalog is tracking for one tenant and provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEvent {
    pub key: EventKey,
    pub name: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_successful_sync: Option<DateTime<Utc>>,
    pub full_sync_completed: bool,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of the catalog's candidate set, ready for the horizon policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCandidate {
    pub key: EventKey,

    /// `None` when the stored start time is missing or unreadable
    pub start_time: Option<DateTime<Utc>>,

    /// Fetch start of the most recent successful "participants" job; the
    /// "changed since" cursor for the next incremental sync
    pub last_successful_sync: Option<DateTime<Utc>>,

    pub full_sync_completed: bool,

    /// An "events" job has succeeded for this event at least once
    #[serde(default)]
    pub events_listed: bool,

    /// Whether an enabled credential exists for (tenant, provider)
    pub linked: bool,
}

/// An event as observed in a provider's event listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub event_id: String,
    pub name: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
}

/// A participant record returned by a provider client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: String,
    pub event_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Linkage between a tenant and a provider account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCredential {
    pub tenant_id: String,
    pub provider_id: String,
    pub api_key: Option<String>,
    pub enabled: bool,
}

/// A job about to be enqueued
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSyncJob {
    pub key: EventKey,
    pub operation_kind: OperationKind,
    pub direction: SyncDirection,
    pub priority: u8,
    pub payload: JobPayload,
    pub scheduled_time: DateTime<Utc>,
}

impl NewSyncJob {
    pub fn new(
        key: EventKey,
        operation_kind: OperationKind,
        priority: u8,
        payload: JobPayload,
        scheduled_time: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            operation_kind,
            direction: SyncDirection::Inbound,
            priority,
            payload,
            scheduled_time,
        }
    }
}

/// A persisted sync job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub job_id: JobId,
    pub key: EventKey,
    pub operation_kind: OperationKind,
    pub direction: SyncDirection,
    pub priority: u8,
    pub status: JobStatus,
    pub scheduled_time: DateTime<Utc>,
    pub started_time: Option<DateTime<Utc>>,
    pub completed_time: Option<DateTime<Utc>>,
    pub payload: JobPayload,

    /// Incremented on every claim; acts as the lease token for completion
    pub attempts: u32,
    pub worker_id: Option<String>,
    pub failure_reason: Option<String>,
}

/// Result a worker reports for a claimed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCompletion {
    pub status: OutcomeStatus,
    pub records_synced: u64,
    pub failure_reason: Option<String>,
}

impl JobCompletion {
    pub fn success(records_synced: u64) -> Self {
        Self {
            status: OutcomeStatus::Success,
            records_synced,
            failure_reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            records_synced: 0,
            failure_reason: Some(reason.into()),
        }
    }
}

/// Append-only sync history row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcomeRecord {
    pub outcome_id: i64,
    pub job_id: Option<JobId>,
    pub key: EventKey,
    pub operation_kind: OperationKind,
    pub sync_time: DateTime<Utc>,
    pub records_synced: u64,
    pub status: OutcomeStatus,
    pub failure_reason: Option<String>,
}

/// Job counts for one provider, consumed by health checks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderJobCounts {
    pub provider_id: String,
    pub pending: u64,
    pub running: u64,
    pub success: u64,
    pub failed: u64,
}

impl ProviderJobCounts {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            ..Default::default()
        }
    }

    pub fn active(&self) -> u64 {
        self.pending + self.running
    }
}
