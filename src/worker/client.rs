//! Provider client capability and per-provider rate limiting

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use super::WorkerResult;
use crate::models::{Participant, ProviderEvent};

/// Read access to one provider account
///
/// Implementations own their transport and credentials. `since` requests a
/// "changed since" listing; `None` means everything.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Provider name, matching `provider_id` on tracked events
    fn provider_id(&self) -> &str;

    async fn list_events(&self, since: Option<DateTime<Utc>>) -> WorkerResult<Vec<ProviderEvent>>;

    async fn list_participants(
        &self,
        event_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> WorkerResult<Vec<Participant>>;
}

// ============================================================================
// Rate Limiting
// ============================================================================

/// Wraps a client so every call waits for the provider's request quota
pub struct RateLimitedClient<C> {
    inner: C,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl<C: ProviderClient> RateLimitedClient<C> {
    /// Allow at most `requests_per_second` calls, with bursts of the same size
    pub fn new(inner: C, requests_per_second: u32) -> Self {
        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            inner,
            rate_limiter: RateLimiter::direct(Quota::per_second(rate)),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: ProviderClient> ProviderClient for RateLimitedClient<C> {
    fn provider_id(&self) -> &str {
        self.inner.provider_id()
    }

    async fn list_events(&self, since: Option<DateTime<Utc>>) -> WorkerResult<Vec<ProviderEvent>> {
        self.rate_limiter.until_ready().await;
        self.inner.list_events(since).await
    }

    async fn list_participants(
        &self,
        event_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> WorkerResult<Vec<Participant>> {
        self.rate_limiter.until_ready().await;
        self.inner.list_participants(event_id, since).await
    }
}

// ============================================================================
// Client Registry
// ============================================================================

/// Provider clients keyed by (tenant, provider)
#[derive(Default, Clone)]
pub struct ClientRegistry {
    clients: HashMap<(String, String), Arc<dyn ProviderClient>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the client a tenant uses for its provider account
    pub fn register(&mut self, tenant_id: impl Into<String>, client: Arc<dyn ProviderClient>) {
        let provider_id = client.provider_id().to_string();
        self.clients.insert((tenant_id.into(), provider_id), client);
    }

    pub fn get(&self, tenant_id: &str, provider_id: &str) -> Option<Arc<dyn ProviderClient>> {
        self.clients
            .get(&(tenant_id.to_string(), provider_id.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.clients.keys().collect::<Vec<_>>())
            .finish()
    }
}
