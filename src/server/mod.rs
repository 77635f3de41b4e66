//! Operator HTTP API
//!
//! A thin axum layer over [`EngineHandle`]: health and status, job counts,
//! the manual sync trigger, an on-demand watchdog sweep, the schedule table
//! and prometheus metrics. The server never owns the engine lifecycle; the
//! caller starts and stops the engine around it.

pub mod api;
pub mod config;

pub use api::{create_router, ApiResponse, ErrorResponse, HealthResponse, ManualSyncRequest};
pub use config::{ConfigError, ServerConfig, ServerConfigBuilder};

use std::net::SocketAddr;
use std::time::Instant;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::engine::EngineHandle;

// ============================================================================
// App State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Running sync engine
    pub engine: EngineHandle,

    /// Server start time
    pub start_time: Instant,
}

// ============================================================================
// Sync API Server
// ============================================================================

/// Operator API server
pub struct SyncApiServer {
    config: ServerConfig,
    state: AppState,
}

impl SyncApiServer {
    /// Create a new API server over an engine handle
    pub fn new(config: ServerConfig, engine: EngineHandle) -> Self {
        let state = AppState {
            engine,
            start_time: Instant::now(),
        };

        Self { config, state }
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn bind_address(&self) -> SocketAddr {
        self.config.bind_address
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let mut router = create_router(self.state.clone());

        if self.config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }

        if self.config.enable_request_logging {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Serve until `shutdown_signal` resolves
    pub async fn start_with_shutdown(
        &self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let router = self.build_router();
        let addr = self.config.bind_address;

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(e.to_string()))?;

        tracing::info!(address = %addr, "Operator API listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::ServeError(e.to_string()))?;

        tracing::info!("Operator API shutdown complete");
        Ok(())
    }
}

/// Server errors
#[derive(Debug)]
pub enum ServerError {
    BindError(String),
    ServeError(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BindError(msg) => write!(f, "Failed to bind: {}", msg),
            Self::ServeError(msg) => write!(f, "Server error: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::SyncEngine;
    use crate::models::{ProviderCredential, ProviderEvent};
    use crate::storage::Database;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::{Duration, Utc};
    use tower::ServiceExt;

    fn server() -> (SyncEngine, SyncApiServer) {
        let engine = SyncEngine::with_database(Database::in_memory().unwrap(), &Config::default())
            .unwrap();
        let server = SyncApiServer::new(ServerConfig::default(), engine.handle());
        (engine, server)
    }

    fn seed(engine: &SyncEngine) {
        let catalog = engine.handle().catalog();
        catalog
            .upsert_credential(&ProviderCredential {
                tenant_id: "acme".into(),
                provider_id: "runsignup".into(),
                api_key: None,
                enabled: true,
            })
            .unwrap();
        catalog
            .upsert_event(
                "acme",
                "runsignup",
                &ProviderEvent {
                    event_id: "e1".into(),
                    name: Some("Harbor 10K".into()),
                    start_time: Some(Utc::now() + Duration::hours(2)),
                },
                Utc::now(),
            )
            .unwrap();
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (_engine, server) = server();
        let response = server
            .build_router()
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["tick_loop_running"], false);
    }

    #[tokio::test]
    async fn test_manual_sync_endpoint() {
        let (engine, server) = server();
        seed(&engine);

        let request = Request::post("/api/sync")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"tenant_id":"acme","provider_id":"runsignup","event_id":"e1"}"#,
            ))
            .unwrap();
        let response = server.build_router().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["enqueued_job_ids"].as_array().unwrap().len(), 2);

        let stats = server
            .build_router()
            .oneshot(Request::get("/api/jobs/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(stats).await;
        assert_eq!(body["data"][0]["provider_id"], "runsignup");
        assert_eq!(body["data"][0]["pending"], 2);
    }

    #[tokio::test]
    async fn test_manual_sync_unknown_event_is_404() {
        let (engine, server) = server();
        seed(&engine);

        let request = Request::post("/api/sync")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"tenant_id":"acme","provider_id":"runsignup","event_id":"missing"}"#,
            ))
            .unwrap();
        let response = server.build_router().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_requeue_stuck_endpoint() {
        let (_engine, server) = server();
        let response = server
            .build_router()
            .oneshot(
                Request::post("/api/jobs/requeue-stuck")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["requeued"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        crate::metrics::init_metrics().ok();
        let (_engine, server) = server();
        let response = server
            .build_router()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_server_error_display() {
        let err = ServerError::BindError("address in use".into());
        assert_eq!(err.to_string(), "Failed to bind: address in use");
    }
}
