//! Health and metrics endpoints.
//!
//! - `GET /health` - liveness
//! - `GET /ready` - readiness: the signaling listener is bound, the node is
//!   not shutting down, and the worker pool has at least one live worker
//! - `GET /metrics` - Prometheus text format (when a recorder handle is given)

use crate::worker_pool::WorkerPool;
use axum::{extract::State, http::StatusCode, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Liveness and readiness flags for the signaling node.
pub struct HealthState {
    live: AtomicBool,
    /// Set once the signaling listener is bound, cleared on shutdown.
    ready: AtomicBool,
    /// Readiness additionally requires a live worker when a pool is attached.
    pool: Option<Arc<WorkerPool>>,
}

impl std::fmt::Debug for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthState")
            .field("live", &self.live.load(Ordering::SeqCst))
            .field("ready", &self.ready.load(Ordering::SeqCst))
            .field("pool_attached", &self.pool.is_some())
            .finish()
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (live=true, ready=false).
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            pool: None,
        }
    }

    /// Health state whose readiness also tracks the worker pool.
    #[must_use]
    pub fn with_pool(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool: Some(pool),
            ..Self::new()
        }
    }

    /// Mark the service as ready to serve traffic.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Mark the service as not ready (e.g., during shutdown).
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    /// Check if the service is live.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
            && self.pool.as_ref().map_or(true, |pool| pool.live_count() > 0)
    }
}

/// Create the health router.
///
/// `/metrics` is only mounted when a Prometheus handle is supplied.
pub fn health_router(
    health_state: Arc<HealthState>,
    metrics_handle: Option<PrometheusHandle>,
) -> Router {
    let router = Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state);

    match metrics_handle {
        Some(handle) => router.route("/metrics", get(move || async move { handle.render() })),
        None => router,
    }
}

/// Returns 200 while the process is running.
async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Returns 200 when ready, 503 otherwise.
async fn readiness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_health_state_default() {
        let state = HealthState::new();
        assert!(state.is_live(), "Should be live by default");
        assert!(!state.is_ready(), "Should not be ready by default");
    }

    #[test]
    fn test_health_state_set_ready() {
        let state = HealthState::new();

        state.set_ready();
        assert!(state.is_ready(), "Should be ready after set_ready()");

        state.set_not_ready();
        assert!(
            !state.is_ready(),
            "Should not be ready after set_not_ready()"
        );
    }

    #[tokio::test]
    async fn test_readiness_requires_live_worker() {
        use crate::media::InMemoryMediaEngine;
        use crate::worker_pool::WorkerPoolConfig;
        use std::time::Duration;

        let engine = InMemoryMediaEngine::new();
        let config = WorkerPoolConfig {
            size: 1,
            respawn_backoff: Duration::from_millis(2000),
            max_respawn_backoff: Duration::from_millis(30_000),
        };
        let pool = WorkerPool::start(Arc::new(engine.clone()), config)
            .await
            .expect("pool starts");
        let state = HealthState::with_pool(Arc::clone(&pool));
        state.set_ready();
        assert!(state.is_ready());

        let worker_id = engine.live_worker_ids().remove(0);
        engine.kill_worker(&worker_id);
        tokio::time::timeout(Duration::from_secs(1), async {
            while pool.live_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("worker marked dead");

        assert!(!state.is_ready(), "no live worker means not ready");
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_liveness_handler_returns_ok() {
        let state = Arc::new(HealthState::new());
        let status = liveness_handler(State(state)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_handler_returns_unavailable_when_not_ready() {
        let state = Arc::new(HealthState::new());
        let status = readiness_handler(State(state)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readiness_handler_returns_ok_when_ready() {
        let state = Arc::new(HealthState::new());
        state.set_ready();
        let status = readiness_handler(State(Arc::clone(&state))).await;
        assert_eq!(status, StatusCode::OK);
    }

    // ========================================================================
    // Integration tests for health_router
    // ========================================================================

    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn test_health_router_liveness_endpoint() {
        let state = Arc::new(HealthState::new());
        let app = health_router(state, None);

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .expect("Failed to build request");

        let response = app
            .oneshot(request)
            .await
            .expect("Failed to execute request");

        assert_eq!(
            response.status(),
            StatusCode::OK,
            "/health should return 200 OK when live"
        );
    }

    #[tokio::test]
    async fn test_health_router_readiness_endpoint_not_ready() {
        let state = Arc::new(HealthState::new());
        let app = health_router(state, None);

        let request = Request::builder()
            .uri("/ready")
            .body(Body::empty())
            .expect("Failed to build request");

        let response = app
            .oneshot(request)
            .await
            .expect("Failed to execute request");

        assert_eq!(
            response.status(),
            StatusCode::SERVICE_UNAVAILABLE,
            "/ready should return 503 when not ready"
        );
    }

    #[tokio::test]
    async fn test_health_router_readiness_endpoint_ready() {
        let state = Arc::new(HealthState::new());
        state.set_ready();
        let app = health_router(state, None);

        let request = Request::builder()
            .uri("/ready")
            .body(Body::empty())
            .expect("Failed to build request");

        let response = app
            .oneshot(request)
            .await
            .expect("Failed to execute request");

        assert_eq!(
            response.status(),
            StatusCode::OK,
            "/ready should return 200 when ready"
        );
    }

    #[tokio::test]
    async fn test_health_router_unknown_path_returns_404() {
        let state = Arc::new(HealthState::new());
        let app = health_router(state, None);

        let request = Request::builder()
            .uri("/unknown")
            .body(Body::empty())
            .expect("Failed to build request");

        let response = app
            .oneshot(request)
            .await
            .expect("Failed to execute request");

        assert_eq!(
            response.status(),
            StatusCode::NOT_FOUND,
            "Unknown paths should return 404"
        );
    }

    #[tokio::test]
    async fn test_metrics_endpoint_mounted_only_with_handle() {
        use http_body_util::BodyExt;
        use metrics_exporter_prometheus::PrometheusBuilder;

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("signaling_worker_deaths_total").increment(1);
        });

        let app = health_router(Arc::new(HealthState::new()), Some(handle));
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("signaling_worker_deaths_total 1"), "{text}");

        let app = health_router(Arc::new(HealthState::new()), None);
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
