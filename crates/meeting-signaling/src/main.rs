//! Meeting Signaling Node
//!
//! WebSocket signaling server for live video interviews.
//!
//! # Servers
//!
//! - WebSocket server for client signaling (default: 0.0.0.0:4000)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Open the durable store (Redis when `REDIS_URL` is set, in-memory otherwise)
//! 4. Start the media worker pool
//! 5. Initialize actor system (room registry, signaling hub)
//! 6. Start the quality monitor
//! 7. Start health and signaling servers
//! 8. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::secret::ExposeSecret;
use meeting_signaling::actors::{ActorMetrics, RoomRegistryHandle, SignalingHubHandle};
use meeting_signaling::config::Config;
use meeting_signaling::media::InMemoryMediaEngine;
use meeting_signaling::observability::metrics::init_metrics_recorder;
use meeting_signaling::observability::{health_router, HealthState};
use meeting_signaling::persistence::{InMemoryStore, MeetingStore, RedisMeetingStore};
use meeting_signaling::signaling::{signaling_router, SignalingContext};
use meeting_signaling::{QualityMonitor, WorkerPool};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound on the drain of open meetings at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meeting_signaling=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Meeting Signaling node");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        node_id = %config.node_id,
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        worker_count = config.worker_count,
        quality_poll_interval_ms = u64::try_from(config.quality_poll_interval.as_millis()).unwrap_or(u64::MAX),
        durable_store = config.redis_url.is_some(),
        "Configuration loaded successfully"
    );

    // This must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let store: Arc<dyn MeetingStore> = match &config.redis_url {
        Some(redis_url) => {
            info!("Connecting to Redis...");
            let store = RedisMeetingStore::connect(redis_url.expose_secret())
                .await
                .map_err(|e| {
                    error!(error = %e, "Failed to connect to Redis");
                    e
                })?;
            info!("Redis connection established");
            Arc::new(store)
        }
        None => {
            warn!("REDIS_URL not set, chat and participant records are kept in memory");
            Arc::new(InMemoryStore::new())
        }
    };

    info!(workers = config.worker_count, "Starting media worker pool...");
    let pool = WorkerPool::start(Arc::new(InMemoryMediaEngine::new()), config.worker_pool())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to start media worker pool");
            e
        })?;
    info!(live = pool.live_count(), "Media worker pool started");

    let health_state = Arc::new(HealthState::with_pool(Arc::clone(&pool)));

    info!("Initializing actor system...");
    let actor_metrics = ActorMetrics::new();
    let registry = RoomRegistryHandle::new(
        Arc::clone(&pool),
        config.room_sweep_interval,
        Arc::clone(&actor_metrics),
    );
    let hub = SignalingHubHandle::new(
        registry.clone(),
        Arc::clone(&store),
        Arc::clone(&actor_metrics),
    );
    info!("Actor system initialized");

    let shutdown_token = CancellationToken::new();

    let quality_task = QualityMonitor::new(registry.clone(), hub.clone(), config.quality_poll_interval)
        .spawn(shutdown_token.child_token());

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let health_app = health_router(Arc::clone(&health_state), Some(prometheus_handle));

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;
    info!(addr = %health_addr, "Health server bound successfully");

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Signaling server
    let signaling_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;

    let context = SignalingContext {
        hub: hub.clone(),
        store,
        ice_servers: config.ice_servers().into(),
        metrics: Arc::clone(&actor_metrics),
        shutdown: shutdown_token.child_token(),
    };
    let signaling_app = signaling_router(context).layer(TraceLayer::new_for_http());

    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;
    info!(addr = %signaling_addr, "Signaling server bound successfully");

    let signaling_shutdown_token = shutdown_token.child_token();
    let signaling_task = tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_ready();
    info!(node_id = %config.node_id, "Meeting Signaling node running - press Ctrl+C to shutdown");

    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so the load balancer stops routing here
    health_state.set_not_ready();

    // Sessions end, servers stop accepting, the quality monitor stops
    shutdown_token.cancel();

    if tokio::time::timeout(SHUTDOWN_GRACE, signaling_task)
        .await
        .is_err()
    {
        warn!("Signaling server did not drain in time");
    }
    let _ = quality_task.await;

    if let Err(e) = hub.shutdown().await {
        warn!(error = %e, "Signaling hub shutdown error");
    }
    if let Err(e) = registry.shutdown().await {
        warn!(error = %e, "Room registry shutdown error");
    }
    pool.shutdown();

    info!("Meeting Signaling node shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
