//! A fully wired signaling node without sockets.
//!
//! # Example
//!
//! ```rust,ignore
//! use signaling_test_utils::TestNode;
//!
//! let node = TestNode::builder().workers(2).start().await;
//! let mut client = node.connect();
//! ```

use crate::client::TestClient;
use meeting_signaling::actors::{ActorMetrics, RoomRegistryHandle, SignalingHubHandle};
use meeting_signaling::media::InMemoryMediaEngine;
use meeting_signaling::persistence::{InMemoryStore, MeetingStore};
use meeting_signaling::signaling::{IceServer, SignalingContext};
use meeting_signaling::{QualityMonitor, WorkerPool, WorkerPoolConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Every component a production node has, wired to the in-memory engine.
pub struct TestNode {
    pub engine: InMemoryMediaEngine,
    pub pool: Arc<WorkerPool>,
    pub registry: RoomRegistryHandle,
    pub hub: SignalingHubHandle,
    pub store: Arc<dyn MeetingStore>,
    pub metrics: Arc<ActorMetrics>,
    context: SignalingContext,
    shutdown: CancellationToken,
}

impl TestNode {
    /// One worker, default backoff, in-memory store.
    pub async fn start() -> Self {
        Self::builder().start().await
    }

    #[must_use]
    pub fn builder() -> TestNodeBuilder {
        TestNodeBuilder::default()
    }

    /// Open a new client connection.
    #[must_use]
    pub fn connect(&self) -> TestClient {
        TestClient::spawn(format!("conn-{}", Uuid::new_v4()), self.context.clone())
    }

    /// Spawn a quality monitor that stops with the node.
    #[must_use]
    pub fn spawn_quality_monitor(&self, interval: Duration) -> JoinHandle<()> {
        QualityMonitor::new(self.registry.clone(), self.hub.clone(), interval)
            .spawn(self.shutdown.child_token())
    }

    /// A quality monitor for driving passes by hand.
    #[must_use]
    pub fn quality_monitor(&self) -> QualityMonitor {
        QualityMonitor::new(self.registry.clone(), self.hub.clone(), Duration::from_secs(3600))
    }

    /// Shut the node down in production order.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.hub.shutdown().await;
        let _ = self.registry.shutdown().await;
        self.pool.shutdown();
    }
}

/// Builder for [`TestNode`].
pub struct TestNodeBuilder {
    workers: usize,
    respawn_backoff: Duration,
    sweep_interval: Duration,
    engine: InMemoryMediaEngine,
    store: Option<Arc<dyn MeetingStore>>,
}

impl Default for TestNodeBuilder {
    fn default() -> Self {
        Self {
            workers: 1,
            respawn_backoff: Duration::from_millis(50),
            sweep_interval: Duration::from_secs(30),
            engine: InMemoryMediaEngine::new(),
            store: None,
        }
    }
}

impl TestNodeBuilder {
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub fn respawn_backoff(mut self, backoff: Duration) -> Self {
        self.respawn_backoff = backoff;
        self
    }

    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Use a pre-configured engine (e.g. with spawn failures queued).
    #[must_use]
    pub fn engine(mut self, engine: InMemoryMediaEngine) -> Self {
        self.engine = engine;
        self
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn MeetingStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Start the node.
    ///
    /// # Panics
    ///
    /// Panics if the worker pool cannot start.
    pub async fn start(self) -> TestNode {
        let pool = WorkerPool::start(
            Arc::new(self.engine.clone()),
            WorkerPoolConfig {
                size: self.workers,
                respawn_backoff: self.respawn_backoff,
                max_respawn_backoff: self.respawn_backoff * 8,
            },
        )
        .await
        .expect("worker pool should start");

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()) as Arc<dyn MeetingStore>);
        let metrics = ActorMetrics::new();
        let registry =
            RoomRegistryHandle::new(Arc::clone(&pool), self.sweep_interval, Arc::clone(&metrics));
        let hub = SignalingHubHandle::new(registry.clone(), Arc::clone(&store), Arc::clone(&metrics));
        let shutdown = CancellationToken::new();

        let context = SignalingContext {
            hub: hub.clone(),
            store: Arc::clone(&store),
            ice_servers: Arc::from(vec![IceServer {
                urls: vec!["stun:stun.example.org:3478".to_string()],
                username: None,
                credential: None,
            }]),
            metrics: Arc::clone(&metrics),
            shutdown: shutdown.child_token(),
        };

        TestNode {
            engine: self.engine,
            pool,
            registry,
            hub,
            store,
            metrics,
            context,
            shutdown,
        }
    }
}
