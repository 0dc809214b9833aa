//! In-process media engine.
//!
//! Implements the media traits without moving any media: objects are
//! bookkeeping records whose lifetimes are tied together with child
//! cancellation tokens (worker → router → transport → producer/consumer), so
//! killing a worker closes everything built on it, exactly like a real worker
//! crash.
//!
//! Used by the binary when no external engine is wired in, and by tests.
//! Fault injection knobs: kill a worker, fail the next N spawns, fail DTLS
//! handshakes, close a transport from the engine side, set producer stats and
//! add latency to every engine call.

use super::{
    MediaConsumer, MediaEngine, MediaError, MediaProducer, MediaTransport, MediaWorker,
    ProducerStats, RoutingContext, TransportInfo,
};
use async_trait::async_trait;
use common::types::{MediaKind, TransportDirection};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Codecs every router advertises (opus audio, VP8 and H264 video).
fn router_capabilities() -> Value {
    json!({
        "codecs": [
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
            {
                "kind": "video", "mimeType": "video/VP8", "clockRate": 90000,
                "parameters": { "x-google-start-bitrate": 1000 }
            },
            {
                "kind": "video", "mimeType": "video/H264", "clockRate": 90000,
                "parameters": {
                    "packetization-mode": 1,
                    "profile-level-id": "4d0032",
                    "level-asymmetry-allowed": 1
                }
            }
        ],
        "headerExtensions": []
    })
}

/// Whether `capabilities.codecs[].kind` lists `kind`.
fn capabilities_accept(capabilities: &Value, kind: MediaKind) -> bool {
    capabilities
        .get("codecs")
        .and_then(Value::as_array)
        .is_some_and(|codecs| {
            codecs
                .iter()
                .any(|codec| codec.get("kind").and_then(Value::as_str) == Some(kind.as_str()))
        })
}

#[derive(Default)]
struct EngineState {
    workers: Mutex<Vec<Arc<MemoryWorker>>>,
    transports: Mutex<HashMap<String, CancellationToken>>,
    stats: Mutex<HashMap<String, ProducerStats>>,
    default_stats: Mutex<ProducerStats>,
    failing_spawns: AtomicU32,
    fail_handshakes: AtomicBool,
    latency_ms: AtomicU64,
    spawned: AtomicU64,
}

impl EngineState {
    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn stats_for(&self, producer_id: &str) -> ProducerStats {
        lock(&self.stats)
            .get(producer_id)
            .copied()
            .unwrap_or_else(|| *lock(&self.default_stats))
    }
}

/// In-process [`MediaEngine`] with fault injection.
#[derive(Clone, Default)]
pub struct InMemoryMediaEngine {
    state: Arc<EngineState>,
}

impl InMemoryMediaEngine {
    #[must_use]
    pub fn new() -> Self {
        let engine = Self::default();
        engine.set_default_stats(ProducerStats {
            bitrate_bps: 600_000,
            fraction_lost: 0.0,
        });
        engine
    }

    /// Kill a worker as if its process crashed. Returns false if unknown.
    pub fn kill_worker(&self, worker_id: &str) -> bool {
        let workers = lock(&self.state.workers);
        match workers.iter().find(|w| w.id == worker_id) {
            Some(worker) => {
                warn!(target: "signaling.media", worker_id = %worker_id, "Simulating worker crash");
                worker.died.cancel();
                true
            }
            None => false,
        }
    }

    /// IDs of workers that are still alive, in spawn order.
    #[must_use]
    pub fn live_worker_ids(&self) -> Vec<String> {
        lock(&self.state.workers)
            .iter()
            .filter(|w| !w.died.is_cancelled())
            .map(|w| w.id.clone())
            .collect()
    }

    /// Total number of workers ever spawned.
    #[must_use]
    pub fn spawned_workers(&self) -> u64 {
        self.state.spawned.load(Ordering::SeqCst)
    }

    /// Make the next `count` spawn attempts fail.
    pub fn fail_next_spawns(&self, count: u32) {
        self.state.failing_spawns.store(count, Ordering::SeqCst);
    }

    /// Make every subsequent `connect` fail its handshake.
    pub fn set_fail_handshakes(&self, fail: bool) {
        self.state.fail_handshakes.store(fail, Ordering::SeqCst);
    }

    /// Delay every engine call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.state.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Stats reported for producers without an explicit override.
    pub fn set_default_stats(&self, stats: ProducerStats) {
        *lock(&self.state.default_stats) = stats;
    }

    /// Stats reported for one producer.
    pub fn set_producer_stats(&self, producer_id: &str, stats: ProducerStats) {
        lock(&self.state.stats).insert(producer_id.to_string(), stats);
    }

    /// Close a transport from the engine side (e.g. DTLS closed by peer).
    pub fn close_transport(&self, transport_id: &str) -> bool {
        match lock(&self.state.transports).remove(transport_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl MediaEngine for InMemoryMediaEngine {
    async fn spawn_worker(&self) -> Result<Arc<dyn MediaWorker>, MediaError> {
        self.state.simulate_latency().await;

        let failing = self
            .state
            .failing_spawns
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(MediaError::SpawnFailed("injected spawn failure".to_string()));
        }

        let worker = Arc::new(MemoryWorker {
            id: format!("worker-{}", new_id()),
            died: CancellationToken::new(),
            engine: Arc::clone(&self.state),
        });
        lock(&self.state.workers).push(Arc::clone(&worker));
        self.state.spawned.fetch_add(1, Ordering::SeqCst);

        debug!(target: "signaling.media", worker_id = %worker.id, "In-memory worker spawned");
        Ok(worker)
    }
}

struct MemoryWorker {
    id: String,
    died: CancellationToken,
    engine: Arc<EngineState>,
}

#[async_trait]
impl MediaWorker for MemoryWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn died(&self) -> CancellationToken {
        self.died.clone()
    }

    async fn create_routing_context(&self) -> Result<Arc<dyn RoutingContext>, MediaError> {
        self.engine.simulate_latency().await;
        if self.died.is_cancelled() {
            return Err(MediaError::WorkerDead(self.id.clone()));
        }
        Ok(Arc::new(MemoryRouter {
            token: self.died.child_token(),
            engine: Arc::clone(&self.engine),
            producers: Arc::new(Mutex::new(HashMap::new())),
        }))
    }

    fn close(&self) {
        self.died.cancel();
    }
}

type ProducerKinds = Arc<Mutex<HashMap<String, MediaKind>>>;

struct MemoryRouter {
    token: CancellationToken,
    engine: Arc<EngineState>,
    producers: ProducerKinds,
}

#[async_trait]
impl RoutingContext for MemoryRouter {
    fn rtp_capabilities(&self) -> Value {
        router_capabilities()
    }

    fn can_consume(&self, producer_id: &str, capabilities: &Value) -> bool {
        match lock(&self.producers).get(producer_id) {
            Some(kind) => capabilities_accept(capabilities, *kind),
            None => false,
        }
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<Arc<dyn MediaTransport>, MediaError> {
        self.engine.simulate_latency().await;
        if self.token.is_cancelled() {
            return Err(MediaError::Closed("router".to_string()));
        }

        let id = new_id();
        let token = self.token.child_token();
        lock(&self.engine.transports).insert(id.clone(), token.clone());

        Ok(Arc::new(MemoryTransport {
            info: TransportInfo {
                id,
                ice_parameters: json!({ "usernameFragment": new_id(), "password": new_id(), "iceLite": true }),
                ice_candidates: json!([
                    { "foundation": "udpcandidate", "ip": "127.0.0.1", "port": 10000, "protocol": "udp", "type": "host" }
                ]),
                dtls_parameters: json!({
                    "role": "auto",
                    "fingerprints": [{ "algorithm": "sha-256", "value": "00:11:22:33" }]
                }),
            },
            direction,
            token,
            connected: AtomicBool::new(false),
            engine: Arc::clone(&self.engine),
            producers: Arc::clone(&self.producers),
        }))
    }

    fn close(&self) {
        self.token.cancel();
    }
}

struct MemoryTransport {
    info: TransportInfo,
    direction: TransportDirection,
    token: CancellationToken,
    connected: AtomicBool,
    engine: Arc<EngineState>,
    producers: ProducerKinds,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<(), MediaError> {
        if self.token.is_cancelled() {
            Err(MediaError::Closed(format!("transport {}", self.info.id)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaTransport for MemoryTransport {
    fn info(&self) -> TransportInfo {
        self.info.clone()
    }

    fn closed(&self) -> CancellationToken {
        self.token.clone()
    }

    async fn connect(&self, dtls_parameters: Value) -> Result<(), MediaError> {
        self.engine.simulate_latency().await;
        self.ensure_open()?;

        if self.engine.fail_handshakes.load(Ordering::SeqCst) || !dtls_parameters.is_object() {
            // A failed handshake closes the transport, as DTLS "failed" does.
            self.close();
            return Err(MediaError::HandshakeFailed(format!(
                "dtls failed on transport {}",
                self.info.id
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        _rtp_parameters: Value,
        _app_data: Value,
    ) -> Result<Arc<dyn MediaProducer>, MediaError> {
        self.engine.simulate_latency().await;
        self.ensure_open()?;
        if self.direction != TransportDirection::Send {
            return Err(MediaError::Engine("cannot produce on a recv transport".to_string()));
        }

        let id = new_id();
        lock(&self.producers).insert(id.clone(), kind);
        Ok(Arc::new(MemoryProducer {
            id,
            kind,
            paused: AtomicBool::new(false),
            token: self.token.child_token(),
            engine: Arc::clone(&self.engine),
            producers: Arc::clone(&self.producers),
        }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        capabilities: &Value,
    ) -> Result<Arc<dyn MediaConsumer>, MediaError> {
        self.engine.simulate_latency().await;
        self.ensure_open()?;
        if self.direction != TransportDirection::Recv {
            return Err(MediaError::Engine("cannot consume on a send transport".to_string()));
        }

        let kind = lock(&self.producers)
            .get(producer_id)
            .copied()
            .ok_or_else(|| MediaError::Closed(format!("producer {producer_id}")))?;
        if !capabilities_accept(capabilities, kind) {
            return Err(MediaError::Engine("incompatible capabilities".to_string()));
        }

        Ok(Arc::new(MemoryConsumer {
            id: new_id(),
            producer_id: producer_id.to_string(),
            kind,
            paused: AtomicBool::new(true),
            token: self.token.child_token(),
        }))
    }

    fn close(&self) {
        lock(&self.engine.transports).remove(&self.info.id);
        self.token.cancel();
    }
}

struct MemoryProducer {
    id: String,
    kind: MediaKind,
    paused: AtomicBool,
    token: CancellationToken,
    engine: Arc<EngineState>,
    producers: ProducerKinds,
}

#[async_trait]
impl MediaProducer for MemoryProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn pause(&self) -> Result<(), MediaError> {
        self.engine.simulate_latency().await;
        if self.token.is_cancelled() {
            return Err(MediaError::Closed(format!("producer {}", self.id)));
        }
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<(), MediaError> {
        self.engine.simulate_latency().await;
        if self.token.is_cancelled() {
            return Err(MediaError::Closed(format!("producer {}", self.id)));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn stats(&self) -> Result<ProducerStats, MediaError> {
        self.engine.simulate_latency().await;
        if self.token.is_cancelled() {
            return Err(MediaError::Closed(format!("producer {}", self.id)));
        }
        if self.paused.load(Ordering::SeqCst) {
            return Ok(ProducerStats::default());
        }
        Ok(self.engine.stats_for(&self.id))
    }

    fn close(&self) {
        lock(&self.producers).remove(&self.id);
        self.token.cancel();
    }
}

struct MemoryConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    paused: AtomicBool,
    token: CancellationToken,
}

#[async_trait]
impl MediaConsumer for MemoryConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        json!({ "mid": self.id, "codecs": [{ "kind": self.kind.as_str() }] })
    }

    async fn resume(&self) -> Result<(), MediaError> {
        if self.token.is_cancelled() {
            return Err(MediaError::Closed(format!("consumer {}", self.id)));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.token.cancel();
    }
}
