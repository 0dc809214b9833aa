//! Media engine capability.
//!
//! The media engine (workers, routers, ICE/DTLS transports, RTP producers and
//! consumers) runs outside this service. These traits are the only surface the
//! signaling layer depends on. Negotiation payloads are opaque JSON.
//!
//! ```text
//! MediaEngine ──spawns──▶ MediaWorker ──creates──▶ RoutingContext
//!                                                     │
//!                                   creates ◀─────────┘
//!                                      ▼
//!                               MediaTransport ──▶ MediaProducer / MediaConsumer
//! ```
//!
//! Liveness is signalled through [`CancellationToken`]s: a worker's `died()`
//! token fires when the worker process dies, a transport's `closed()` token
//! fires when the transport closes on its own (handshake failure, DTLS close).

pub mod memory;

use async_trait::async_trait;
use common::types::{MediaKind, TransportDirection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use memory::InMemoryMediaEngine;

pub type WorkerId = String;
pub type TransportId = String;
pub type ProducerId = String;
pub type ConsumerId = String;

/// Errors reported by the media engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    /// The worker backing the call is dead.
    #[error("worker {0} is dead")]
    WorkerDead(WorkerId),

    /// Spawning a worker process failed.
    #[error("worker spawn failed: {0}")]
    SpawnFailed(String),

    /// ICE/DTLS handshake failed; the transport has closed itself.
    #[error("transport handshake failed: {0}")]
    HandshakeFailed(String),

    /// The referenced engine object is already closed.
    #[error("{0} is closed")]
    Closed(String),

    /// Any other engine-side failure.
    #[error("engine error: {0}")]
    Engine(String),
}

/// Transport parameters returned to the client after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: TransportId,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Consumer parameters returned to the client after a successful consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

/// Inbound statistics for one producer.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ProducerStats {
    /// Current inbound bitrate in bits per second.
    pub bitrate_bps: u64,
    /// Fraction of packets lost, 0.0 - 1.0.
    pub fraction_lost: f64,
}

/// Spawns media workers.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Start a new worker process.
    async fn spawn_worker(&self) -> Result<Arc<dyn MediaWorker>, MediaError>;
}

/// One media worker process.
#[async_trait]
pub trait MediaWorker: Send + Sync {
    fn id(&self) -> &str;

    /// Token cancelled when the worker dies.
    fn died(&self) -> CancellationToken;

    /// Create a routing context (router) for one room.
    async fn create_routing_context(&self) -> Result<Arc<dyn RoutingContext>, MediaError>;

    /// Terminate the worker process.
    fn close(&self);
}

/// A room's router on one worker.
#[async_trait]
pub trait RoutingContext: Send + Sync {
    /// Capabilities the client loads its device with.
    fn rtp_capabilities(&self) -> Value;

    /// Whether a receiver with `capabilities` can decode `producer_id`.
    fn can_consume(&self, producer_id: &str, capabilities: &Value) -> bool;

    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<Arc<dyn MediaTransport>, MediaError>;

    /// Close the router and everything created through it.
    fn close(&self);
}

/// One ICE/DTLS transport.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn info(&self) -> TransportInfo;

    /// Token cancelled when the transport closes on its own or is closed.
    fn closed(&self) -> CancellationToken;

    async fn connect(&self, dtls_parameters: Value) -> Result<(), MediaError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<Arc<dyn MediaProducer>, MediaError>;

    /// Consumers are created paused.
    async fn consume(
        &self,
        producer_id: &str,
        capabilities: &Value,
    ) -> Result<Arc<dyn MediaConsumer>, MediaError>;

    fn close(&self);
}

/// One outbound media stream.
#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    async fn pause(&self) -> Result<(), MediaError>;
    async fn resume(&self) -> Result<(), MediaError>;
    async fn stats(&self) -> Result<ProducerStats, MediaError>;
    fn close(&self);
}

/// One inbound subscription to a producer.
#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> &str;
    fn producer_id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> Value;
    async fn resume(&self) -> Result<(), MediaError>;
    fn close(&self);
}

impl dyn MediaConsumer {
    /// Client-facing description of this consumer.
    pub fn info(&self) -> ConsumerInfo {
        ConsumerInfo {
            id: self.id().to_string(),
            producer_id: self.producer_id().to_string(),
            kind: self.kind(),
            rtp_parameters: self.rtp_parameters(),
        }
    }
}
