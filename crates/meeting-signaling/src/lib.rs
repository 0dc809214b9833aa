//! Meeting Signaling Library
//!
//! Signaling and media-session control for live video interviews:
//!
//! - WebSocket signaling sessions, one per client connection
//! - Waiting-room admission with host-driven admit/deny/kick
//! - One media room per meeting, placed on a pool of media workers
//! - Worker crash detection with automatic replacement
//! - Periodic network-quality scoring pushed to participants
//!
//! # Architecture
//!
//! ```text
//! SignalingHubActor (singleton per node)
//! ├── supervises N MeetingActors
//! │   └── MeetingActor (one per active meeting)
//! │       ├── owns sessions, waiting room, admitted set
//! │       └── drives the meeting's RoomHandle
//! RoomRegistryActor (meeting -> room, idle sweep)
//! └── RoomActor (one per meeting, bound to one media worker)
//! WorkerPool (fixed slots, round-robin, supervised respawn)
//! QualityMonitor (interval task over the registry)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Hub, meeting, registry and room actors
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with client-facing codes
//! - [`media`] - Media engine abstraction and in-memory engine
//! - [`persistence`] - Durable chat and participant records
//! - [`signaling`] - Wire protocol, sessions and the WebSocket endpoint

pub mod actors;
pub mod config;
pub mod errors;
pub mod media;
pub mod observability;
pub mod persistence;
pub mod quality;
pub mod signaling;
pub mod worker_pool;

pub use config::Config;
pub use errors::SignalingError;
pub use quality::{compute_quality_score, QualityMonitor};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};
