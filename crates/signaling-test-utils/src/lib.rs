//! # Signaling Test Utilities
//!
//! Shared test utilities for the meeting signaling node.
//!
//! Everything runs in-process: the media engine is the in-memory engine with
//! fault injection, and clients talk to real `SignalingSession`s over
//! channels instead of sockets.
//!
//! ## Modules
//!
//! - `node` - A fully wired node (pool, registry, hub) for integration tests
//! - `client` - Scripted signaling client with request/reply correlation
//! - `store` - Store wrappers that fail or stall on demand
//! - `fixtures` - Meetings, participants and wire frames
//!
//! ## Usage
//!
//! ```rust,ignore
//! use signaling_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let node = TestNode::start().await;
//!     let meeting = TestMeeting::random();
//!
//!     let mut host = node.connect();
//!     host.join(&meeting, &TestParticipant::host("Hana")).await;
//!
//!     let mut candidate = node.connect();
//!     let reply = candidate.join(&meeting, &TestParticipant::candidate("Cai")).await;
//!     assert!(matches!(reply, ServerMessage::WaitingRoom { .. }));
//! }
//! ```

pub mod client;
pub mod fixtures;
pub mod node;
pub mod store;

pub use client::TestClient;
pub use fixtures::*;
pub use node::{TestNode, TestNodeBuilder};
pub use store::FlakyStore;

pub use meeting_signaling::signaling::{ClientMessage, ServerEnvelope, ServerMessage};
