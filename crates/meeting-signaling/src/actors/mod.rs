//! Actor hierarchy for the signaling node.
//!
//! ```text
//! SignalingHubActor (singleton)
//! └── MeetingActor (one per meeting with sessions)
//!         owns sessions + waiting room, talks to its room
//!
//! RoomRegistryActor (singleton)
//! └── RoomActor (one per live room, bound to one media worker)
//!         owns participants, transports, producers, consumers
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single owner per state**: every mutable map has exactly one owning task
//! - **Engine calls off the loop**: rooms and the registry spawn engine calls
//!   and re-validate the result when it comes back as a completion
//! - **CancellationToken propagation**: rooms hold child tokens of the
//!   registry, meetings of the hub
//! - **Mailbox monitoring**: depth thresholds per actor type with metrics
//!
//! # Modules
//!
//! - [`hub`] - `SignalingHubActor`, meeting actor supervisor
//! - [`meeting`] - `MeetingActor`, admission and relay for one meeting
//! - [`registry`] - `RoomRegistryActor`, meeting → room map
//! - [`room`] - `RoomActor`, media resources of one room
//! - [`participant`] - per-participant resource bookkeeping inside a room
//! - [`messages`] - message types for actor communication
//! - [`metrics`] - mailbox monitoring and actor counts

pub mod hub;
pub mod meeting;
pub mod messages;
pub mod metrics;
pub mod participant;
pub mod registry;
pub mod room;

pub use hub::{SignalingHubActor, SignalingHubHandle};
pub use meeting::{MeetingActor, MeetingActorHandle};
pub use messages::*;
pub use metrics::{ActorMetrics, MailboxMonitor};
pub use registry::RoomRegistryHandle;
pub use room::{RoomActor, RoomHandle};
