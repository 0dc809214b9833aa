//! Client-facing signaling: wire protocol, per-connection sessions, the
//! waiting room and the WebSocket endpoint.

pub mod admission;
pub mod protocol;
pub mod session;
pub mod ws;

pub use admission::{AdmissionController, WaitingEntry};
pub use protocol::{ClientEnvelope, ClientMessage, IceServer, ServerEnvelope, ServerMessage};
pub use session::{SignalingContext, SignalingSession};
pub use ws::signaling_router;
