//! Observability for the signaling node.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//! Chat contents and display names are never logged or used as labels.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `signaling_rooms_active` | Gauge | none |
//! | `signaling_sessions_active` | Gauge | none |
//! | `signaling_waiting_entries` | Gauge | none |
//! | `signaling_workers_live` | Gauge | none |
//! | `signaling_actor_mailbox_depth` | Gauge | `actor_type` |
//! | `signaling_worker_deaths_total` | Counter | none |
//! | `signaling_worker_respawns_total` | Counter | `status` |
//! | `signaling_room_failures_total` | Counter | none |
//! | `signaling_chat_persist_failures_total` | Counter | none |
//! | `signaling_admissions_total` | Counter | `mode` |
//! | `signaling_message_latency_seconds` | Histogram | `message_type` |
//! | `signaling_store_latency_seconds` | Histogram | `operation` |
//! | `signaling_quality_score` | Histogram | none |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
