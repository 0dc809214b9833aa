//! Metrics definitions for the signaling node.
//!
//! All metrics follow Prometheus naming conventions:
//! - `signaling_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `actor_type`: 4 values (registry, room, meeting, hub)
//! - `message_type`: bounded by the client event set (~15 values)
//! - `operation`: bounded by store operations (4 values)
//! - `score`: 1-5

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// # Errors
///
/// Returns error if a recorder is already installed or buckets are invalid.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Client message handling (p99 < 100ms)
        .set_buckets_for_metric(
            Matcher::Prefix("signaling_message".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        // Store calls
        .set_buckets_for_metric(
            Matcher::Prefix("signaling_store".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set store latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Metric: `signaling_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("signaling_rooms_active").set(count as f64);
}

/// Metric: `signaling_sessions_active`
pub fn set_sessions_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("signaling_sessions_active").set(count as f64);
}

/// Metric: `signaling_waiting_entries`
///
/// Total waiting-room entries across meetings. Updated by meeting actors with
/// a signed delta since each actor only knows its own queue.
pub fn add_waiting_entries(delta: i64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("signaling_waiting_entries").increment(delta as f64);
}

/// Metric: `signaling_workers_live`
pub fn set_workers_live(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("signaling_workers_live").set(count as f64);
}

/// Metric: `signaling_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &'static str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("signaling_actor_mailbox_depth", "actor_type" => actor_type).set(depth as f64);
}

// ============================================================================
// Counters
// ============================================================================

/// Metric: `signaling_worker_deaths_total`
pub fn record_worker_death() {
    counter!("signaling_worker_deaths_total").increment(1);
}

/// Metric: `signaling_worker_respawns_total`
/// Labels: `status` (success, error)
pub fn record_worker_respawn(status: &'static str) {
    counter!("signaling_worker_respawns_total", "status" => status).increment(1);
}

/// Metric: `signaling_room_failures_total`
pub fn record_room_failure() {
    counter!("signaling_room_failures_total").increment(1);
}

/// Metric: `signaling_chat_persist_failures_total`
pub fn record_chat_persist_failure() {
    counter!("signaling_chat_persist_failures_total").increment(1);
}

/// Metric: `signaling_admissions_total`
/// Labels: `mode` (direct, queued, explicit, host_arrival, denied)
pub fn record_admission(mode: &'static str) {
    counter!("signaling_admissions_total", "mode" => mode).increment(1);
}

// ============================================================================
// Histograms
// ============================================================================

/// Metric: `signaling_message_latency_seconds`
/// Labels: `message_type`
pub fn record_message_latency(message_type: &'static str, duration: Duration) {
    histogram!("signaling_message_latency_seconds", "message_type" => message_type)
        .record(duration.as_secs_f64());
}

/// Metric: `signaling_store_latency_seconds`
/// Labels: `operation`
pub fn record_store_latency(operation: &'static str, duration: Duration) {
    histogram!("signaling_store_latency_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

/// Metric: `signaling_quality_score`
///
/// Distribution of computed quality scores (1-5).
pub fn record_quality_score(score: u8) {
    histogram!("signaling_quality_score").record(f64::from(score));
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_recording_without_recorder_is_noop() {
        set_rooms_active(3);
        set_sessions_active(7);
        add_waiting_entries(1);
        add_waiting_entries(-1);
        record_worker_death();
        record_message_latency("join-room", Duration::from_millis(4));
    }

    #[test]
    fn test_metrics_are_recorded_with_signaling_prefix() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            set_rooms_active(2);
            set_workers_live(4);
            record_worker_death();
            record_worker_respawn("success");
            record_room_failure();
            record_chat_persist_failure();
            record_admission("host_arrival");
            record_quality_score(5);
            record_store_latency("save_chat_message", Duration::from_millis(2));
        });

        let metrics = snapshotter.snapshot().into_vec();
        assert!(metrics.len() >= 9);
        assert!(metrics
            .iter()
            .all(|(key, _, _, _)| key.key().name().starts_with("signaling_")));

        let rooms = metrics
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "signaling_rooms_active")
            .expect("rooms gauge recorded");
        assert_eq!(rooms.3, DebugValue::Gauge(2.0.into()));
    }
}
