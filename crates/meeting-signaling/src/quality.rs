//! Periodic network-quality scoring.
//!
//! Every tick the monitor walks the live rooms, reads the stats of one
//! representative producer per participant (the earliest-created live one)
//! and pushes a 1-5 score to every joined session of the room's meeting.
//!
//! Rooms are read from a registry snapshot; a room that stops mid-pass is
//! skipped for that tick.

use crate::actors::{RoomHandle, RoomRegistryHandle, SignalingHubHandle};
use crate::media::ProducerStats;
use crate::observability::metrics;

use common::types::UserId;
use futures::future::join_all;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Loss above this is a broken call.
const LOSS_BAD: f64 = 0.10;
/// Loss above this is poor.
const LOSS_POOR: f64 = 0.05;
const BITRATE_POOR_BPS: u64 = 50_000;
const BITRATE_FAIR_BPS: u64 = 150_000;
const BITRATE_GOOD_BPS: u64 = 400_000;

/// Map producer stats to a score, 1 (worst) to 5 (best).
///
/// Thresholds are checked worst first.
#[must_use]
pub fn compute_quality_score(stats: &ProducerStats) -> u8 {
    if stats.fraction_lost > LOSS_BAD || stats.bitrate_bps == 0 {
        1
    } else if stats.fraction_lost > LOSS_POOR || stats.bitrate_bps < BITRATE_POOR_BPS {
        2
    } else if stats.bitrate_bps < BITRATE_FAIR_BPS {
        3
    } else if stats.bitrate_bps < BITRATE_GOOD_BPS {
        4
    } else {
        5
    }
}

/// Samples every live room on a fixed interval.
#[derive(Clone, Debug)]
pub struct QualityMonitor {
    registry: RoomRegistryHandle,
    hub: SignalingHubHandle,
    interval: Duration,
}

impl QualityMonitor {
    #[must_use]
    pub fn new(registry: RoomRegistryHandle, hub: SignalingHubHandle, interval: Duration) -> Self {
        Self {
            registry,
            hub,
            interval,
        }
    }

    /// Run the sampling loop until `cancel_token` fires.
    pub fn spawn(self, cancel_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel_token))
    }

    #[instrument(skip_all, name = "signaling.quality")]
    async fn run(self, cancel_token: CancellationToken) {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            target: "signaling.quality",
            interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
            "Quality monitor started"
        );

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    let pushed = self.sample_once().await;
                    debug!(target: "signaling.quality", scores = pushed, "Quality pass complete");
                }
            }
        }

        info!(target: "signaling.quality", "Quality monitor stopped");
    }

    /// One sampling pass over every live room. Returns the number of
    /// scores pushed.
    pub async fn sample_once(&self) -> usize {
        let rooms = match self.registry.list_rooms().await {
            Ok(rooms) => rooms,
            Err(e) => {
                warn!(target: "signaling.quality", error = %e, "Could not list rooms");
                return 0;
            }
        };

        let passes = rooms.iter().map(|room| self.sample_room(room));
        join_all(passes).await.into_iter().sum()
    }

    async fn sample_room(&self, room: &RoomHandle) -> usize {
        let samples = match room.sample_stats().await {
            Ok(samples) => samples,
            Err(e) => {
                debug!(
                    target: "signaling.quality",
                    meeting_id = %room.meeting_id(),
                    error = %e,
                    "Room gone during quality pass"
                );
                return 0;
            }
        };

        let mut scores: Vec<(UserId, u8)> = Vec::with_capacity(samples.len());
        for sample in samples {
            match sample.producer.stats().await {
                Ok(stats) => {
                    let score = compute_quality_score(&stats);
                    metrics::record_quality_score(score);
                    scores.push((sample.user_id, score));
                }
                Err(e) => debug!(
                    target: "signaling.quality",
                    user_id = %sample.user_id,
                    error = %e,
                    "Producer stats unavailable"
                ),
            }
        }

        let pushed = scores.len();
        if pushed > 0 {
            self.hub
                .broadcast_quality(room.meeting_id().clone(), scores)
                .await;
        }
        pushed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn stats(bitrate_bps: u64, fraction_lost: f64) -> ProducerStats {
        ProducerStats {
            bitrate_bps,
            fraction_lost,
        }
    }

    #[test]
    fn test_score_thresholds() {
        assert_eq!(compute_quality_score(&stats(1_000_000, 0.2)), 1);
        assert_eq!(compute_quality_score(&stats(0, 0.0)), 1);
        assert_eq!(compute_quality_score(&stats(1_000_000, 0.07)), 2);
        assert_eq!(compute_quality_score(&stats(40_000, 0.0)), 2);
        assert_eq!(compute_quality_score(&stats(100_000, 0.01)), 3);
        assert_eq!(compute_quality_score(&stats(300_000, 0.0)), 4);
        assert_eq!(compute_quality_score(&stats(400_000, 0.0)), 5);
        assert_eq!(compute_quality_score(&stats(2_000_000, 0.05)), 5);
    }

    #[test]
    fn test_score_is_monotonic() {
        let bitrates = [0, 10_000, 49_999, 50_000, 149_999, 150_000, 399_999, 400_000, 5_000_000];
        let losses = [0.0, 0.01, 0.05, 0.051, 0.1, 0.11, 0.5];

        for &bitrate in &bitrates {
            for &loss in &losses {
                let base = compute_quality_score(&stats(bitrate, loss));
                for &better_bitrate in bitrates.iter().filter(|&&b| b >= bitrate) {
                    for &better_loss in losses.iter().filter(|&&l| l <= loss) {
                        assert!(
                            compute_quality_score(&stats(better_bitrate, better_loss)) >= base,
                            "({bitrate}, {loss}) -> ({better_bitrate}, {better_loss})"
                        );
                    }
                }
            }
        }
    }
}
