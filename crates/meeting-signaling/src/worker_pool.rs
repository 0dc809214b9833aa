//! Media worker pool.
//!
//! A fixed number of slots, each holding one worker. `acquire_worker` walks
//! the slots round-robin from an atomic cursor and skips dead ones, so the hot
//! path takes no lock beyond a slot read.
//!
//! Each slot has a supervisor task:
//!
//! ```text
//! worker.died() ──▶ mark slot dead ──▶ broadcast WorkerDeath
//!                         │
//!                         ▼
//!              sleep(backoff) ──▶ spawn_worker ──ok──▶ swap into slot, mark live
//!                    ▲                  │
//!                    └── backoff *= 2 ◀─┘ err (capped)
//! ```
//!
//! Rooms bound to a dead worker are not migrated; they observe the same
//! `died()` token and fail on their own.

use crate::errors::SignalingError;
use crate::media::{MediaEngine, MediaWorker, WorkerId};
use crate::observability::metrics;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Capacity of the worker-death broadcast channel.
const DEATH_CHANNEL_CAPACITY: usize = 64;

/// Pool sizing and replacement policy.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub size: usize,
    /// Delay before the first replacement attempt.
    pub respawn_backoff: Duration,
    /// Cap for the doubling delay between failed replacement attempts.
    pub max_respawn_backoff: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            size: 1,
            respawn_backoff: Duration::from_millis(2000),
            max_respawn_backoff: Duration::from_millis(30_000),
        }
    }
}

/// Emitted once per worker death.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDeath {
    pub slot: usize,
    pub worker_id: WorkerId,
}

struct WorkerSlot {
    worker: RwLock<Arc<dyn MediaWorker>>,
    alive: AtomicBool,
}

impl WorkerSlot {
    fn current(&self) -> Arc<dyn MediaWorker> {
        Arc::clone(&self.worker.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn replace(&self, worker: Arc<dyn MediaWorker>) {
        *self.worker.write().unwrap_or_else(PoisonError::into_inner) = worker;
        self.alive.store(true, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Fixed-size pool of media workers with round-robin assignment.
pub struct WorkerPool {
    engine: Arc<dyn MediaEngine>,
    slots: Vec<WorkerSlot>,
    cursor: AtomicUsize,
    deaths: broadcast::Sender<WorkerDeath>,
    config: WorkerPoolConfig,
    cancel_token: CancellationToken,
}

impl WorkerPool {
    /// Spawn `config.size` workers and start supervising them.
    ///
    /// # Errors
    ///
    /// Fails if the size is zero or any initial worker cannot be spawned.
    pub async fn start(
        engine: Arc<dyn MediaEngine>,
        config: WorkerPoolConfig,
    ) -> Result<Arc<Self>, SignalingError> {
        if config.size == 0 {
            return Err(SignalingError::Config(
                "worker pool size must be at least 1".to_string(),
            ));
        }

        let mut slots = Vec::with_capacity(config.size);
        for _ in 0..config.size {
            let worker = engine.spawn_worker().await?;
            info!(target: "signaling.pool", worker_id = %worker.id(), "Media worker started");
            slots.push(WorkerSlot {
                worker: RwLock::new(worker),
                alive: AtomicBool::new(true),
            });
        }

        let (deaths, _) = broadcast::channel(DEATH_CHANNEL_CAPACITY);
        let pool = Arc::new(Self {
            engine,
            slots,
            cursor: AtomicUsize::new(0),
            deaths,
            config,
            cancel_token: CancellationToken::new(),
        });

        for slot in 0..pool.slots.len() {
            tokio::spawn(Arc::clone(&pool).supervise(slot));
        }
        metrics::set_workers_live(pool.live_count());

        Ok(pool)
    }

    /// Next live worker, round-robin.
    ///
    /// # Errors
    ///
    /// `NoWorkersAvailable` when every slot is dead (or the pool is shut down).
    pub fn acquire_worker(&self) -> Result<Arc<dyn MediaWorker>, SignalingError> {
        if self.cancel_token.is_cancelled() {
            return Err(SignalingError::ShuttingDown);
        }

        let len = self.slots.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..len {
            let Some(slot) = self.slots.get((start.wrapping_add(offset)) % len) else {
                continue;
            };
            if !slot.is_live() {
                continue;
            }
            let worker = slot.current();
            // The supervisor may not have observed the death yet.
            if worker.died().is_cancelled() {
                continue;
            }
            return Ok(worker);
        }

        Err(SignalingError::NoWorkersAvailable)
    }

    /// Receive every future worker death.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerDeath> {
        self.deaths.subscribe()
    }

    /// Run `handler` for every future worker death until the pool shuts down.
    pub fn on_worker_died<F>(&self, handler: F)
    where
        F: Fn(WorkerDeath) + Send + 'static,
    {
        let mut deaths = self.subscribe();
        let cancel_token = self.cancel_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    death = deaths.recv() => match death {
                        Ok(death) => handler(death),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(target: "signaling.pool", skipped, "Worker death handler lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_live()).count()
    }

    /// Stop supervising and close every worker.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
        for slot in &self.slots {
            slot.alive.store(false, Ordering::SeqCst);
            slot.current().close();
        }
        metrics::set_workers_live(0);
        info!(target: "signaling.pool", workers = self.slots.len(), "Worker pool shut down");
    }

    #[instrument(skip_all, name = "signaling.pool.supervise", fields(slot = index))]
    async fn supervise(self: Arc<Self>, index: usize) {
        let Some(slot) = self.slots.get(index) else {
            return;
        };

        loop {
            let worker = slot.current();
            let died = worker.died();
            tokio::select! {
                () = self.cancel_token.cancelled() => return,
                () = died.cancelled() => {}
            }

            slot.alive.store(false, Ordering::SeqCst);
            metrics::record_worker_death();
            metrics::set_workers_live(self.live_count());
            error!(
                target: "signaling.pool",
                slot = index,
                worker_id = %worker.id(),
                live_workers = self.live_count(),
                "Media worker died, scheduling replacement"
            );
            let _ = self.deaths.send(WorkerDeath {
                slot: index,
                worker_id: worker.id().to_string(),
            });

            let mut backoff = self.config.respawn_backoff;
            loop {
                tokio::select! {
                    () = self.cancel_token.cancelled() => return,
                    () = tokio::time::sleep(backoff) => {}
                }

                match self.engine.spawn_worker().await {
                    Ok(replacement) => {
                        info!(
                            target: "signaling.pool",
                            slot = index,
                            worker_id = %replacement.id(),
                            "Replacement media worker started"
                        );
                        slot.replace(replacement);
                        metrics::record_worker_respawn("success");
                        metrics::set_workers_live(self.live_count());
                        break;
                    }
                    Err(e) => {
                        backoff = backoff.saturating_mul(2).min(self.config.max_respawn_backoff);
                        metrics::record_worker_respawn("error");
                        warn!(
                            target: "signaling.pool",
                            slot = index,
                            error = %e,
                            retry_in_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                            "Replacement worker spawn failed"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::InMemoryMediaEngine;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn config(size: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            size,
            respawn_backoff: Duration::from_millis(2000),
            max_respawn_backoff: Duration::from_millis(30_000),
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_acquire_is_round_robin() {
        let engine = InMemoryMediaEngine::new();
        let pool = WorkerPool::start(Arc::new(engine), config(3)).await.unwrap();

        let ids: Vec<String> = (0..6)
            .map(|_| pool.acquire_worker().unwrap().id().to_string())
            .collect();

        let distinct: HashSet<&String> = ids.iter().take(3).collect();
        assert_eq!(distinct.len(), 3, "first three picks hit every worker");
        assert_eq!(ids[0], ids[3]);
        assert_eq!(ids[1], ids[4]);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_zero_size_is_rejected() {
        let engine = InMemoryMediaEngine::new();
        let result = WorkerPool::start(Arc::new(engine), config(0)).await;
        assert!(matches!(result, Err(SignalingError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_worker_is_skipped_then_replaced_after_backoff() {
        let engine = InMemoryMediaEngine::new();
        let pool = WorkerPool::start(Arc::new(engine.clone()), config(2))
            .await
            .unwrap();
        let mut deaths = pool.subscribe();

        let victim = engine.live_worker_ids().remove(0);
        engine.kill_worker(&victim);

        let death = deaths.recv().await.unwrap();
        assert_eq!(death.worker_id, victim);
        assert_eq!(pool.live_count(), 1);
        for _ in 0..4 {
            assert_ne!(pool.acquire_worker().unwrap().id(), victim);
        }

        // Not yet replaced before the backoff elapses.
        tokio::time::advance(Duration::from_millis(1900)).await;
        settle().await;
        assert_eq!(pool.live_count(), 1);

        tokio::time::advance(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(pool.live_count(), 2);
        assert_eq!(engine.spawned_workers(), 3);
        pool.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_workers_dead_fails_acquire() {
        let engine = InMemoryMediaEngine::new();
        let pool = WorkerPool::start(Arc::new(engine.clone()), config(1))
            .await
            .unwrap();

        let victim = engine.live_worker_ids().remove(0);
        engine.kill_worker(&victim);

        assert!(matches!(
            pool.acquire_worker(),
            Err(SignalingError::NoWorkersAvailable)
        ));
        pool.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_respawn_backs_off_exponentially() {
        let engine = InMemoryMediaEngine::new();
        let pool = WorkerPool::start(Arc::new(engine.clone()), config(1))
            .await
            .unwrap();

        engine.fail_next_spawns(2);
        let victim = engine.live_worker_ids().remove(0);
        engine.kill_worker(&victim);
        settle().await;

        // 2000ms: first attempt fails, next in 4000ms.
        tokio::time::advance(Duration::from_millis(2001)).await;
        settle().await;
        // 6000ms: second attempt fails, next in 8000ms.
        tokio::time::advance(Duration::from_millis(4000)).await;
        settle().await;
        assert_eq!(pool.live_count(), 0);

        tokio::time::advance(Duration::from_millis(8000)).await;
        settle().await;
        assert_eq!(pool.live_count(), 1);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_on_worker_died_handler_runs() {
        let engine = InMemoryMediaEngine::new();
        let pool = WorkerPool::start(Arc::new(engine.clone()), config(1))
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        pool.on_worker_died(move |death| sink.lock().unwrap().push(death.worker_id));
        settle().await;

        let victim = engine.live_worker_ids().remove(0);
        engine.kill_worker(&victim);

        tokio::time::timeout(Duration::from_secs(1), async {
            while seen.lock().unwrap().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), [victim]);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_rejects_acquire() {
        let engine = InMemoryMediaEngine::new();
        let pool = WorkerPool::start(Arc::new(engine), config(2)).await.unwrap();
        pool.shutdown();
        assert!(matches!(
            pool.acquire_worker(),
            Err(SignalingError::ShuttingDown)
        ));
    }
}
