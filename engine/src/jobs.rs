//! Periodic background jobs: the expiry sweep and the stale-PENDING reconcile.
//!
//! Each job runs on its own tokio task, ticking on a fixed interval until a
//! shutdown signal arrives on the broadcast channel:
//!
//! ```text
//! loop {
//!     select! {
//!         shutdown.recv()  => break,
//!         interval.tick()  => job.run_once()   // errors logged, loop continues
//!     }
//! }
//! ```
//!
//! A tick that fires while the previous run is still going is skipped, so runs
//! never overlap.

use crate::engine::RaffleEngine;
use async_trait::async_trait;
use raffle_core::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Work executed on every tick.
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    /// Job name for logs
    fn name(&self) -> &'static str;

    /// Run one pass.
    ///
    /// # Errors
    ///
    /// Any engine error. The runner logs it and tries again on the next tick.
    async fn run_once(&self) -> Result<()>;
}

/// Releases lapsed holds and expires their PENDING sales.
#[derive(Debug, Clone)]
pub struct ExpirySweepJob {
    engine: RaffleEngine,
}

impl ExpirySweepJob {
    /// Sweep through `engine`
    #[must_use]
    pub const fn new(engine: RaffleEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ScheduledJob for ExpirySweepJob {
    fn name(&self) -> &'static str {
        "expiry_sweeper"
    }

    async fn run_once(&self) -> Result<()> {
        self.engine.sweep_expired().await?;
        self.engine.availability().await.map(|_| ())
    }
}

/// Runs Confirm for PENDING sales older than a cutoff.
#[derive(Debug, Clone)]
pub struct StaleReconcileJob {
    engine: RaffleEngine,
    older_than: Duration,
}

impl StaleReconcileJob {
    /// Reconcile sales created more than `older_than` ago
    #[must_use]
    pub const fn new(engine: RaffleEngine, older_than: Duration) -> Self {
        Self { engine, older_than }
    }
}

#[async_trait]
impl ScheduledJob for StaleReconcileJob {
    fn name(&self) -> &'static str {
        "stale_reconcile"
    }

    async fn run_once(&self) -> Result<()> {
        self.engine.reconcile_stale(self.older_than).await.map(|_| ())
    }
}

/// Drives one [`ScheduledJob`] on an interval.
pub struct JobRunner {
    job: Arc<dyn ScheduledJob>,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl JobRunner {
    /// Create a runner that stops when `shutdown` fires.
    #[must_use]
    pub fn new(job: Arc<dyn ScheduledJob>, interval: Duration, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            job,
            interval,
            shutdown,
        }
    }

    /// Spawn the runner as a background task.
    #[must_use]
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        let name = self.job.name();
        info!(job = name, interval_secs = self.interval.as_secs(), "Scheduled job started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(job = name, "Scheduled job received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.job.run_once().await {
                        error!(job = name, error = %e, code = e.code(), "Scheduled job run failed");
                    }
                }
            }
        }

        info!(job = name, "Scheduled job stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl ScheduledJob for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run_once(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(raffle_core::EngineError::ConcurrencyConflict)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_keeps_ticking_through_errors_until_shutdown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = JobRunner::new(Arc::new(Counting(Arc::clone(&runs))), Duration::from_secs(60), shutdown_rx).spawn();

        tokio::time::sleep(Duration::from_secs(150)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        // Ticks at 0s, 60s and 120s
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
