//! Periodic eviction of overdue idle connections
//!
//! A downscaler owns one background task that wakes up every
//! `tick_frequency`, drains the idle connections that are in the pool at that
//! moment, drops the overdue ones and puts the rest back untouched. Ticks
//! never overlap: the next one is only awaited after the previous sweep has
//! returned every connection it kept.

use crate::db::connection_manager::ConnectionFactory;
use crate::db::pool::ConnectionPool;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

/// Default interval between sweeps (one hour)
pub const DEFAULT_TICK_FREQUENCY: Duration = Duration::from_secs(60 * 60);

/// How long a sweep waits for each idle connection
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownscalerState {
    /// Created, timer not started
    Idle,
    Running,
    /// Terminal: stopped explicitly or because the pool was closed
    Stopped,
}

/// Outcome of a single sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub drained: usize,
    pub discarded: usize,
    pub returned: usize,
}

struct Runner {
    handle: Option<JoinHandle<()>>,
    stop_tx: Option<watch::Sender<bool>>,
    state: DownscalerState,
}

/// Background sweeper keeping pool occupancy in line with demand
pub struct Downscaler<F: ConnectionFactory> {
    pool: ConnectionPool<F>,
    tick_frequency: Duration,
    drain_timeout: Duration,
    retire_exhausted: bool,
    /// Serialises timer sweeps with manual `tick()` calls
    sweep_lock: Arc<AsyncMutex<()>>,
    runner: Mutex<Runner>,
}

impl<F: ConnectionFactory> Downscaler<F> {
    pub fn new(pool: ConnectionPool<F>, tick_frequency: Duration) -> Self {
        Self {
            pool,
            tick_frequency,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            retire_exhausted: false,
            sweep_lock: Arc::new(AsyncMutex::new(())),
            runner: Mutex::new(Runner {
                handle: None,
                stop_tx: None,
                state: DownscalerState::Idle,
            }),
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Also retire connections that reached (not just passed) their usage
    /// limit.
    pub fn retire_exhausted(mut self, enabled: bool) -> Self {
        self.retire_exhausted = enabled;
        self
    }

    pub fn tick_frequency(&self) -> Duration {
        self.tick_frequency
    }

    pub fn state(&self) -> DownscalerState {
        let mut runner = self.lock_runner();
        if runner.state == DownscalerState::Running
            && runner.handle.as_ref().is_some_and(|h| h.is_finished())
        {
            runner.state = DownscalerState::Stopped;
        }
        runner.state
    }

    /// Start the periodic sweep. Calling it again while running, or after
    /// the downscaler stopped, does nothing.
    pub fn run(&self) {
        let mut runner = self.lock_runner();
        if runner.state != DownscalerState::Idle {
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let sweeper = self.sweeper();
        let tick_frequency = self.tick_frequency;

        info!(?tick_frequency, "Starting pool downscaler");
        runner.handle = Some(tokio::spawn(sweeper.run_loop(tick_frequency, stop_rx)));
        runner.stop_tx = Some(stop_tx);
        runner.state = DownscalerState::Running;
    }

    /// Run one sweep right now, independent of the timer.
    pub async fn tick(&self) -> SweepReport {
        self.sweeper().sweep().await
    }

    /// Cancel the timer. Idempotent.
    pub fn stop(&self) {
        let mut runner = self.lock_runner();
        if runner.state == DownscalerState::Stopped {
            return;
        }
        if let Some(stop_tx) = runner.stop_tx.take() {
            stop_tx.send_replace(true);
        }
        runner.state = DownscalerState::Stopped;
        debug!("Pool downscaler stopped");
    }

    /// Stop and wait for the background task to finish its current sweep.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.lock_runner().handle.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Pool downscaler task ended abnormally");
            }
        }
    }

    fn sweeper(&self) -> Sweeper<F> {
        Sweeper {
            pool: self.pool.clone(),
            drain_timeout: self.drain_timeout,
            retire_exhausted: self.retire_exhausted,
            sweep_lock: Arc::clone(&self.sweep_lock),
        }
    }

    fn lock_runner(&self) -> std::sync::MutexGuard<'_, Runner> {
        self.runner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<F: ConnectionFactory> Drop for Downscaler<F> {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Sweeper<F: ConnectionFactory> {
    pool: ConnectionPool<F>,
    drain_timeout: Duration,
    retire_exhausted: bool,
    sweep_lock: Arc<AsyncMutex<()>>,
}

impl<F: ConnectionFactory> Sweeper<F> {
    async fn run_loop(self, tick_frequency: Duration, mut stop_rx: watch::Receiver<bool>) {
        let mut closed_rx = self.pool.closed_signal();
        let mut interval = tokio::time::interval(tick_frequency);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately
        interval.tick().await;

        while !self.pool.is_closed() {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop_rx.changed() => break,
                _ = closed_rx.changed() => break,
            }
            if self.pool.is_closed() {
                break;
            }
            self.sweep().await;
        }
        debug!("Pool downscaler loop exited");
    }

    #[instrument(skip(self))]
    async fn sweep(&self) -> SweepReport {
        let _guard = self.sweep_lock.lock().await;
        let mut report = SweepReport::default();
        let available = self.pool.length();
        if available == 0 {
            return report;
        }

        let mut keep = Vec::with_capacity(available);
        for _ in 0..available {
            let entry = match self.pool.take_idle(self.drain_timeout).await {
                Ok(Some(entry)) => entry,
                // Callers took the rest in the meantime, or the pool closed
                Ok(None) | Err(_) => break,
            };
            report.drained += 1;

            let stats = entry.stats();
            if stats.is_overdue() || (self.retire_exhausted && stats.is_exhausted()) {
                debug!(connection = %entry.id(), idle = ?stats.idle_for(), "Evicting overdue connection");
                self.pool.discard(entry);
                report.discarded += 1;
            } else {
                keep.push(entry);
            }
        }

        // No touch(): a sweep must not restart the TTL clock
        for entry in keep {
            self.pool.release(entry);
            report.returned += 1;
        }

        if report.discarded > 0 {
            info!(
                drained = report.drained,
                discarded = report.discarded,
                issued = self.pool.capacity(),
                "Downscaled connection pool"
            );
        }
        report
    }
}
