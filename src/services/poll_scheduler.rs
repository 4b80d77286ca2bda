//! Fixed-cadence polling of every configured meter.
//!
//! Each tick reads the meters one after another on the shared line, stamps
//! every result with one tick timestamp, and writes exactly one row per
//! meter. A meter that cannot be read gets an all-zero row instead of a gap.

use chrono::{Local, NaiveDateTime};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::time::sleep;

use crate::config::settings::PollConfig;
use crate::devices::power_meter::{MeterClient, PowerMeter};
use crate::storage::latest_cache::LatestCache;
use crate::storage::models::{truncate_to_second, Reading};
use crate::storage::sqlite_manager::SqliteManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub timestamp: NaiveDateTime,
    pub read_ok: usize,
    pub quiet_failed: usize,
    pub store_failed: usize,
    #[serde(skip)]
    pub elapsed: Duration,
}

/// Cloneable control surface for a scheduler running on another task.
#[derive(Clone)]
pub struct SchedulerHandle {
    shutdown: Arc<watch::Sender<bool>>,
    state: Arc<RwLock<SchedulerState>>,
}

impl SchedulerHandle {
    /// Requests a stop. The tick in flight finishes first.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            if matches!(*state, SchedulerState::Idle | SchedulerState::Running) {
                *state = SchedulerState::Stopping;
            }
        }
        let _ = self.shutdown.send(true);
    }

    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }
}

pub struct PollScheduler {
    meters: Vec<PowerMeter>,
    client: MeterClient,
    store: SqliteManager,
    cache: Arc<LatestCache>,
    poll: PollConfig,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    state: Arc<RwLock<SchedulerState>>,
    last_cleanup: Instant,
}

/// Time left in the period; zero once the reads have used it all up.
pub fn remaining_in_period(period: Duration, elapsed: Duration) -> Duration {
    period.saturating_sub(elapsed)
}

impl PollScheduler {
    pub fn new(
        meters: Vec<PowerMeter>,
        client: MeterClient,
        store: SqliteManager,
        cache: Arc<LatestCache>,
        poll: PollConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            meters,
            client,
            store,
            cache,
            poll,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            state: Arc::new(RwLock::new(SchedulerState::Idle)),
            last_cleanup: Instant::now(),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shutdown: Arc::clone(&self.shutdown_tx),
            state: Arc::clone(&self.state),
        }
    }

    pub fn meters(&self) -> &[PowerMeter] {
        &self.meters
    }

    async fn set_state(&self, next: SchedulerState) {
        *self.state.write().await = next;
    }

    /// Polls until [`SchedulerHandle::stop`] is called.
    pub async fn run(mut self) {
        if !*self.shutdown_rx.borrow() {
            self.set_state(SchedulerState::Running).await;
            info!(
                "🚀 Polling {} meters every {} ms",
                self.meters.len(),
                self.poll.interval_ms
            );
        }

        let period = self.poll.interval();
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let report = self.run_tick().await;
            self.maybe_cleanup().await;

            let wait = remaining_in_period(period, report.elapsed);
            if wait.is_zero() {
                debug!("Tick took {:?}, longer than the {:?} period", report.elapsed, period);
                continue;
            }
            tokio::select! {
                _ = sleep(wait) => {}
                _ = self.shutdown_rx.changed() => {}
            }
        }

        info!("🛑 Poll scheduler stopping");
        self.set_state(SchedulerState::Stopped).await;
        info!("✅ Poll scheduler stopped");
    }

    /// One pass over all meters. Never fails: read errors become zero rows,
    /// store errors are counted and logged.
    pub async fn run_tick(&self) -> TickReport {
        let started = Instant::now();
        let timestamp = truncate_to_second(Local::now().naive_local());
        let settle = self.poll.device_settle();

        let mut report = TickReport {
            timestamp,
            read_ok: 0,
            quiet_failed: 0,
            store_failed: 0,
            elapsed: Duration::ZERO,
        };

        for (index, meter) in self.meters.iter().enumerate() {
            if index > 0 && !settle.is_zero() {
                sleep(settle).await;
            }

            let reading = match self.client.read(meter, timestamp).await {
                Ok(reading) => {
                    report.read_ok += 1;
                    reading
                }
                Err(e) => {
                    warn!("⚠️  {}; recording zeros", e);
                    report.quiet_failed += 1;
                    Reading::zeroed(&meter.device_id, timestamp)
                }
            };

            if let Err(e) = self.store.append(&reading).await {
                error!("❌ Failed to store reading for {}: {}", meter.device_id, e);
                report.store_failed += 1;
            }
            self.cache.set(reading);
        }

        report.elapsed = started.elapsed();
        debug!(
            "🔄 Tick {} done in {:?}: {} ok, {} quiet-failed, {} not stored",
            timestamp, report.elapsed, report.read_ok, report.quiet_failed, report.store_failed
        );
        report
    }

    async fn maybe_cleanup(&mut self) {
        if self.last_cleanup.elapsed() < self.poll.cleanup_interval() {
            return;
        }
        self.last_cleanup = Instant::now();
        if let Err(e) = self.store.purge_older_than(self.poll.retention_days).await {
            error!("❌ Retention cleanup failed: {}", e);
        }
    }
}
