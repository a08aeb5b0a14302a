//! The background task that ticks on an interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{LoopState, SchedulerStatus, Tick, TickSummary};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::logging::OpTimer;

#[derive(Debug, Default)]
struct Observed {
    interval: Option<Duration>,
    last_tick: Option<DateTime<Utc>>,
    next_tick_eta: Option<DateTime<Utc>>,
    last_summary: Option<TickSummary>,
}

#[derive(Debug)]
struct Shared {
    tick_timeout: Duration,
    /// Serialises loop ticks with `run_once`.
    tick_lock: tokio::sync::Mutex<()>,
    observed: RwLock<Observed>,
}

impl Shared {
    async fn run_tick(
        &self,
        ticker: &dyn Tick,
        now: DateTime<Utc>,
        force: bool,
    ) -> OrchestratorResult<TickSummary> {
        let _guard = self.tick_lock.lock().await;
        let timer = OpTimer::new("scheduler", "tick");

        let result = match tokio::time::timeout(self.tick_timeout, ticker.tick(now, force)).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::Timeout {
                operation: "tick",
                after: self.tick_timeout,
            }),
        };
        timer.finish_with_result(result.as_ref());

        let mut observed = self.observed.write();
        observed.last_tick = Some(now);
        if let Ok(summary) = &result {
            observed.last_summary = Some(summary.clone());
        }
        result
    }

    fn set_eta(&self, interval: Duration) {
        let eta = TimeDelta::from_std(interval)
            .ok()
            .and_then(|delta| Utc::now().checked_add_signed(delta));
        self.observed.write().next_tick_eta = eta;
    }
}

struct RunningLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs ticks on a fixed interval in one background task.
///
/// A tick runs inline in the loop task, so a tick that outlasts the interval
/// causes the missed intervals to be skipped rather than queued.
#[derive(Clone)]
pub struct SchedulerLoop {
    shared: Arc<Shared>,
    running: Arc<Mutex<Option<RunningLoop>>>,
}

impl SchedulerLoop {
    #[must_use]
    pub fn new(tick_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                tick_timeout,
                tick_lock: tokio::sync::Mutex::new(()),
                observed: RwLock::new(Observed::default()),
            }),
            running: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawn the loop. Returns `false` and changes nothing when it is
    /// already running.
    pub fn start(&self, ticker: Arc<dyn Tick>, interval: Duration, run_immediately: bool) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            tracing::warn!("Scheduler loop already running, ignoring start");
            return false;
        }

        let interval = interval.max(Duration::from_millis(1));
        let cancel = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let token = cancel.clone();

        shared.observed.write().interval = Some(interval);
        if run_immediately {
            shared.observed.write().next_tick_eta = Some(Utc::now());
        } else {
            shared.set_eta(interval);
        }

        let handle = tokio::spawn(async move {
            let first = if run_immediately {
                Instant::now()
            } else {
                Instant::now() + interval
            };
            let mut ticks = tokio::time::interval_at(first, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(
                interval_secs = interval.as_secs(),
                run_immediately,
                "Scheduler loop started"
            );
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticks.tick() => {}
                }

                // Not raced against cancellation; stop waits for this tick.
                if let Err(e) = shared.run_tick(ticker.as_ref(), Utc::now(), false).await {
                    tracing::error!(error = %e, "Scheduler tick failed");
                }
                shared.set_eta(interval);
            }
            tracing::info!("Scheduler loop stopped");
        });

        *running = Some(RunningLoop { cancel, handle });
        true
    }

    /// Stop the loop and wait for an in-flight tick to finish. Idempotent.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            tracing::error!(error = %e, "Scheduler loop task ended abnormally");
        }
        self.shared.observed.write().next_tick_eta = None;
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Run one tick outside the interval, serialised with loop ticks.
    pub async fn run_once(
        &self,
        ticker: &dyn Tick,
        now: DateTime<Utc>,
        force: bool,
    ) -> OrchestratorResult<TickSummary> {
        self.shared.run_tick(ticker, now, force).await
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = if self.is_running() {
            LoopState::Running
        } else {
            LoopState::Stopped
        };
        let observed = self.shared.observed.read();
        SchedulerStatus {
            state,
            interval_secs: observed.interval.map(|i| i.as_secs()),
            last_tick: observed.last_tick,
            next_tick_eta: observed.next_tick_eta,
            last_summary: observed.last_summary.clone(),
        }
    }
}

impl std::fmt::Debug for SchedulerLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerLoop")
            .field("running", &self.is_running())
            .field("tick_timeout", &self.shared.tick_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts ticks and tracks overlap.
    #[derive(Default)]
    struct Counting {
        ticks: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl Tick for Counting {
        async fn tick(&self, now: DateTime<Utc>, force: bool) -> OrchestratorResult<TickSummary> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(TickSummary::new(now, force).finish())
        }
    }

    fn counting(delay: Duration) -> Arc<Counting> {
        Arc::new(Counting {
            delay,
            ..Counting::default()
        })
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let scheduler = SchedulerLoop::new(Duration::from_secs(5));
        let ticker = counting(Duration::ZERO);
        assert_eq!(scheduler.status().state, LoopState::Stopped);

        assert!(scheduler.start(Arc::<Counting>::clone(&ticker), Duration::from_millis(20), true));
        assert!(!scheduler.start(Arc::<Counting>::clone(&ticker), Duration::from_millis(20), true));
        assert_eq!(scheduler.status().state, LoopState::Running);

        tokio::time::sleep(Duration::from_millis(90)).await;
        scheduler.stop().await;
        scheduler.stop().await;

        let status = scheduler.status();
        assert_eq!(status.state, LoopState::Stopped);
        assert!(status.last_tick.is_some());
        assert!(status.last_summary.is_some());
        let ticks = ticker.ticks.load(Ordering::SeqCst);
        assert!(ticks >= 2, "only {ticks} ticks");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticker.ticks.load(Ordering::SeqCst), ticks);
    }

    #[tokio::test]
    async fn test_slow_ticks_never_overlap() {
        let scheduler = SchedulerLoop::new(Duration::from_secs(5));
        let ticker = counting(Duration::from_millis(40));

        scheduler.start(Arc::<Counting>::clone(&ticker), Duration::from_millis(5), true);
        let manual = scheduler.run_once(ticker.as_ref(), Utc::now(), true);
        manual.await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop().await;

        assert_eq!(ticker.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_tick() {
        let scheduler = SchedulerLoop::new(Duration::from_secs(5));
        let ticker = counting(Duration::from_millis(60));

        scheduler.start(Arc::<Counting>::clone(&ticker), Duration::from_secs(60), true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.stop().await;

        assert_eq!(ticker.ticks.load(Ordering::SeqCst), 1);
        assert_eq!(ticker.active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tick_timeout() {
        let scheduler = SchedulerLoop::new(Duration::from_millis(20));
        let ticker = counting(Duration::from_secs(5));

        let err = scheduler
            .run_once(ticker.as_ref(), Utc::now(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout { operation: "tick", .. }));
        assert_eq!(err.to_string(), "tick timed out after 20ms");
        assert!(scheduler.status().last_summary.is_none());
    }

    #[tokio::test]
    async fn test_run_once_does_not_start_loop() {
        let scheduler = SchedulerLoop::new(Duration::from_secs(5));
        let ticker = counting(Duration::ZERO);

        let summary = scheduler.run_once(ticker.as_ref(), Utc::now(), true).await.unwrap();
        assert!(summary.forced);
        assert_eq!(scheduler.status().state, LoopState::Stopped);
    }
}
