//! Lifecycle shared by the polling strategies: one cancellable periodic task per tracker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::TrackerStore;
use crate::trackers::{TrackerStrategy, load_tracker};
use crate::types::{TrackerConfig, TrackerStatus, TrackerType};

/// The strategy-specific part of a poll tracker.
#[async_trait]
pub trait PollCycle: Send + Sync + 'static {
    fn tracker_type(&self) -> TrackerType;

    /// Reject unusable parameters before anything is scheduled.
    fn validate(&self, tracker: &TrackerConfig) -> Result<()>;

    /// Fetch, snapshot, compare and publish once.
    async fn run_cycle(&self, tracker: &TrackerConfig) -> Result<()>;
}

struct Timer {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct PollInner<C> {
    cycle: C,
    store: Arc<dyn TrackerStore>,
    interval: Duration,
}

pub struct PollingTracker<C> {
    inner: Arc<PollInner<C>>,
    timers: Mutex<HashMap<String, Timer>>,
}

impl<C: PollCycle> PollingTracker<C> {
    pub fn new(cycle: C, store: Arc<dyn TrackerStore>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(PollInner {
                cycle,
                store,
                interval,
            }),
            timers: Mutex::new(HashMap::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }
}

impl<C: PollCycle> PollInner<C> {
    /// One cycle. Failures mark the tracker `ERROR`; the next success clears it.
    ///
    /// Returns whether the cycle succeeded.
    async fn run_once(&self, id: &str) -> bool {
        let tracker = match self.store.get(id).await {
            Ok(Some(tracker)) => tracker,
            Ok(None) => {
                warn!("[{id}] Tracker vanished; skipping cycle");
                return false;
            }
            Err(e) => {
                warn!("[{id}] Failed to load tracker: {e}");
                return false;
            }
        };

        let started = Instant::now();
        let outcome = self.cycle.run_cycle(&tracker).await;
        let succeeded = outcome.is_ok();
        let update = match outcome {
            Ok(()) => {
                debug!("[{id}] {} cycle done in {:?}", tracker.tracker_type, started.elapsed());
                if let Err(e) = self.store.record_run(id, Utc::now()).await {
                    warn!("[{id}] Failed to record run: {e}");
                }
                self.store.set_status(id, TrackerStatus::Active, None).await
            }
            Err(e) => {
                warn!("[{id}] {} cycle failed: {e}", tracker.tracker_type);
                self.store
                    .set_status(id, TrackerStatus::Error, Some(e.to_string()))
                    .await
            }
        };
        if let Err(e) = update {
            warn!("[{id}] Failed to update status: {e}");
        }
        succeeded
    }
}

/// Run a cycle every `interval` until cancelled. A cycle in flight when the token fires is
/// dropped.
async fn poll_loop<C: PollCycle>(inner: Arc<PollInner<C>>, id: String, token: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + inner.interval, inner.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = inner.run_once(&id) => {}
                }
            }
        }
    }
    debug!("[{id}] Poll loop exited");
}

#[async_trait]
impl<C: PollCycle> TrackerStrategy for PollingTracker<C> {
    fn tracker_type(&self) -> TrackerType {
        self.inner.cycle.tracker_type()
    }

    async fn start(&self, id: &str) -> Result<()> {
        let mut timers = self.timers.lock().await;
        if timers.contains_key(id) {
            debug!("[{id}] Already running");
            return Ok(());
        }

        let tracker = load_tracker(self.inner.store.as_ref(), id, self.tracker_type()).await?;
        self.inner.cycle.validate(&tracker)?;
        self.inner
            .store
            .set_status(id, TrackerStatus::Active, None)
            .await?;

        // The first cycle runs before start returns, so its outcome is already in the status.
        if !self.inner.run_once(id).await {
            warn!("[{id}] First cycle failed; retrying every {:?}", self.inner.interval);
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            Arc::clone(&self.inner),
            id.to_string(),
            token.clone(),
        ));
        timers.insert(id.to_string(), Timer { token, handle });
        info!(
            "[{id}] {} tracker polling every {:?}",
            self.tracker_type(),
            self.inner.interval
        );
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let Some(timer) = self.timers.lock().await.remove(id) else {
            debug!("[{id}] Not running");
            return Ok(());
        };
        timer.token.cancel();
        let _ = timer.handle.await;

        self.inner
            .store
            .set_status(id, TrackerStatus::Paused, None)
            .await?;
        info!("[{id}] {} tracker stopped", self.tracker_type());
        Ok(())
    }

    async fn is_running(&self, id: &str) -> bool {
        self.timers.lock().await.contains_key(id)
    }

    async fn shutdown(&self) {
        let timers: Vec<Timer> = self.timers.lock().await.drain().map(|(_, t)| t).collect();
        for timer in &timers {
            timer.token.cancel();
        }
        for timer in timers {
            let _ = timer.handle.await;
        }
    }
}
