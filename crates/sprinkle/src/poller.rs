//! Pull-based countdown refresh for one card.
//!
//! There is no event for "cycle finished", so while a cycle runs the poller
//! re-reads the countdown every `period` and stops itself as soon as the
//! countdown reports inactive.
//!
//! Every `start`/`stop` bumps a generation counter while holding the shared
//! state's write lock. A tick only publishes its result if the generation it
//! was started under is still current when it takes that lock, so a poll that
//! was in flight during a `stop` never overwrites the view.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::state::SharedState;
use crate::valve::CountdownSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum PollerState {
    Stopped,
    Polling,
}

/// Outcome of a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    /// Cycle still running; keep polling.
    Active,
    /// Cycle over (or telemetry unreadable); stop.
    Inactive,
    /// Fetch failed; last countdown kept.
    Failed,
    /// Superseded by a later `start`/`stop`; result dropped.
    Stale,
}

pub(crate) struct CountdownPoller<S> {
    card: String,
    source: Arc<S>,
    shared: SharedState,
    generation: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
    period: Duration,
    settle: Duration,
}

impl<S: CountdownSource> CountdownPoller<S> {
    pub(crate) fn new(
        card: &str,
        source: Arc<S>,
        shared: SharedState,
        period: Duration,
        settle: Duration,
    ) -> Self {
        Self {
            card: card.to_string(),
            source,
            shared,
            generation: Arc::new(AtomicU64::new(0)),
            task: Mutex::new(None),
            period,
            settle,
        }
    }

    /// Poll once straight away, then keep polling every `period` until the
    /// countdown goes inactive. A running loop is replaced, never duplicated.
    ///
    /// The first poll runs without holding the task slot, so `state` and
    /// `stop` stay responsive while the host is slow to answer.
    pub(crate) async fn start(&self) {
        let generation = {
            let _st = self.shared.write().await;
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        let first = poll_once(
            &self.card,
            self.source.as_ref(),
            &self.shared,
            &self.generation,
            generation,
        )
        .await;

        let mut task = self.task.lock().await;
        // A later start or stop owns the slot now.
        if first == Tick::Stale || self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if let Some(handle) = task.take() {
            handle.abort();
        }
        if first == Tick::Inactive {
            debug!(card = %self.card, "no active cycle, poller not started");
            return;
        }

        info!(card = %self.card, period_ms = self.period.as_millis() as u64, "countdown poller started");

        let card = self.card.clone();
        let source = Arc::clone(&self.source);
        let shared = Arc::clone(&self.shared);
        let current = Arc::clone(&self.generation);
        let period = self.period;

        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; that poll already happened.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match poll_once(&card, source.as_ref(), &shared, &current, generation).await {
                    Tick::Active | Tick::Failed => {}
                    Tick::Inactive => {
                        info!(card = %card, "cycle inactive, countdown poller stopped");
                        return;
                    }
                    Tick::Stale => return,
                }
            }
        }));
    }

    /// Cancel the repeating poll. Safe to call when already stopped.
    pub(crate) async fn stop(&self) {
        {
            let _st = self.shared.write().await;
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            debug!(card = %self.card, "countdown poller stopped");
        }
    }

    /// Stop, give the host `settle` to reflect a fresh command, start again.
    pub(crate) async fn resync(&self) {
        self.stop().await;
        sleep(self.settle).await;
        self.start().await;
    }

    pub(crate) async fn state(&self) -> PollerState {
        match self.task.lock().await.as_ref() {
            Some(handle) if !handle.is_finished() => PollerState::Polling,
            _ => PollerState::Stopped,
        }
    }

    pub(crate) async fn is_running(&self) -> bool {
        self.state().await == PollerState::Polling
    }
}

impl<S> Drop for CountdownPoller<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

async fn poll_once<S: CountdownSource>(
    card: &str,
    source: &S,
    shared: &SharedState,
    current: &AtomicU64,
    generation: u64,
) -> Tick {
    let fetched = source.countdown().await;

    let mut st = shared.write().await;
    if current.load(Ordering::SeqCst) != generation {
        return Tick::Stale;
    }

    match fetched {
        Ok(info) => {
            let active = info.is_active;
            st.record_countdown(info);
            if active {
                Tick::Active
            } else {
                Tick::Inactive
            }
        }
        Err(e) => {
            warn!(card = %card, error = %e, "countdown poll failed");
            st.record_error(format!("countdown poll failed: {e:#}"));
            Tick::Failed
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
