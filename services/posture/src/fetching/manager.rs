//! Fetchers Manager
//!
//! Drives a [`Registry`] on a fixed interval. Each cycle runs every eligible
//! fetcher in its own task, bounded by a global per-fetcher timeout, and
//! reports the outcome on a broadcast channel.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::Registry;
use super::CycleMetadata;
use crate::error::{FetchError, ManagerError};

const EVENTS_CAPACITY: usize = 16;

/// Outcome of one cycle, by fetcher key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub timed_out: Vec<String>,
    /// Keys whose conditions did not hold
    pub skipped: Vec<String>,
    pub elapsed: Duration,
}

impl CycleReport {
    fn record(&mut self, key: String, result: &Result<(), FetchError>) {
        match result {
            Ok(()) => self.succeeded.push(key),
            Err(err) if err.is_timeout() => self.timed_out.push(key),
            Err(_) => self.failed.push(key),
        }
    }
}

/// Cycle boundary signal, see [`Manager::subscribe`].
#[derive(Debug, Clone)]
pub enum CycleEvent {
    Started(CycleMetadata),
    Ended {
        cycle: CycleMetadata,
        report: CycleReport,
    },
}

enum ManagerState {
    Idle,
    Running(JoinHandle<()>),
    Stopped,
}

/// Everything a cycle needs, shared with the background loop.
struct CycleRunner {
    registry: Arc<dyn Registry>,
    timeout: Duration,
    token: CancellationToken,
    events: broadcast::Sender<CycleEvent>,
    sequence: AtomicU64,
}

/// Periodic scheduler over a [`Registry`].
pub struct Manager {
    runner: Arc<CycleRunner>,
    interval: Duration,
    state: Mutex<ManagerState>,
}

impl Manager {
    /// Create an idle manager. Its cancellation token is a child of `parent`,
    /// so cancelling `parent` also ends the cycles.
    pub fn new(
        registry: Arc<dyn Registry>,
        interval: Duration,
        timeout: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        Self {
            runner: Arc::new(CycleRunner {
                registry,
                timeout,
                token: parent.child_token(),
                events,
                sequence: AtomicU64::new(0),
            }),
            interval,
            state: Mutex::new(ManagerState::Idle),
        }
    }

    /// Start the periodic cycles. The first one begins immediately.
    pub fn run(&self) -> Result<(), ManagerError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            ManagerState::Running(_) => return Err(ManagerError::AlreadyRunning),
            ManagerState::Stopped => return Err(ManagerError::Stopped),
            ManagerState::Idle => {}
        }

        info!(
            interval = ?self.interval,
            timeout = ?self.runner.timeout,
            "Starting fetchers manager"
        );
        let handle = tokio::spawn(cycle_loop(self.runner.clone(), self.interval));
        *state = ManagerState::Running(handle);
        Ok(())
    }

    /// Cancel every running fetcher, wait for the current cycle to wind
    /// down, then stop the registry. Only the first call has an effect.
    pub async fn stop(&self) {
        let handle = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match std::mem::replace(&mut *state, ManagerState::Stopped) {
                ManagerState::Running(handle) => Some(handle),
                ManagerState::Idle => None,
                ManagerState::Stopped => return,
            }
        };

        self.runner.token.cancel();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = %err, "Fetchers manager loop failed");
            }
        }

        self.runner.registry.stop().await;
        info!("Fetchers manager stopped");
    }

    /// Receive [`CycleEvent`]s from now on. Slow receivers lose old events.
    pub fn subscribe(&self) -> broadcast::Receiver<CycleEvent> {
        self.runner.events.subscribe()
    }

    /// Run one fetcher under the manager's timeout and fault isolation.
    pub async fn fetch_single(
        &self,
        token: CancellationToken,
        key: &str,
        cycle: CycleMetadata,
    ) -> Result<(), FetchError> {
        self.runner.fetch_single(token, key, cycle).await
    }
}

async fn cycle_loop(runner: Arc<CycleRunner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = runner.token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        runner.run_cycle().await;
    }

    debug!("Fetchers manager loop exited");
}

impl CycleRunner {
    async fn run_cycle(self: &Arc<Self>) -> CycleReport {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let cycle = CycleMetadata::new(sequence);
        let started = Instant::now();

        info!(cycle_id = %cycle.cycle_id, sequence, "Cycle started");
        let _ = self.events.send(CycleEvent::Started(cycle.clone()));

        let mut report = CycleReport::default();
        let mut fetches = Vec::new();
        for key in self.registry.keys().await {
            if !self.registry.should_run(&key).await {
                report.skipped.push(key);
                continue;
            }

            let runner = self.clone();
            let cycle = cycle.clone();
            fetches.push(async move {
                let result = runner.fetch_single(runner.token.clone(), &key, cycle).await;
                (key, result)
            });
        }

        for (key, result) in join_all(fetches).await {
            match &result {
                Ok(()) => debug!(key = %key, "Fetcher finished"),
                Err(err @ FetchError::Cancelled { .. }) => {
                    debug!(key = %key, error = %err, "Fetch cancelled")
                }
                Err(err) if err.is_timeout() => {
                    warn!(key = %key, error = %err, "Fetcher timed out")
                }
                Err(err) => error!(key = %key, error = %err, "Fetcher failed"),
            }
            report.record(key, &result);
        }

        if !self.token.is_cancelled() {
            self.registry.update().await;
        }

        report.elapsed = started.elapsed();
        info!(
            cycle_id = %cycle.cycle_id,
            sequence,
            elapsed = ?report.elapsed,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            timed_out = report.timed_out.len(),
            skipped = report.skipped.len(),
            "Cycle ended"
        );
        let _ = self.events.send(CycleEvent::Ended {
            cycle,
            report: report.clone(),
        });
        report
    }

    /// The fetch runs in its own task. On timeout or cancellation the task is
    /// left to finish on its own with its token cancelled.
    async fn fetch_single(
        &self,
        token: CancellationToken,
        key: &str,
        cycle: CycleMetadata,
    ) -> Result<(), FetchError> {
        if token.is_cancelled() {
            return Err(FetchError::Cancelled { key: key.to_string() });
        }

        let fetch_token = token.child_token();
        let registry = self.registry.clone();
        let task_token = fetch_token.clone();
        let task_key = key.to_string();
        let mut handle =
            tokio::spawn(async move { registry.run(task_token, &task_key, cycle).await });

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(FetchError::Cancelled { key: key.to_string() }),
            joined = tokio::time::timeout(self.timeout, &mut handle) => match joined {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) if join_err.is_panic() => Err(FetchError::Fault {
                    key: key.to_string(),
                    message: panic_message(join_err.into_panic()),
                }),
                Ok(Err(join_err)) => Err(FetchError::Fault {
                    key: key.to_string(),
                    message: join_err.to_string(),
                }),
                Err(_) => Err(FetchError::Timeout {
                    key: key.to_string(),
                    timeout: self.timeout,
                }),
            },
        };

        if outcome.is_err() {
            fetch_token.cancel();
        }
        outcome
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
