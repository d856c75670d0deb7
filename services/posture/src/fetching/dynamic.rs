//! Dynamic Registry
//!
//! A [`Registry`] whose fetcher set is rebuilt periodically from an updater,
//! e.g. re-listing the cloud accounts visible to the agent. Callers see the
//! plain registry contract and never observe a half-swapped snapshot.
//!
//! ## Lock discipline
//!
//! - Reads (`keys`, `should_run`, `run`) hold the shared lock for the whole
//!   delegated call, including the lazy-activation check.
//! - A refresh runs the updater without the state lock, then takes the
//!   exclusive lock only to stop the outgoing snapshot and install the new one.
//! - At most one updater call is in flight. A refresh that finds another one
//!   running is skipped; activation waits for it.
//! - Activation is double-checked: optimistic read, re-verified under the
//!   exclusive lock, then downgraded to a read lock for the caller.
//! - The refresh lock is always taken before the state lock.

use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{Mutex as AsyncMutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::registry::{FetchersMap, Registry, StaticRegistry};
use super::CycleMetadata;
use crate::error::FetchError;

type UpdaterFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<FetchersMap>> + Send + Sync>;

struct State {
    snapshot: StaticRegistry,
    /// Present while running; cancelling it ends the refresh loop
    refresh_token: Option<CancellationToken>,
}

struct Shared {
    state: RwLock<State>,
    /// Held for the duration of every updater call
    refreshing: AsyncMutex<()>,
    updater: UpdaterFn,
    period: Duration,
    last_refresh: Mutex<Instant>,
}

/// Registry rebuilt from `updater` every `period`.
///
/// Nothing happens until the first access, which builds the initial
/// snapshot synchronously and starts the background refresh loop.
pub struct DynamicRegistry {
    shared: Arc<Shared>,
}

impl DynamicRegistry {
    pub fn new<F, Fut>(updater: F, period: Duration) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<FetchersMap>> + Send + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(State {
                    snapshot: StaticRegistry::empty(),
                    refresh_token: None,
                }),
                refreshing: AsyncMutex::new(()),
                updater: Arc::new(move || updater().boxed()),
                period,
                last_refresh: Mutex::new(Instant::now()),
            }),
        }
    }

    /// Whether the registry has been activated and not stopped since.
    pub async fn is_running(&self) -> bool {
        self.shared.state.read().await.refresh_token.is_some()
    }

    /// Read access to a running registry, activating it first if needed.
    async fn active(&self) -> RwLockReadGuard<'_, State> {
        let state = self.shared.state.read().await;
        if state.refresh_token.is_some() {
            return state;
        }
        drop(state);

        // A refresh left over from before a stop must settle first.
        let _refreshing = self.shared.refreshing.lock().await;
        let mut state = self.shared.state.write().await;
        if state.refresh_token.is_none() {
            self.shared.activate(&mut state).await;
        }
        RwLockWriteGuard::downgrade(state)
    }
}

impl Shared {
    async fn activate(self: &Arc<Self>, state: &mut State) {
        info!(period = ?self.period, "Activating dynamic registry");

        self.touch();
        match (self.updater)().await {
            Ok(fetchers) => install(state, fetchers),
            Err(err) => error!(error = %err, "Failed to build initial registry"),
        }

        let token = CancellationToken::new();
        tokio::spawn(refresh_loop(Arc::downgrade(self), self.period, token.clone()));
        state.refresh_token = Some(token);
    }

    /// Rebuild the snapshot. On updater failure the previous one is kept.
    /// Skipped if another refresh is still running.
    async fn refresh(&self, token: &CancellationToken) {
        let Ok(_refreshing) = self.refreshing.try_lock() else {
            debug!("Registry refresh already in progress");
            return;
        };

        self.touch();
        let fetchers = match (self.updater)().await {
            Ok(fetchers) => fetchers,
            Err(err) => {
                error!(error = %err, "Failed to update registry, keeping previous fetchers");
                return;
            }
        };

        let mut state = self.state.write().await;
        if token.is_cancelled() || state.refresh_token.is_none() {
            debug!("Registry stopped during refresh, discarding new fetchers");
            return;
        }
        install(&mut state, fetchers);
    }

    fn touch(&self) {
        *self.last_refresh.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn refresh_due(&self) -> bool {
        let last = *self.last_refresh.lock().unwrap_or_else(|e| e.into_inner());
        last.elapsed() >= self.period
    }
}

/// Stop the outgoing snapshot, then install the new one. Caller holds the
/// exclusive lock.
fn install(state: &mut State, fetchers: FetchersMap) {
    state.snapshot.stop_retiring(&fetchers);
    state.snapshot = StaticRegistry::new(fetchers);
    info!(fetchers = state.snapshot.len(), "Registry updated");
}

async fn refresh_loop(shared: Weak<Shared>, period: Duration, token: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Registry refresh loop stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        let Some(shared) = shared.upgrade() else {
            return;
        };
        shared.refresh(&token).await;
    }
}

#[async_trait]
impl Registry for DynamicRegistry {
    async fn keys(&self) -> Vec<String> {
        self.active().await.snapshot.fetcher_keys()
    }

    async fn should_run(&self, key: &str) -> bool {
        self.active().await.snapshot.check_conditions(key)
    }

    async fn run(
        &self,
        token: CancellationToken,
        key: &str,
        cycle: CycleMetadata,
    ) -> Result<(), FetchError> {
        let state = self.active().await;
        state.snapshot.run_fetcher(token, key, cycle).await
    }

    async fn update(&self) {
        let token = {
            let state = self.active().await;
            match &state.refresh_token {
                Some(token) => token.clone(),
                None => return,
            }
        };

        if self.shared.refresh_due() {
            self.shared.refresh(&token).await;
        }
    }

    async fn stop(&self) {
        let mut state = self.shared.state.write().await;
        let Some(token) = state.refresh_token.take() else {
            return;
        };

        // The refresh loop may be queued on this lock; it sees the cancelled
        // token and discards its result.
        token.cancel();
        std::mem::replace(&mut state.snapshot, StaticRegistry::empty()).stop_all();
        info!("Dynamic registry stopped");
    }
}
