//! Fetcher Registry
//!
//! A named collection of fetchers and the conditions gating them. The
//! [`Registry`] trait is the only thing the manager sees; [`StaticRegistry`]
//! is the fixed-set implementation and the snapshot type used by
//! [`DynamicRegistry`](super::DynamicRegistry).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Condition, CycleMetadata, Fetcher};
use crate::error::FetchError;

/// A fetcher together with the conditions that must all hold for it to run.
#[derive(Clone)]
pub struct RegisteredFetcher {
    pub fetcher: Arc<dyn Fetcher>,
    pub conditions: Vec<Arc<dyn Condition>>,
}

impl RegisteredFetcher {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            fetcher,
            conditions: Vec::new(),
        }
    }

    /// Add a condition gating this fetcher
    pub fn with_condition(mut self, condition: Arc<dyn Condition>) -> Self {
        self.conditions.push(condition);
        self
    }
}

impl fmt::Debug for RegisteredFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let conditions: Vec<&str> = self.conditions.iter().map(|c| c.name()).collect();
        f.debug_struct("RegisteredFetcher")
            .field("conditions", &conditions)
            .finish_non_exhaustive()
    }
}

/// Fetchers keyed by a name unique within one registry snapshot
pub type FetchersMap = HashMap<String, RegisteredFetcher>;

/// The contract the [`Manager`](super::Manager) drives every cycle.
#[async_trait]
pub trait Registry: Send + Sync {
    /// All registered fetcher keys, in no particular order.
    async fn keys(&self) -> Vec<String>;

    /// Whether `key` is registered and all of its conditions hold.
    async fn should_run(&self, key: &str) -> bool;

    /// Run the fetcher registered under `key`.
    async fn run(
        &self,
        token: CancellationToken,
        key: &str,
        cycle: CycleMetadata,
    ) -> Result<(), FetchError>;

    /// Hook called by the manager after every cycle.
    async fn update(&self);

    /// Stop every registered fetcher.
    async fn stop(&self);
}

/// A registry whose fetcher set is fixed at construction.
pub struct StaticRegistry {
    fetchers: FetchersMap,
    stopped: AtomicBool,
}

impl StaticRegistry {
    pub fn new(fetchers: FetchersMap) -> Self {
        Self {
            fetchers,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn empty() -> Self {
        Self::new(FetchersMap::new())
    }

    pub fn len(&self) -> usize {
        self.fetchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetchers.is_empty()
    }

    pub(crate) fn fetcher_keys(&self) -> Vec<String> {
        self.fetchers.keys().cloned().collect()
    }

    pub(crate) fn check_conditions(&self, key: &str) -> bool {
        let Some(registered) = self.fetchers.get(key) else {
            debug!(key = %key, "Fetcher is not registered");
            return false;
        };

        let mut should_run = true;
        for condition in &registered.conditions {
            if !condition.condition() {
                info!(
                    key = %key,
                    condition = condition.name(),
                    "Conditional fetcher should not run"
                );
                should_run = false;
            }
        }

        should_run
    }

    pub(crate) async fn run_fetcher(
        &self,
        token: CancellationToken,
        key: &str,
        cycle: CycleMetadata,
    ) -> Result<(), FetchError> {
        let registered = self
            .fetchers
            .get(key)
            .ok_or_else(|| FetchError::UnknownFetcherKey(key.to_string()))?;

        registered.fetcher.fetch(token, cycle).await?;
        Ok(())
    }

    /// Stop every fetcher. Only the first call has an effect.
    pub(crate) fn stop_all(&self) {
        self.stop_retiring(&FetchersMap::new());
    }

    /// Stop every fetcher that is not carried over into `next`.
    ///
    /// A fetcher instance that also appears in `next` keeps running under the
    /// new snapshot, so stopping it here would break that snapshot.
    pub(crate) fn stop_retiring(&self, next: &FetchersMap) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        for (key, registered) in &self.fetchers {
            let carried_over = next
                .values()
                .any(|candidate| Arc::ptr_eq(&candidate.fetcher, &registered.fetcher));
            if carried_over {
                continue;
            }

            debug!(key = %key, "Stopping fetcher");
            registered.fetcher.stop();
        }
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn keys(&self) -> Vec<String> {
        self.fetcher_keys()
    }

    async fn should_run(&self, key: &str) -> bool {
        self.check_conditions(key)
    }

    async fn run(
        &self,
        token: CancellationToken,
        key: &str,
        cycle: CycleMetadata,
    ) -> Result<(), FetchError> {
        self.run_fetcher(token, key, cycle).await
    }

    async fn update(&self) {}

    async fn stop(&self) {
        self.stop_all();
    }
}
