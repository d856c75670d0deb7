//! Scan Cycles
//!
//! A cycle is one pass of the periodic scan. Every resource emitted during a
//! pass carries the same [`CycleMetadata`], so downstream stages can group
//! results and detect cycle boundaries.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Opaque correlation id of a single cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CycleId(Uuid);

impl CycleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CycleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata attached to every resource produced within one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleMetadata {
    pub cycle_id: CycleId,
    /// Position of the cycle within its manager's lifetime, starting at 1
    pub sequence: u64,
    pub started_at: DateTime<Utc>,
}

impl CycleMetadata {
    /// Start a new cycle with a fresh id.
    pub fn new(sequence: u64) -> Self {
        Self {
            cycle_id: CycleId::new(),
            sequence,
            started_at: Utc::now(),
        }
    }
}

type ComputeFn<T> =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

struct CachedValue<T> {
    cycle_id: CycleId,
    sequence: u64,
    value: T,
}

impl<T> CachedValue<T> {
    /// Whether this entry answers requests for `cycle`: the same cycle, or
    /// one that started before it.
    fn serves(&self, cycle: &CycleMetadata) -> bool {
        self.cycle_id == cycle.cycle_id || cycle.sequence < self.sequence
    }
}

/// Memoizes an expensive lookup for the duration of one cycle.
///
/// For a given cycle the compute function runs at most once, no matter how
/// many callers race for it. Only a newer cycle (higher sequence) invalidates
/// the value; late callers from older cycles get the cached value as is.
/// Failures are never cached: the next call for the same cycle retries. If a
/// value from an earlier cycle exists, a failed recompute returns it instead
/// of the error.
pub struct CycleCache<T> {
    compute: ComputeFn<T>,
    entry: RwLock<Option<CachedValue<T>>>,
    compute_lock: Mutex<()>,
}

impl<T> CycleCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(compute: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            compute: Arc::new(move |token| compute(token).boxed()),
            entry: RwLock::new(None),
            compute_lock: Mutex::new(()),
        }
    }

    /// Get the value for `cycle`, computing it if this cycle has not seen one yet.
    pub async fn get_value(
        &self,
        token: &CancellationToken,
        cycle: &CycleMetadata,
    ) -> anyhow::Result<T> {
        if let Some(value) = self.cached(cycle) {
            return Ok(value);
        }

        let _guard = self.compute_lock.lock().await;

        // Another caller may have finished the computation while we waited.
        if let Some(value) = self.cached(cycle) {
            return Ok(value);
        }

        match (self.compute)(token.clone()).await {
            Ok(value) => {
                debug!(cycle_id = %cycle.cycle_id, "Cycle cache refreshed");
                let mut entry = self.entry.write().unwrap_or_else(|e| e.into_inner());
                *entry = Some(CachedValue {
                    cycle_id: cycle.cycle_id,
                    sequence: cycle.sequence,
                    value: value.clone(),
                });
                Ok(value)
            }
            Err(err) => match self.previous() {
                Some(previous) => {
                    warn!(
                        cycle_id = %cycle.cycle_id,
                        error = %err,
                        "Failed to refresh cycle cache, using value from previous cycle"
                    );
                    Ok(previous)
                }
                None => Err(err),
            },
        }
    }

    fn cached(&self, cycle: &CycleMetadata) -> Option<T> {
        let entry = self.entry.read().unwrap_or_else(|e| e.into_inner());
        entry
            .as_ref()
            .filter(|cached| cached.serves(cycle))
            .map(|cached| cached.value.clone())
    }

    fn previous(&self) -> Option<T> {
        let entry = self.entry.read().unwrap_or_else(|e| e.into_inner());
        entry.as_ref().map(|cached| cached.value.clone())
    }
}
