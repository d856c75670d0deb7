//! Benchmark Assembly
//!
//! Turns a [`FetchingConfig`] into a running scan: the configured benchmark
//! picks a registry strategy, the strategy builds the [`Registry`] wired to
//! a fresh output channel, and a [`Manager`] drives it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{BenchmarkKind, FetchingConfig};
use crate::error::{BuildError, ManagerError};
use crate::fetching::{
    Account, AccountFanIn, CloudIdentity, CycleEvent, DynamicRegistry, FetchersMap, Manager,
    Registry, ResourceInfo,
};

/// Buffer of the channel every fetcher writes resources to
pub const OUTPUT_CHANNEL_CAPACITY: usize = 10_000;

/// Builds the registry a benchmark scans with.
#[async_trait]
pub trait RegistryStrategy: Send + Sync {
    async fn build_registry(
        &self,
        config: &FetchingConfig,
        output: mpsc::Sender<ResourceInfo>,
        token: &CancellationToken,
    ) -> anyhow::Result<Arc<dyn Registry>>;
}

#[async_trait]
impl<F> RegistryStrategy for F
where
    F: Fn(
            &FetchingConfig,
            mpsc::Sender<ResourceInfo>,
            &CancellationToken,
        ) -> anyhow::Result<Arc<dyn Registry>>
        + Send
        + Sync,
{
    async fn build_registry(
        &self,
        config: &FetchingConfig,
        output: mpsc::Sender<ResourceInfo>,
        token: &CancellationToken,
    ) -> anyhow::Result<Arc<dyn Registry>> {
        self(config, output, token)
    }
}

type DiscoverFn<C> =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Vec<Account<C>>>> + Send + Sync>;
type AccountFactoryFn<C> =
    Arc<dyn Fn(&CloudIdentity, &C, mpsc::Sender<ResourceInfo>) -> FetchersMap + Send + Sync>;

/// Strategy for benchmarks spanning many accounts.
///
/// Builds a [`DynamicRegistry`] that re-discovers accounts every
/// `account_refresh` and fans their fetchers into the output channel.
pub struct OrganizationStrategy<C> {
    discover: DiscoverFn<C>,
    factory: AccountFactoryFn<C>,
}

impl<C> OrganizationStrategy<C>
where
    C: Send + Sync + 'static,
{
    pub fn new<D, Fut, F>(discover: D, factory: F) -> Self
    where
        D: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<Account<C>>>> + Send + 'static,
        F: Fn(&CloudIdentity, &C, mpsc::Sender<ResourceInfo>) -> FetchersMap + Send + Sync + 'static,
    {
        Self {
            discover: Arc::new(move || discover().boxed()),
            factory: Arc::new(factory),
        }
    }
}

#[async_trait]
impl<C> RegistryStrategy for OrganizationStrategy<C>
where
    C: Send + Sync + 'static,
{
    async fn build_registry(
        &self,
        config: &FetchingConfig,
        output: mpsc::Sender<ResourceInfo>,
        token: &CancellationToken,
    ) -> anyhow::Result<Arc<dyn Registry>> {
        let factory = self.factory.clone();
        let fan_in = Arc::new(AccountFanIn::new(
            output,
            token.clone(),
            move |identity: &CloudIdentity, account_config: &C, tx| {
                factory(identity, account_config, tx)
            },
        ));

        let discover = self.discover.clone();
        let updater = fan_in.updater(move || discover());
        Ok(Arc::new(DynamicRegistry::new(updater, config.account_refresh)))
    }
}

/// A benchmark ready to run: its manager and the receiving end of the
/// output channel.
pub struct Benchmark {
    kind: BenchmarkKind,
    manager: Manager,
    output: Option<mpsc::Receiver<ResourceInfo>>,
    /// Shared by the registry and its forwarders
    token: CancellationToken,
}

impl Benchmark {
    pub fn kind(&self) -> BenchmarkKind {
        self.kind
    }

    /// Start scanning and hand over the resource stream.
    pub fn run(&mut self) -> Result<mpsc::Receiver<ResourceInfo>, ManagerError> {
        self.manager.run()?;
        self.output.take().ok_or(ManagerError::AlreadyRunning)
    }

    pub async fn stop(&self) {
        info!(benchmark = %self.kind, "Stopping benchmark");
        self.manager.stop().await;
        self.token.cancel();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CycleEvent> {
        self.manager.subscribe()
    }
}

/// Maps each [`BenchmarkKind`] to the strategy that builds its registry.
#[derive(Default)]
pub struct BenchmarkBuilder {
    strategies: HashMap<BenchmarkKind, Arc<dyn RegistryStrategy>>,
}

impl BenchmarkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(
        mut self,
        kind: BenchmarkKind,
        strategy: impl RegistryStrategy + 'static,
    ) -> Self {
        self.strategies.insert(kind, Arc::new(strategy));
        self
    }

    /// Validate `config` and assemble the benchmark it selects.
    ///
    /// Fetchers observe a child of `parent`, so cancelling `parent` ends
    /// every cycle.
    pub async fn build(
        &self,
        config: &FetchingConfig,
        parent: &CancellationToken,
    ) -> Result<Benchmark, BuildError> {
        config.validate()?;

        let kind = config.benchmark;
        let strategy = self
            .strategies
            .get(&kind)
            .ok_or_else(|| BuildError::MissingStrategy(kind.to_string()))?;

        let token = parent.child_token();
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let registry = strategy
            .build_registry(config, tx, &token)
            .await
            .map_err(|source| BuildError::Registry {
                benchmark: kind.to_string(),
                source,
            })?;

        info!(
            benchmark = %kind,
            period = ?config.period,
            timeout = ?config.fetcher_timeout(),
            "Benchmark built"
        );

        Ok(Benchmark {
            kind,
            manager: Manager::new(registry, config.period, config.fetcher_timeout(), &token),
            output: Some(rx),
            token,
        })
    }
}
