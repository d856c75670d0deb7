//! Test fetchers, conditions and resources shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Condition, CycleMetadata, Fetcher, Resource, ResourceInfo, ResourceMetadata};

/// Resource carrying a single number as its data
pub struct NumberResource {
    pub num: i64,
}

impl Resource for NumberResource {
    fn data(&self) -> serde_json::Value {
        serde_json::json!(self.num)
    }

    fn metadata(&self) -> anyhow::Result<ResourceMetadata> {
        Ok(ResourceMetadata {
            id: format!("number-{}", self.num),
            resource_type: "number".to_string(),
            sub_type: "number".to_string(),
            name: "number".to_string(),
            region: "some-region".to_string(),
            ..Default::default()
        })
    }

    fn elastic_common_data(&self) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
        Ok(serde_json::Map::new())
    }
}

/// Sends one [`NumberResource`] per fetch.
pub struct NumberFetcher {
    num: i64,
    tx: mpsc::Sender<ResourceInfo>,
}

impl NumberFetcher {
    pub fn new(num: i64, tx: mpsc::Sender<ResourceInfo>) -> Self {
        Self { num, tx }
    }
}

#[async_trait]
impl Fetcher for NumberFetcher {
    async fn fetch(&self, token: CancellationToken, cycle: CycleMetadata) -> anyhow::Result<()> {
        let info = ResourceInfo::new(Arc::new(NumberResource { num: self.num }), cycle);
        tokio::select! {
            _ = token.cancelled() => anyhow::bail!("cancelled"),
            sent = self.tx.send(info) => sent.map_err(|_| anyhow::anyhow!("output closed")),
        }
    }

    fn stop(&self) {}
}

enum Behavior {
    Succeed,
    Fail(String),
    Panic(String),
    Block(Duration),
}

/// Records how often it was fetched and stopped.
pub struct CountingFetcher {
    behavior: Behavior,
    fetches: AtomicUsize,
    stops: AtomicUsize,
}

impl Default for CountingFetcher {
    fn default() -> Self {
        Self::with_behavior(Behavior::Succeed)
    }
}

impl CountingFetcher {
    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            fetches: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self::with_behavior(Behavior::Fail(message.to_string()))
    }

    pub fn panicking(message: &str) -> Self {
        Self::with_behavior(Behavior::Panic(message.to_string()))
    }

    /// Blocks for `delay` unless cancelled first.
    pub fn blocking(delay: Duration) -> Self {
        Self::with_behavior(Behavior::Block(delay))
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for CountingFetcher {
    async fn fetch(&self, token: CancellationToken, _cycle: CycleMetadata) -> anyhow::Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail(message) => Err(anyhow::anyhow!(message.clone())),
            Behavior::Panic(message) => panic!("{}", message),
            Behavior::Block(delay) => {
                tokio::select! {
                    _ = token.cancelled() => Ok(()),
                    _ = tokio::time::sleep(*delay) => Ok(()),
                }
            }
        }
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Condition with a fixed outcome
pub struct BoolCondition {
    value: bool,
    name: String,
}

impl BoolCondition {
    pub fn new(value: bool, name: &str) -> Self {
        Self {
            value,
            name: name.to_string(),
        }
    }
}

impl Condition for BoolCondition {
    fn name(&self) -> &str {
        &self.name
    }

    fn condition(&self) -> bool {
        self.value
    }
}

/// Drain everything currently buffered on `rx` without waiting.
pub fn collect_resources(rx: &mut mpsc::Receiver<ResourceInfo>) -> Vec<ResourceInfo> {
    let mut resources = Vec::new();
    while let Ok(info) = rx.try_recv() {
        resources.push(info);
    }
    resources
}

/// Receive up to `expected` items, giving up after `timeout`.
pub async fn collect_resources_with_timeout(
    rx: &mut mpsc::Receiver<ResourceInfo>,
    expected: usize,
    timeout: Duration,
) -> Vec<ResourceInfo> {
    let mut resources = Vec::with_capacity(expected);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    while resources.len() < expected {
        tokio::select! {
            _ = &mut deadline => break,
            item = rx.recv() => match item {
                Some(info) => resources.push(info),
                None => break,
            },
        }
    }

    resources
}

/// Install a log subscriber writing through the test harness.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}
