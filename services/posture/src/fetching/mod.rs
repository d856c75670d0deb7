//! Fetch Orchestration
//!
//! The capability traits every provider collector implements, and the
//! machinery that drives them:
//! - `cycle`: per-scan-pass metadata and the memoizing cycle cache
//! - `registry`: named fetchers with run-conditions
//! - `dynamic`: a registry rebuilt periodically from a discovery function
//! - `fanin`: per-account fetcher sets merged into one output stream
//! - `manager`: the periodic scheduler

mod cycle;
mod dynamic;
mod fanin;
mod manager;
mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use cycle::{CycleCache, CycleId, CycleMetadata};
pub use dynamic::DynamicRegistry;
pub use fanin::{Account, AccountFanIn, AccountResource, CloudIdentity, CloudProvider};
pub use manager::{CycleEvent, CycleReport, Manager};
pub use registry::{FetchersMap, RegisteredFetcher, Registry, StaticRegistry};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// A unit of collection work.
///
/// `fetch` pushes zero or more [`ResourceInfo`] items onto the output channel
/// it was built with. It must return promptly once `token` is cancelled.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, token: CancellationToken, cycle: CycleMetadata) -> anyhow::Result<()>;

    /// Release held resources. Called at most once per registration.
    fn stop(&self);
}

/// Gate deciding whether a fetcher takes part in the current cycle.
pub trait Condition: Send + Sync {
    fn name(&self) -> &str;

    fn condition(&self) -> bool;
}

/// An item produced by a fetcher, consumed by the evaluator downstream.
pub trait Resource: Send + Sync {
    fn data(&self) -> serde_json::Value;

    fn metadata(&self) -> anyhow::Result<ResourceMetadata>;

    fn elastic_common_data(&self) -> anyhow::Result<serde_json::Map<String, serde_json::Value>>;

    fn ids(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Descriptive metadata of a fetched resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    pub id: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(flatten)]
    pub account: CloudAccountMetadata,
}

/// Owning account of a resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudAccountMetadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub organization_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub organization_name: String,
}

/// A resource tagged with the cycle that produced it.
#[derive(Clone)]
pub struct ResourceInfo {
    pub resource: Arc<dyn Resource>,
    pub cycle_metadata: CycleMetadata,
}

impl ResourceInfo {
    pub fn new(resource: Arc<dyn Resource>, cycle_metadata: CycleMetadata) -> Self {
        Self {
            resource,
            cycle_metadata,
        }
    }
}

impl std::fmt::Debug for ResourceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceInfo")
            .field("metadata", &self.resource.metadata().ok())
            .field("cycle_metadata", &self.cycle_metadata)
            .finish()
    }
}
