//! Account Fan-in
//!
//! Builds one fetcher set per discovered cloud account and merges them into a
//! single map. Every account gets a private output channel and a forwarding
//! task that tags each resource with the account identity before relaying it
//! to the shared root channel.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::FetchersMap;
use super::{Resource, ResourceInfo, ResourceMetadata};

/// Buffer of each account's private channel
const ACCOUNT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Aws,
    Azure,
    Gcp,
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloudProvider::Aws => "aws",
            CloudProvider::Azure => "azure",
            CloudProvider::Gcp => "gcp",
        };
        f.write_str(name)
    }
}

/// Who owns the resources an account's fetchers produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudIdentity {
    pub account: String,
    #[serde(default)]
    pub account_alias: String,
    pub provider: CloudProvider,
    #[serde(default)]
    pub organization_id: String,
    #[serde(default)]
    pub organization_name: String,
}

/// A discovered account and the provider configuration used to reach it.
#[derive(Debug, Clone)]
pub struct Account<C> {
    pub identity: CloudIdentity,
    pub config: C,
}

/// A resource re-tagged with the identity of the account that produced it.
///
/// The wrapped resource is left untouched; only [`Resource::metadata`]
/// differs, with the account fields replaced.
pub struct AccountResource {
    inner: Arc<dyn Resource>,
    identity: Arc<CloudIdentity>,
}

impl AccountResource {
    pub fn new(inner: Arc<dyn Resource>, identity: Arc<CloudIdentity>) -> Self {
        Self { inner, identity }
    }

    pub fn identity(&self) -> &CloudIdentity {
        &self.identity
    }

    pub fn inner(&self) -> &Arc<dyn Resource> {
        &self.inner
    }
}

impl Resource for AccountResource {
    fn data(&self) -> serde_json::Value {
        self.inner.data()
    }

    fn metadata(&self) -> anyhow::Result<ResourceMetadata> {
        let mut metadata = self.inner.metadata()?;
        metadata.account.account_id = self.identity.account.clone();
        metadata.account.account_name = self.identity.account_alias.clone();
        metadata.account.organization_id = self.identity.organization_id.clone();
        metadata.account.organization_name = self.identity.organization_name.clone();
        Ok(metadata)
    }

    fn elastic_common_data(&self) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
        self.inner.elastic_common_data()
    }

    fn ids(&self) -> Vec<String> {
        self.inner.ids()
    }
}

type FetcherFactory<C> =
    Arc<dyn Fn(&CloudIdentity, &C, mpsc::Sender<ResourceInfo>) -> FetchersMap + Send + Sync>;

/// Merges per-account fetcher sets into one namespaced [`FetchersMap`].
///
/// Fetcher sets are cached by account id. An account discovered again keeps
/// its fetchers and forwarder; an account that disappears is evicted, which
/// drops its private senders and lets its forwarder finish.
pub struct AccountFanIn<C> {
    root: mpsc::Sender<ResourceInfo>,
    token: CancellationToken,
    factory: FetcherFactory<C>,
    cache: Mutex<HashMap<String, FetchersMap>>,
}

impl<C> AccountFanIn<C>
where
    C: Send + Sync + 'static,
{
    /// `factory` builds the fetchers of one account, wired to the sender it
    /// is given.
    pub fn new<F>(root: mpsc::Sender<ResourceInfo>, token: CancellationToken, factory: F) -> Self
    where
        F: Fn(&CloudIdentity, &C, mpsc::Sender<ResourceInfo>) -> FetchersMap + Send + Sync + 'static,
    {
        Self {
            root,
            token,
            factory: Arc::new(factory),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Build the merged map for `accounts`, keyed `"<account>-<key>"`.
    ///
    /// Must be called within a Tokio runtime: new accounts spawn a forwarder.
    pub fn build(&self, accounts: &[Account<C>]) -> FetchersMap {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let mut current: HashMap<String, FetchersMap> = HashMap::with_capacity(accounts.len());

        for account in accounts {
            let id = &account.identity.account;
            if current.contains_key(id) {
                warn!(account = %id, "Account discovered twice, ignoring duplicate");
                continue;
            }

            let fetchers = match cache.remove(id) {
                Some(existing) => {
                    debug!(account = %id, "Reusing cached account fetchers");
                    existing
                }
                None => self.start_account(account),
            };
            current.insert(id.clone(), fetchers);
        }

        for id in cache.keys() {
            info!(account = %id, "Account no longer discovered, evicting fetchers");
        }
        *cache = current;

        let mut merged = FetchersMap::new();
        for (account, fetchers) in cache.iter() {
            for (key, registered) in fetchers {
                merged.insert(format!("{account}-{key}"), registered.clone());
            }
        }
        merged
    }

    /// Ids of the accounts whose fetchers are currently cached.
    pub fn cached_accounts(&self) -> Vec<String> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.keys().cloned().collect()
    }

    /// Adapt an account discovery function into a
    /// [`DynamicRegistry`](super::DynamicRegistry) updater.
    pub fn updater<D, Fut>(
        self: &Arc<Self>,
        discover: D,
    ) -> impl Fn() -> BoxFuture<'static, anyhow::Result<FetchersMap>> + Send + Sync + 'static
    where
        D: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<Account<C>>>> + Send + 'static,
    {
        let fan_in = Arc::clone(self);
        move || {
            let fan_in = fan_in.clone();
            let discovery = discover();
            async move {
                let accounts = discovery.await.context("Failed to discover accounts")?;
                info!(accounts = accounts.len(), "Discovered accounts");
                Ok(fan_in.build(&accounts))
            }
            .boxed()
        }
    }

    fn start_account(&self, account: &Account<C>) -> FetchersMap {
        let identity = Arc::new(account.identity.clone());
        info!(
            account = %identity.account,
            provider = %identity.provider,
            "Starting fetchers for account"
        );

        let (tx, rx) = mpsc::channel(ACCOUNT_CHANNEL_CAPACITY);
        tokio::spawn(forward(
            rx,
            self.root.clone(),
            identity.clone(),
            self.token.clone(),
        ));

        (self.factory)(&identity, &account.config, tx)
    }
}

/// Relay one account's resources to the root channel until cancelled or
/// until every sender of `rx` is gone.
async fn forward(
    mut rx: mpsc::Receiver<ResourceInfo>,
    root: mpsc::Sender<ResourceInfo>,
    identity: Arc<CloudIdentity>,
    token: CancellationToken,
) {
    loop {
        let info = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            item = rx.recv() => match item {
                Some(info) => info,
                None => break,
            },
        };

        let wrapped = ResourceInfo::new(
            Arc::new(AccountResource::new(info.resource, identity.clone())),
            info.cycle_metadata,
        );

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            sent = root.send(wrapped) => {
                if sent.is_err() {
                    debug!(account = %identity.account, "Root channel closed");
                    break;
                }
            }
        }
    }

    debug!(account = %identity.account, "Account forwarder exited");
}
