//! End-to-end: account discovery feeding a dynamic registry driven by the
//! manager, with resources fanned into one output channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lornu_posture::fetching::{
    Account, AccountFanIn, CloudIdentity, CloudProvider, CycleEvent, CycleId, CycleMetadata,
    DynamicRegistry, Fetcher, FetchersMap, Manager, RegisteredFetcher, Resource, ResourceInfo,
    ResourceMetadata,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct ServiceResource {
    service: String,
}

impl Resource for ServiceResource {
    fn data(&self) -> serde_json::Value {
        serde_json::json!({ "service": self.service })
    }

    fn metadata(&self) -> anyhow::Result<ResourceMetadata> {
        Ok(ResourceMetadata {
            id: self.service.clone(),
            resource_type: "cloud-config".to_string(),
            region: "eu-west-1".to_string(),
            ..Default::default()
        })
    }

    fn elastic_common_data(&self) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
        Ok(serde_json::Map::new())
    }
}

struct ServiceFetcher {
    tx: mpsc::Sender<ResourceInfo>,
    stops: Arc<AtomicUsize>,
}

#[async_trait]
impl Fetcher for ServiceFetcher {
    async fn fetch(&self, token: CancellationToken, cycle: CycleMetadata) -> anyhow::Result<()> {
        let resource = Arc::new(ServiceResource {
            service: "s3".to_string(),
        });
        tokio::select! {
            _ = token.cancelled() => Ok(()),
            sent = self.tx.send(ResourceInfo::new(resource, cycle)) => {
                sent.map_err(|_| anyhow::anyhow!("output closed"))
            }
        }
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

fn account(id: &str) -> Account<()> {
    Account {
        identity: CloudIdentity {
            account: id.to_string(),
            account_alias: format!("{id}-alias"),
            provider: CloudProvider::Aws,
            organization_id: "o-abc".to_string(),
            organization_name: "acme".to_string(),
        },
        config: (),
    }
}

#[tokio::test(start_paused = true)]
async fn test_discovered_accounts_join_later_cycles() {
    let (tx, mut rx) = mpsc::channel(100);
    let token = CancellationToken::new();
    let stops = Arc::new(AtomicUsize::new(0));
    let factory_calls = Arc::new(AtomicUsize::new(0));

    let factory_stops = stops.clone();
    let calls = factory_calls.clone();
    let fan_in = Arc::new(AccountFanIn::new(
        tx,
        token.clone(),
        move |_identity: &CloudIdentity, _config: &(), account_tx| {
            calls.fetch_add(1, Ordering::SeqCst);
            let fetcher = Arc::new(ServiceFetcher {
                tx: account_tx,
                stops: factory_stops.clone(),
            });
            [("s3".to_string(), RegisteredFetcher::new(fetcher))]
                .into_iter()
                .collect::<FetchersMap>()
        },
    ));

    let discoveries = Arc::new(AtomicUsize::new(0));
    let discovered = discoveries.clone();
    let updater = fan_in.updater(move || {
        let call = discovered.fetch_add(1, Ordering::SeqCst);
        async move {
            let accounts = if call == 0 {
                vec![account("111")]
            } else {
                vec![account("111"), account("222")]
            };
            Ok::<_, anyhow::Error>(accounts)
        }
    });
    let registry = Arc::new(DynamicRegistry::new(updater, Duration::from_secs(25)));

    let manager = Manager::new(
        registry,
        Duration::from_secs(10),
        Duration::from_secs(5),
        &token,
    );
    let mut events = manager.subscribe();
    manager.run().unwrap();

    let mut cycles: Vec<CycleId> = Vec::new();
    loop {
        match events.recv().await.unwrap() {
            CycleEvent::Started(cycle) => cycles.push(cycle.cycle_id),
            CycleEvent::Ended { cycle, report } => {
                assert!(report.failed.is_empty());
                if cycle.sequence == 4 {
                    assert_eq!(report.succeeded.len(), 2);
                    break;
                }
                assert_eq!(report.succeeded, vec!["111-s3".to_string()]);
            }
        }
    }

    let mut per_cycle: HashMap<CycleId, Vec<String>> = HashMap::new();
    for _ in 0..5 {
        let info = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let metadata = info.resource.metadata().unwrap();
        assert_eq!(metadata.account.account_name, format!("{}-alias", metadata.account.account_id));
        assert_eq!(metadata.account.organization_name, "acme");
        per_cycle
            .entry(info.cycle_metadata.cycle_id)
            .or_default()
            .push(metadata.account.account_id);
    }

    assert_eq!(cycles.len(), 4);
    for early in &cycles[..3] {
        assert_eq!(per_cycle[early], vec!["111".to_string()]);
    }
    let mut last = per_cycle[&cycles[3]].clone();
    last.sort();
    assert_eq!(last, vec!["111".to_string(), "222".to_string()]);

    // Account 111 was reused across the refresh, not rebuilt or stopped.
    assert_eq!(factory_calls.load(Ordering::SeqCst), 2);
    assert_eq!(stops.load(Ordering::SeqCst), 0);

    manager.stop().await;
    assert_eq!(stops.load(Ordering::SeqCst), 2);
    token.cancel();
}
