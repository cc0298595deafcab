use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kvscheduler::Dependency;
use kvscheduler::DescriptorError;
use kvscheduler::DescriptorHandler;
use kvscheduler::EngineBuilder;
use kvscheduler::KvDescriptor;
use kvscheduler::KvSchedulerConfig;
use kvscheduler::KvWithMetadata;
use kvscheduler::Metadata;
use kvscheduler::Transaction;
use kvscheduler::Value;
use kvscheduler::ValueState;
use kvscheduler::WatchRegistry;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;

/// Interfaces and bridge domains of a pretend dataplane, indexed by key.
#[derive(Default)]
struct Dataplane {
    objects: Mutex<BTreeMap<String, (Value, u32)>>,
    next_index: Mutex<u32>,
}

impl Dataplane {
    fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }
}

struct Handler {
    dataplane: Arc<Dataplane>,
    prefix: &'static str,
}

#[async_trait]
impl DescriptorHandler for Handler {
    async fn add(
        &self,
        key: &str,
        value: &Value,
    ) -> Result<Option<Metadata>, DescriptorError> {
        let mut next = self.dataplane.next_index.lock();
        *next += 1;
        self.dataplane
            .objects
            .lock()
            .insert(key.to_string(), (value.clone(), *next));
        Ok(Some(Metadata::new(*next)))
    }

    async fn delete(
        &self,
        key: &str,
        _value: &Value,
        metadata: Option<Metadata>,
    ) -> Result<(), DescriptorError> {
        let index = metadata.and_then(|m| m.downcast_ref::<u32>().copied());
        let mut objects = self.dataplane.objects.lock();
        match objects.get(key) {
            Some((_, stored)) if Some(*stored) == index => {
                objects.remove(key);
                Ok(())
            }
            _ => Err(DescriptorError::failed(format!("{key} has no index {index:?}"))),
        }
    }

    fn dependencies(
        &self,
        _key: &str,
        value: &Value,
    ) -> Vec<Dependency> {
        value["members"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|m| m.as_str())
            .map(|m| Dependency::on_key(format!("member-{m}"), format!("iface/{m}")))
            .collect()
    }

    async fn dump(
        &self,
        _correlate: &[KvWithMetadata],
    ) -> Result<Vec<KvWithMetadata>, DescriptorError> {
        Ok(self
            .dataplane
            .objects
            .lock()
            .iter()
            .filter(|(key, _)| key.starts_with(self.prefix))
            .map(|(key, (value, index))| KvWithMetadata::new(key.clone(), value.clone()).with_metadata(Metadata::new(*index)))
            .collect())
    }
}

fn descriptor(
    dataplane: &Arc<Dataplane>,
    name: &str,
    prefix: &'static str,
) -> KvDescriptor {
    KvDescriptor::new(
        name,
        KvDescriptor::prefix_selector(prefix),
        Arc::new(Handler {
            dataplane: dataplane.clone(),
            prefix,
        }),
    )
    .with_nb_key_prefix(prefix)
}

#[tokio::test]
async fn test_bridge_waits_for_its_interfaces() {
    let dataplane = Arc::new(Dataplane::default());
    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    let engine = EngineBuilder::from_config(KvSchedulerConfig::default(), shutdown_rx)
        .descriptor(descriptor(&dataplane, "iface", "iface/"))
        .descriptor(descriptor(&dataplane, "bd", "bd/").with_dump_dependencies(&["iface"]))
        .build()
        .unwrap();

    let result = engine
        .queue()
        .commit(Transaction::new().put("bd/br0", json!({ "members": ["eth0", "eth1"] })).put("iface/eth0", json!({})))
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(engine.scheduler().get_value_status("bd/br0").await.state, ValueState::Pending);
    assert_eq!(dataplane.keys(), vec!["iface/eth0".to_string()]);

    engine
        .queue()
        .commit(Transaction::new().put("iface/eth1", json!({})))
        .await
        .unwrap();
    assert_eq!(engine.scheduler().get_value_status("bd/br0").await.state, ValueState::Configured);
    assert_eq!(
        dataplane.keys(),
        vec!["bd/br0".to_string(), "iface/eth0".to_string(), "iface/eth1".to_string()]
    );

    // Removing a member takes the bridge down with it.
    engine
        .queue()
        .commit(Transaction::new().delete("iface/eth0"))
        .await
        .unwrap();
    assert_eq!(dataplane.keys(), vec!["iface/eth1".to_string()]);
    assert_eq!(engine.scheduler().get_value_status("bd/br0").await.state, ValueState::Pending);
}

#[tokio::test]
async fn test_watched_resync_converges_dataplane() {
    let dataplane = Arc::new(Dataplane::default());
    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    let engine = EngineBuilder::from_config(KvSchedulerConfig::default(), shutdown_rx)
        .descriptor(descriptor(&dataplane, "iface", "iface/"))
        .descriptor(descriptor(&dataplane, "bd", "bd/").with_dump_dependencies(&["iface"]))
        .build()
        .unwrap();
    let registry = WatchRegistry::new(engine.config().pipeline.clone());
    engine.watch(&registry, "orchestrator").unwrap();

    // Leftover from a previous run, unknown to the engine.
    dataplane
        .objects
        .lock()
        .insert("iface/stale".to_string(), (json!({}), 100));

    let desired: BTreeMap<String, Value> = [
        ("bd/br0".to_string(), json!({ "members": ["eth0"] })),
        ("iface/eth0".to_string(), json!({})),
    ]
    .into_iter()
    .collect();
    registry.propagate_resync(&desired).await.unwrap();
    assert_eq!(dataplane.keys(), vec!["bd/br0".to_string(), "iface/eth0".to_string()]);

    // A second identical resync has nothing to do.
    let before = dataplane.objects.lock().clone();
    registry.propagate_resync(&desired).await.unwrap();
    assert_eq!(*dataplane.objects.lock(), before);
    assert_eq!(engine.orchestrator().list_data().await, desired);

    engine.close().unwrap();
}
