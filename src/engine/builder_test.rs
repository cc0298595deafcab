use std::collections::BTreeMap;
use std::sync::Arc;

use serial_test::serial;
use tokio::sync::watch;

use super::*;
use crate::test_utils::*;
use crate::Error;
use crate::KvSchedulerConfig;
use crate::Registry;
use crate::RegistryError;
use crate::Transaction;
use crate::WatchRegistry;

fn config() -> KvSchedulerConfig {
    KvSchedulerConfig {
        scheduler: test_scheduler_config(),
        ..KvSchedulerConfig::default()
    }
}

#[tokio::test]
async fn test_build_registers_descriptors() {
    enable_logger();
    let sb = FakeSouthbound::new();
    let (_shutdown_tx, shutdown_rx) = watch::channel(());

    let engine = EngineBuilder::from_config(config(), shutdown_rx)
        .descriptor(FakeHandler::new(&sb, "iface/").descriptor("iface"))
        .descriptor(
            FakeHandler::new(&sb, "bd/")
                .with_dependencies(bridge_member_dependencies)
                .descriptor("bd"),
        )
        .build()
        .unwrap();

    assert_eq!(engine.scheduler().registry().len(), 2);
    assert_eq!(
        engine.scheduler().registry().registered_nb_key_prefixes(),
        vec!["iface/".to_string(), "bd/".to_string()]
    );
    assert_eq!(engine.config().scheduler.key_cache_size, 16);
}

#[tokio::test]
async fn test_build_rejects_invalid_config() {
    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    let mut config = config();
    config.pipeline.channel_buffer = 0;

    let result = EngineBuilder::from_config(config, shutdown_rx).build();
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn test_build_rejects_dump_dependency_cycle() {
    let sb = FakeSouthbound::new();
    let (_shutdown_tx, shutdown_rx) = watch::channel(());

    let result = EngineBuilder::from_config(config(), shutdown_rx)
        .descriptor(
            FakeHandler::new(&sb, "a/")
                .descriptor("a")
                .with_dump_dependencies(&["b"]),
        )
        .descriptor(
            FakeHandler::new(&sb, "b/")
                .descriptor("b")
                .with_dump_dependencies(&["a"]),
        )
        .build();

    assert!(matches!(
        result,
        Err(Error::Registry(RegistryError::DumpDependencyCycle(_)))
    ));
}

#[tokio::test]
async fn test_build_uses_shared_registry() {
    let sb = FakeSouthbound::new();
    let registry = Arc::new(Registry::new(8));
    registry.register_descriptor(FakeHandler::new(&sb, "iface/").descriptor("iface"));
    let (_shutdown_tx, shutdown_rx) = watch::channel(());

    let engine = EngineBuilder::from_config(config(), shutdown_rx)
        .registry(registry.clone())
        .build()
        .unwrap();

    assert!(Arc::ptr_eq(engine.scheduler().registry(), &registry));
}

#[tokio::test]
async fn test_engine_applies_queued_and_watched_changes() {
    let sb = FakeSouthbound::new();
    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    let engine = EngineBuilder::from_config(config(), shutdown_rx)
        .descriptor(FakeHandler::new(&sb, "iface/").descriptor("iface"))
        .build()
        .unwrap();

    let result = engine
        .queue()
        .commit(Transaction::new().put("iface/eth0", iface("eth0")))
        .await
        .unwrap();
    assert!(result.is_success());
    assert!(sb.value("iface/eth0").is_some());

    let watch_registry = WatchRegistry::new(engine.config().pipeline.clone());
    engine.watch(&watch_registry, "orchestrator").unwrap();
    let changes: BTreeMap<String, Option<crate::Value>> =
        [("iface/eth1".to_string(), Some(iface("eth1")))].into_iter().collect();
    watch_registry.propagate_changes(&changes).await.unwrap();
    assert!(sb.value("iface/eth1").is_some());

    engine.close().unwrap();
    assert!(watch_registry.subscription_names().is_empty());
}

#[tokio::test]
#[serial]
async fn test_new_applies_override_file() {
    for (key, _) in std::env::vars() {
        if key.starts_with("KVSCHED__") || key == "CONFIG_PATH" {
            std::env::remove_var(&key);
        }
    }
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("engine.toml");
    std::fs::write(
        &config_path,
        r#"
        [scheduler]
        key_cache_size = 42

        [pipeline]
        channel_buffer = 7
        "#,
    )
    .unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(());

    let engine = EngineBuilder::new(config_path.to_str(), shutdown_rx)
        .unwrap()
        .build()
        .unwrap();

    assert_eq!(engine.config().scheduler.key_cache_size, 42);
    assert_eq!(engine.config().pipeline.channel_buffer, 7);
}
