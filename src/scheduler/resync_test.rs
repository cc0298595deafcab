use std::sync::Arc;

use serde_json::json;

use super::*;
use crate::test_utils::*;
use crate::DescriptorError;

fn dumpable_scheduler(sb: &Arc<FakeSouthbound>) -> KvScheduler {
    enable_logger();
    let scheduler = KvScheduler::new(test_scheduler_config());
    scheduler.register_descriptor(FakeHandler::new(sb, "iface/").dumpable().modifiable().descriptor("iface"));
    scheduler.register_descriptor(
        FakeHandler::new(sb, "bd/")
            .dumpable()
            .with_dependencies(bridge_member_dependencies)
            .descriptor("bd"),
    );
    scheduler
}

fn desired() -> Vec<KeyValuePair> {
    vec![
        KeyValuePair::new("bd/br1", bridge(&["eth0"])),
        KeyValuePair::new("iface/eth0", iface("eth0")),
    ]
}

fn dumps() -> Vec<SbCall> {
    vec![SbCall::Dump("iface/".into()), SbCall::Dump("bd/".into())]
}

#[tokio::test]
async fn test_second_full_resync_is_a_no_op() {
    let sb = FakeSouthbound::new();
    let scheduler = dumpable_scheduler(&sb);

    let first = scheduler.full_resync(desired(), TxnOptions::default()).await.unwrap();
    assert!(first.is_success());
    let mut expected = dumps();
    expected.extend([SbCall::Add("iface/eth0".into()), SbCall::Add("bd/br1".into())]);
    assert_eq!(sb.calls(), expected);

    sb.clear_calls();
    let second = scheduler.full_resync(desired(), TxnOptions::default()).await.unwrap();
    assert!(second.is_success());
    assert!(second.executed.is_empty());
    assert_eq!(sb.calls(), dumps());

    let metadata = scheduler
        .get_metadata("iface", "iface/eth0")
        .await
        .and_then(|m| m.downcast_ref::<u64>().copied());
    assert_eq!(metadata, sb.id_of("iface/eth0"));
}

#[tokio::test]
async fn test_put_then_resync_never_modifies() {
    let sb = FakeSouthbound::new();
    let scheduler = dumpable_scheduler(&sb);
    scheduler
        .commit(Transaction::new().put("iface/eth0", iface("eth0")))
        .await
        .unwrap();
    sb.clear_calls();

    let result = scheduler
        .full_resync(vec![KeyValuePair::new("iface/eth0", iface("eth0"))], TxnOptions::default())
        .await
        .unwrap();

    assert!(result.executed.is_empty());
    assert!(!sb.calls().iter().any(|c| matches!(c, SbCall::Modify(_))));
    assert_eq!(sb.calls(), dumps());
}

#[tokio::test]
async fn test_unwanted_dumped_values_are_deleted() {
    let sb = FakeSouthbound::new();
    let scheduler = dumpable_scheduler(&sb);
    let stale_id = sb.inject("iface/stale", iface("stale"), ValueOrigin::Unknown);

    let result = scheduler
        .full_resync(vec![KeyValuePair::new("iface/eth0", iface("eth0"))], TxnOptions::default())
        .await
        .unwrap();

    assert!(result.is_success());
    let mut expected = dumps();
    expected.extend([
        SbCall::Delete("iface/stale".into(), Some(stale_id)),
        SbCall::Add("iface/eth0".into()),
    ]);
    assert_eq!(sb.calls(), expected);
    assert_eq!(sb.keys(), vec!["iface/eth0"]);
}

#[tokio::test]
async fn test_sb_owned_values_are_kept_and_satisfy_dependencies() {
    let sb = FakeSouthbound::new();
    let scheduler = dumpable_scheduler(&sb);
    sb.inject("iface/host0", iface("host0"), ValueOrigin::FromSb);

    let result = scheduler
        .full_resync(vec![KeyValuePair::new("bd/br1", bridge(&["host0"]))], TxnOptions::default())
        .await
        .unwrap();

    assert!(result.is_success());
    let mut expected = dumps();
    expected.push(SbCall::Add("bd/br1".into()));
    assert_eq!(sb.calls(), expected);
    assert_eq!(scheduler.get_value_status("iface/host0").await.state, ValueState::Obtained);

    // Not part of the NB view.
    let nb = scheduler.dump_values_by_descriptor("iface", View::Nb).await.unwrap();
    assert!(nb.is_empty());
}

#[tokio::test]
async fn test_resync_repairs_sb_drift() {
    let sb = FakeSouthbound::new();
    let scheduler = dumpable_scheduler(&sb);
    scheduler.full_resync(desired(), TxnOptions::default()).await.unwrap();

    // Interface modified and bridge removed behind the scheduler's back.
    sb.inject("iface/eth0", json!({ "name": "eth0", "mtu": 9000 }), ValueOrigin::Unknown);
    sb.remove("bd/br1");
    sb.clear_calls();

    let result = scheduler.full_resync(desired(), TxnOptions::default()).await.unwrap();

    assert!(result.is_success());
    let mut expected = dumps();
    expected.extend([SbCall::Modify("iface/eth0".into()), SbCall::Add("bd/br1".into())]);
    assert_eq!(sb.calls(), expected);
    assert_eq!(sb.value("iface/eth0"), Some(iface("eth0")));
}

#[tokio::test]
async fn test_failed_dump_excludes_descriptor_from_resync() {
    let sb = FakeSouthbound::new();
    let scheduler = dumpable_scheduler(&sb);
    sb.fail_dump("bd/");

    let result = scheduler.full_resync(desired(), TxnOptions::default()).await.unwrap();

    assert!(!result.is_success());
    assert!(result.errors.is_empty());
    assert_eq!(
        result.dump_errors,
        vec![DumpError {
            descriptor: "bd".into(),
            error: DescriptorError::failed("injected dump failure"),
        }]
    );
    let mut expected = dumps();
    expected.push(SbCall::Add("iface/eth0".into()));
    assert_eq!(sb.calls(), expected);
    assert_eq!(scheduler.get_value_status("bd/br1").await.state, ValueState::NonExistent);
}

#[tokio::test]
async fn test_dump_follows_dump_dependencies() {
    let sb = FakeSouthbound::new();
    let scheduler = KvScheduler::new(test_scheduler_config());
    scheduler.register_descriptor(
        FakeHandler::new(&sb, "bd/")
            .dumpable()
            .descriptor("bd")
            .with_dump_dependencies(&["iface"]),
    );
    scheduler.register_descriptor(FakeHandler::new(&sb, "iface/").dumpable().descriptor("iface"));

    scheduler.full_resync(Vec::new(), TxnOptions::default()).await.unwrap();
    assert_eq!(sb.calls(), dumps());
}

#[tokio::test]
async fn test_downstream_resync_reapplies_nb_state() {
    let sb = FakeSouthbound::new();
    let scheduler = dumpable_scheduler(&sb);
    scheduler
        .commit(Transaction::new().put("iface/eth0", iface("eth0")))
        .await
        .unwrap();
    sb.remove("iface/eth0");
    sb.clear_calls();

    let txn = Transaction::new().with_options(TxnOptions::default().with_resync(ResyncType::DownstreamResync));
    let result = scheduler.commit(txn).await.unwrap();

    assert!(result.is_success());
    let mut expected = dumps();
    expected.push(SbCall::Add("iface/eth0".into()));
    assert_eq!(sb.calls(), expected);
}

#[tokio::test]
async fn test_upstream_resync_replaces_nb_state_without_dump() {
    let sb = FakeSouthbound::new();
    let scheduler = dumpable_scheduler(&sb);
    scheduler
        .commit(Transaction::new().put("iface/eth0", iface("eth0")))
        .await
        .unwrap();
    let id = sb.id_of("iface/eth0");
    sb.clear_calls();

    let txn = Transaction::new()
        .put("iface/eth1", iface("eth1"))
        .with_options(TxnOptions::default().with_resync(ResyncType::UpstreamResync));
    scheduler.commit(txn).await.unwrap();

    assert_eq!(
        sb.calls(),
        vec![SbCall::Delete("iface/eth0".into(), id), SbCall::Add("iface/eth1".into())]
    );
    let recorded = scheduler.transaction_history(None, None).await;
    assert_eq!(recorded.last().map(|r| r.resync_type), Some(ResyncType::UpstreamResync));
}

#[tokio::test]
async fn test_undumpable_derived_values_survive_resync() {
    let sb = FakeSouthbound::new();
    let scheduler = KvScheduler::new(test_scheduler_config());
    scheduler.register_descriptor(
        FakeHandler::new(&sb, "bd/")
            .dumpable()
            .with_derived(bridge_member_bindings)
            .descriptor("bd"),
    );
    scheduler.register_descriptor(FakeHandler::new(&sb, "bd-member/").descriptor("bd-member"));
    let desired = vec![KeyValuePair::new("bd/br1", bridge(&["eth0"]))];

    scheduler.full_resync(desired.clone(), TxnOptions::default()).await.unwrap();
    assert!(sb.value("bd-member/br1/eth0").is_some());

    sb.clear_calls();
    let result = scheduler.full_resync(desired, TxnOptions::default()).await.unwrap();
    assert!(result.executed.is_empty());
    assert_eq!(sb.calls(), vec![SbCall::Dump("bd/".into())]);
    assert_eq!(
        scheduler.get_value_status("bd-member/br1/eth0").await.state,
        ValueState::Configured
    );
}
