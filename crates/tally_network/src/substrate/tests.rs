use std::time::Duration;

use serde_json::json;
use tally_codec::metadata::fixtures;
use tally_core::{BackoffPolicy, ChainInfo, ChainRef, MemoryHealthStore};
use tokio::sync::mpsc;

use super::*;
use crate::testing::MockSubstrateNode;

const CHAIN: &str = "testchain";
const A: &str = "ws://a.test";
const B: &str = "ws://b.test";
const C: &str = "ws://c.test";
const KEY: &str = "0x01";

fn config() -> ConnectorConfig {
    ConnectorConfig {
        request_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(1),
        backoff: BackoffPolicy {
            base: Duration::from_millis(10),
            cap: Duration::from_millis(50),
            jitter: 0.0,
        },
        max_endpoint_cycles: None,
    }
}

fn setup_with(config: ConnectorConfig) -> (SubstrateConnector, MockSubstrateNode, Arc<MemoryHealthStore>) {
    let mut registry = ChainRegistry::new();
    registry
        .add_chain(ChainInfo {
            chain: ChainRef::substrate(CHAIN, "0x00"),
            name: "Test".into(),
            rpcs: vec![A.into(), B.into(), C.into()],
            is_custom: false,
        })
        .unwrap();
    let node = MockSubstrateNode::new();
    let health = Arc::new(MemoryHealthStore::new());
    let connector = SubstrateConnector::new(
        Arc::new(registry),
        Arc::new(node.clone()),
        Arc::clone(&health) as Arc<dyn HealthStore>,
        config,
    );
    (connector, node, health)
}

fn setup() -> (SubstrateConnector, MockSubstrateNode, Arc<MemoryHealthStore>) {
    setup_with(config())
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<SubscriptionEvent>) -> SubscriptionEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no event in time")
        .expect("listener dropped")
}

fn listener() -> (
    impl Fn(SubscriptionEvent) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<SubscriptionEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (move |e| {
        let _ = tx.send(e);
    }, rx)
}

fn change(value: Option<&str>) -> SubscriptionEvent {
    SubscriptionEvent::Update(json!({
        "block": "0x0000000000000000000000000000000000000000000000000000000000000001",
        "changes": [[KEY, value]],
    }))
}

#[tokio::test]
async fn connect_skips_failing_endpoints_and_records_them() {
    let (connector, node, health) = setup();
    node.set_refused(A, true);
    node.set_refused(B, true);

    let handle = connector.connect(CHAIN).await.unwrap();
    assert_eq!(handle.status(), ConnectionStatus::Connected);
    assert_eq!(node.connect_log(), vec![C.to_string()]);

    assert_eq!(health.get(A).unwrap().consecutive_failures, 1);
    assert_eq!(health.get(B).unwrap().consecutive_failures, 1);
    let c = health.get(C).unwrap();
    assert_eq!(c.consecutive_failures, 0);
    assert!(c.last_success.is_some());
}

#[tokio::test]
async fn gives_up_after_configured_cycles() {
    let mut config = config();
    config.max_endpoint_cycles = Some(2);
    let (connector, node, health) = setup_with(config);
    for url in [A, B, C] {
        node.set_refused(url, true);
    }

    let err = connector.connect(CHAIN).await.unwrap_err();
    assert_eq!(err, ConnectorError::AllEndpointsFailed(CHAIN.into()));
    assert_eq!(health.get(A).unwrap().consecutive_failures, 2);
}

#[tokio::test]
async fn connect_is_bounded_when_every_endpoint_refuses() {
    let mut config = config();
    config.request_timeout = Duration::from_millis(300);
    let (connector, node, _) = setup_with(config);
    for url in [A, B, C] {
        node.set_refused(url, true);
    }

    let started = tokio::time::Instant::now();
    let err = connector.connect(CHAIN).await.unwrap_err();
    assert_eq!(err, ConnectorError::Timeout(Duration::from_millis(300)));
    assert!(started.elapsed() < Duration::from_secs(2));

    // A later attempt succeeds once an endpoint is back.
    node.set_refused(A, false);
    let handle = connector.connect(CHAIN).await.unwrap();
    assert_eq!(handle.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn requests_share_one_socket() {
    let (connector, node, _) = setup();
    node.set_storage(KEY, Some("0x2a"));

    let value = connector.send(CHAIN, "state_getStorage", json!([KEY])).await.unwrap();
    assert_eq!(value, json!("0x2a"));

    let handle = connector.connect(CHAIN).await.unwrap();
    let (a, b) = tokio::join!(
        handle.send("system_chain", json!([])),
        handle.send("state_getStorage", json!(["0xff"])),
    );
    assert_eq!(a.unwrap(), json!("Mock"));
    assert_eq!(b.unwrap(), json!(null));
    // The one-off `send` above released its connection.
    wait_until(|| node.open_connections() == 1).await;
}

#[tokio::test]
async fn rpc_errors_reach_only_their_caller() {
    let (connector, node, _) = setup();
    node.fail_method("state_getStorage", -32602, "Invalid params");
    let handle = connector.connect(CHAIN).await.unwrap();

    let (failed, ok) = tokio::join!(
        handle.send("state_getStorage", json!(["zz"])),
        handle.send("system_chain", json!([])),
    );
    assert_eq!(
        failed,
        Err(ConnectorError::Rpc { code: -32602, message: "Invalid params".into() })
    );
    assert_eq!(ok.unwrap(), json!("Mock"));
}

#[tokio::test]
async fn slow_request_times_out_without_reconnecting() {
    let mut config = config();
    config.request_timeout = Duration::from_millis(300);
    let (connector, node, _) = setup_with(config);
    node.silence("system_chain");
    let handle = connector.connect(CHAIN).await.unwrap();

    let err = handle.send("system_chain", json!([])).await.unwrap_err();
    assert_eq!(err, ConnectorError::Timeout(Duration::from_millis(300)));

    node.set_storage(KEY, Some("0x01"));
    assert_eq!(handle.send("state_getStorage", json!([KEY])).await.unwrap(), json!("0x01"));
    assert_eq!(node.connect_log().len(), 1);
    assert_eq!(handle.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn requests_queue_until_connected() {
    let (connector, node, _) = setup();
    for url in [A, B, C] {
        node.set_refused(url, true);
    }

    let pending = {
        let connector = connector.clone();
        tokio::spawn(async move { connector.send(CHAIN, "system_chain", json!([])).await })
    };
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!pending.is_finished());

    node.set_refused(B, false);
    let result = tokio::time::timeout(Duration::from_secs(5), pending).await.unwrap().unwrap();
    assert_eq!(result.unwrap(), json!("Mock"));
}

#[tokio::test]
async fn identical_subscriptions_share_a_wire_subscription() {
    let (connector, node, _) = setup();
    node.set_storage(KEY, Some("0x02"));
    let params = json!([[KEY]]);

    let (on_a, mut rx_a) = listener();
    let (on_b, mut rx_b) = listener();
    let sub_a = connector.subscribe(CHAIN, "state_subscribeStorage", params.clone(), on_a).unwrap();
    assert_eq!(next_event(&mut rx_a).await, change(Some("0x02")));
    let sub_b = connector.subscribe(CHAIN, "state_subscribeStorage", params.clone(), on_b).unwrap();
    assert_eq!(next_event(&mut rx_b).await, change(Some("0x02")));

    assert_eq!(node.storage_subscriptions(), 1);
    assert_eq!(connector.wire_subscription_count(CHAIN), 1);

    node.set_storage(KEY, Some("0x03"));
    assert_eq!(next_event(&mut rx_a).await, change(Some("0x03")));
    assert_eq!(next_event(&mut rx_b).await, change(Some("0x03")));

    sub_a.cancel();
    sub_a.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.storage_subscriptions(), 1);
    assert_eq!(connector.wire_subscription_count(CHAIN), 1);

    sub_b.cancel();
    wait_until(|| connector.active_connections() == 0).await;
    wait_until(|| node.open_connections() == 0 && node.storage_subscriptions() == 0).await;
    assert_eq!(connector.wire_subscription_count(CHAIN), 0);
}

#[tokio::test]
async fn last_subscriber_leaving_unsubscribes_on_a_shared_connection() {
    let (connector, node, _) = setup();
    let handle = connector.connect(CHAIN).await.unwrap();

    let (on_update, mut rx) = listener();
    let sub = handle.subscribe("state_subscribeStorage", json!([[KEY]]), on_update).unwrap();
    assert_eq!(next_event(&mut rx).await, change(None));
    assert_eq!(node.storage_subscriptions(), 1);

    sub.cancel();
    wait_until(|| node.calls_to("state_unsubscribeStorage") == 1).await;
    wait_until(|| node.storage_subscriptions() == 0).await;
    assert_eq!(node.open_connections(), 1);
}

#[tokio::test]
async fn rejected_subscription_reports_an_error() {
    let (connector, node, _) = setup();
    node.fail_method("state_subscribeStorage", -32000, "busy");

    let (on_update, mut rx) = listener();
    let _sub = connector
        .subscribe(CHAIN, "state_subscribeStorage", json!([[KEY]]), on_update)
        .unwrap();
    assert_eq!(
        next_event(&mut rx).await,
        SubscriptionEvent::Error(ConnectorError::Rpc { code: -32000, message: "busy".into() })
    );
    wait_until(|| connector.wire_subscription_count(CHAIN) == 0).await;
}

#[tokio::test]
async fn subscriptions_are_reissued_after_reconnect() {
    let (connector, node, _) = setup();
    node.set_storage(KEY, Some("0x02"));

    let (on_update, mut rx) = listener();
    let _sub = connector
        .subscribe(CHAIN, "state_subscribeStorage", json!([[KEY]]), on_update)
        .unwrap();
    assert_eq!(next_event(&mut rx).await, change(Some("0x02")));

    node.drop_connections();
    assert_eq!(next_event(&mut rx).await, SubscriptionEvent::Disconnected);
    assert_eq!(next_event(&mut rx).await, change(Some("0x02")));
    assert_eq!(node.storage_subscriptions(), 1);
    assert_eq!(connector.status(CHAIN), ConnectionStatus::Connected);

    node.set_storage(KEY, Some("0x04"));
    assert_eq!(next_event(&mut rx).await, change(Some("0x04")));
}

#[tokio::test]
async fn metadata_is_fetched_once_per_spec_version() {
    let (connector, node, _) = setup();
    let handle = connector.connect(CHAIN).await.unwrap();

    let metadata = handle.metadata().await.unwrap();
    assert!(metadata.has_storage("System", "Account"));
    assert_eq!(node.calls_to("state_getMetadata"), 1);

    node.drop_connections();
    wait_until(|| node.calls_to("state_getRuntimeVersion") >= 2).await;
    let again = handle.metadata().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(Arc::ptr_eq(&metadata, &again));
    assert_eq!(node.calls_to("state_getMetadata"), 1);
}

#[tokio::test]
async fn runtime_upgrade_publishes_new_metadata() {
    let (connector, node, _) = setup();
    let handle = connector.connect(CHAIN).await.unwrap();
    let mut updates = handle.metadata_updates();
    handle.metadata().await.unwrap();
    let _ = updates.borrow_and_update();

    node.upgrade_runtime(&fixtures::legacy_metadata(), 2);
    tokio::time::timeout(Duration::from_secs(5), updates.changed())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(node.calls_to("state_getMetadata"), 2);
    assert_eq!(connector.metadata_cache().versions(CHAIN), vec![1, 2]);
    let upgraded = handle.current_metadata().unwrap();
    assert_eq!(upgraded.to_hex(), fixtures::legacy_metadata().to_hex());
}

#[tokio::test]
async fn dropping_the_last_handle_closes_the_socket() {
    let (connector, node, _) = setup();
    let handle = connector.connect(CHAIN).await.unwrap();
    let clone = handle.clone();
    drop(handle);
    assert_eq!(connector.active_connections(), 1);

    drop(clone);
    assert_eq!(connector.active_connections(), 0);
    assert_eq!(connector.status(CHAIN), ConnectionStatus::Disconnected);
    wait_until(|| node.open_connections() == 0).await;

    // A fresh acquire starts a new connection.
    let _again = connector.connect(CHAIN).await.unwrap();
    assert_eq!(node.connect_log().len(), 2);
}

#[tokio::test]
async fn evm_chains_are_rejected() {
    let mut registry = ChainRegistry::new();
    registry
        .add_chain(ChainInfo {
            chain: ChainRef::evm(1),
            name: "Ethereum".into(),
            rpcs: vec!["https://eth.test".into()],
            is_custom: false,
        })
        .unwrap();
    let connector = SubstrateConnector::new(
        Arc::new(registry),
        Arc::new(MockSubstrateNode::new()),
        Arc::new(MemoryHealthStore::new()),
        config(),
    );
    assert!(matches!(connector.acquire("1"), Err(ConnectorError::Config(_))));
    assert!(matches!(connector.acquire("nope"), Err(ConnectorError::Config(_))));
}
