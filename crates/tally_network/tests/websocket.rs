//! End-to-end over a real websocket: connector → tungstenite → a minimal
//! JSON-RPC server on localhost.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tally_codec::metadata::fixtures;
use tally_core::{ChainInfo, ChainRef, ChainRegistry, HealthStore, MemoryHealthStore};
use tally_network::{ConnectorConfig, SubscriptionEvent, SubstrateConnector, WsSocketConnector};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

fn answer(request: &Value) -> Vec<Value> {
    let id = request["id"].clone();
    let method = request["method"].as_str().unwrap_or_default();
    let reply = |result: Value| json!({ "jsonrpc": "2.0", "id": id, "result": result });
    match method {
        "system_chain" => vec![reply(json!("Localnet"))],
        "state_getRuntimeVersion" => vec![reply(json!({ "specVersion": 9 }))],
        "state_getMetadata" => vec![reply(json!(fixtures::metadata().to_hex()))],
        "state_subscribeRuntimeVersion" => vec![reply(json!("rv-1"))],
        "state_subscribeStorage" => vec![
            reply(json!("st-1")),
            json!({
                "jsonrpc": "2.0",
                "method": "state_storage",
                "params": {
                    "subscription": "st-1",
                    "result": { "block": "0x00", "changes": [["0x01", "0x02"]] },
                },
            }),
        ],
        _ => vec![json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32601, "message": "Method not found" },
        })],
    }
}

async fn serve(listener: TcpListener) {
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(async move {
            let Ok(mut ws) = accept_async(stream).await else {
                return;
            };
            while let Some(Ok(msg)) = ws.next().await {
                let Message::Text(text) = msg else {
                    continue;
                };
                let Ok(request) = serde_json::from_str::<Value>(text.as_str()) else {
                    continue;
                };
                for frame in answer(&request) {
                    if ws.send(Message::Text(frame.to_string().into())).await.is_err() {
                        return;
                    }
                }
            }
        });
    }
}

#[tokio::test]
async fn talks_json_rpc_over_a_real_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener));

    let mut registry = ChainRegistry::new();
    registry
        .add_chain(ChainInfo {
            chain: ChainRef::substrate("localnet", "0x00"),
            name: "Localnet".into(),
            // The first endpoint has nothing listening.
            rpcs: vec!["ws://127.0.0.1:1".into(), format!("ws://{addr}")],
            is_custom: false,
        })
        .unwrap();

    let health = Arc::new(MemoryHealthStore::new());
    let connector = SubstrateConnector::new(
        Arc::new(registry),
        Arc::new(WsSocketConnector),
        Arc::clone(&health) as Arc<dyn HealthStore>,
        ConnectorConfig {
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            ..ConnectorConfig::default()
        },
    );

    let handle = tokio::time::timeout(Duration::from_secs(10), connector.connect("localnet"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(health.get("ws://127.0.0.1:1").unwrap().consecutive_failures, 1);

    assert_eq!(handle.send("system_chain", json!([])).await.unwrap(), json!("Localnet"));

    let metadata = handle.metadata().await.unwrap();
    assert!(metadata.has_storage("Tokens", "Accounts"));
    assert_eq!(connector.metadata_cache().versions("localnet"), vec![9]);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = handle
        .subscribe("state_subscribeStorage", json!([["0x01"]]), move |e| {
            let _ = tx.send(e);
        })
        .unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        SubscriptionEvent::Update(json!({ "block": "0x00", "changes": [["0x01", "0x02"]] }))
    );
}
