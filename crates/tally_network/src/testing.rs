//! In-process stand-ins for chain nodes, for tests here and downstream
//! (enable the `testing` feature).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use primitive_types::U256;
use serde_json::{Value, json};
use tally_codec::Metadata;
use tally_codec::metadata::fixtures;
use tokio::sync::mpsc;

use crate::error::ConnectorError;
use crate::evm::HttpTransport;
use crate::transport::{Socket, SocketConnector};

const BLOCK_HASH: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";

// ---------------------------------------------------------------------------
// Substrate node
// ---------------------------------------------------------------------------

enum NodeSubKind {
    Storage(Vec<String>),
    RuntimeVersion,
}

struct NodeSub {
    conn: u64,
    kind: NodeSubKind,
}

struct NodeState {
    spec_version: u32,
    metadata_hex: String,
    storage: HashMap<String, String>,
    refused: HashSet<String>,
    silent: HashSet<String>,
    errors: HashMap<String, (i64, String)>,
    connections: HashMap<u64, mpsc::UnboundedSender<String>>,
    subscriptions: HashMap<String, NodeSub>,
    next_conn: u64,
    next_sub: u64,
    calls: Vec<String>,
    opened: Vec<String>,
}

impl NodeState {
    fn push(&self, conn: u64, frame: Value) {
        if let Some(tx) = self.connections.get(&conn) {
            let _ = tx.send(frame.to_string());
        }
    }

    fn notify(&self, conn: u64, method: &str, subscription: &str, result: Value) {
        self.push(
            conn,
            json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": { "subscription": subscription, "result": result },
            }),
        );
    }

    fn change_set(&self, keys: &[String]) -> Value {
        let changes: Vec<Value> = keys
            .iter()
            .map(|k| json!([k, self.storage.get(k)]))
            .collect();
        json!({ "block": BLOCK_HASH, "changes": changes })
    }

    fn runtime_version(&self) -> Value {
        json!({ "specName": "mock", "specVersion": self.spec_version, "transactionVersion": 1 })
    }

    fn open_subscription(&mut self, conn: u64, kind: NodeSubKind) -> String {
        self.next_sub += 1;
        let id = format!("sub-{}", self.next_sub);
        self.subscriptions.insert(id.clone(), NodeSub { conn, kind });
        id
    }

    fn handle(&mut self, conn: u64, text: &str) {
        if !self.connections.contains_key(&conn) {
            return;
        }
        let Ok(frame) = serde_json::from_str::<Value>(text) else {
            return;
        };
        let id = frame.get("id").cloned().unwrap_or(Value::Null);
        let method = frame.get("method").and_then(Value::as_str).unwrap_or_default().to_string();
        let params = frame.get("params").cloned().unwrap_or(Value::Null);
        self.calls.push(method.clone());

        if self.silent.contains(&method) {
            return;
        }
        if let Some((code, message)) = self.errors.get(&method) {
            let error = json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } });
            self.push(conn, error);
            return;
        }

        let reply = |state: &NodeState, result: Value| {
            state.push(conn, json!({ "jsonrpc": "2.0", "id": id, "result": result }));
        };

        match method.as_str() {
            "state_getRuntimeVersion" => reply(self, self.runtime_version()),
            "state_getMetadata" => reply(self, json!(self.metadata_hex)),
            "state_getStorage" => {
                let key = params[0].as_str().unwrap_or_default();
                reply(self, json!(self.storage.get(key)));
            }
            "state_subscribeStorage" => {
                let keys: Vec<String> = params[0]
                    .as_array()
                    .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
                    .unwrap_or_default();
                let change_set = self.change_set(&keys);
                let sub = self.open_subscription(conn, NodeSubKind::Storage(keys));
                reply(self, json!(sub));
                self.notify(conn, "state_storage", &sub, change_set);
            }
            "state_subscribeRuntimeVersion" => {
                let sub = self.open_subscription(conn, NodeSubKind::RuntimeVersion);
                reply(self, json!(sub));
                self.notify(conn, "state_runtimeVersion", &sub, self.runtime_version());
            }
            "state_unsubscribeStorage" | "state_unsubscribeRuntimeVersion" => {
                let sub = params[0].as_str().unwrap_or_default();
                let removed = self.subscriptions.remove(sub).is_some();
                reply(self, json!(removed));
            }
            "system_chain" => reply(self, json!("Mock")),
            _ => {
                let error = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32601, "message": "Method not found" },
                });
                self.push(conn, error);
            }
        }
    }

    fn close(&mut self, conn: u64) {
        self.connections.remove(&conn);
        self.subscriptions.retain(|_, s| s.conn != conn);
    }
}

/// A scripted Substrate node. Serves `state_*` storage and runtime calls
/// from an in-memory key/value map; every URL not marked refused connects.
#[derive(Clone)]
pub struct MockSubstrateNode {
    state: Arc<Mutex<NodeState>>,
}

impl Default for MockSubstrateNode {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSubstrateNode {
    /// A node running the codec's fixture runtime at spec version 1.
    pub fn new() -> Self {
        Self::with_metadata(&fixtures::metadata(), 1)
    }

    pub fn with_metadata(metadata: &Metadata, spec_version: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(NodeState {
                spec_version,
                metadata_hex: metadata.to_hex(),
                storage: HashMap::new(),
                refused: HashSet::new(),
                silent: HashSet::new(),
                errors: HashMap::new(),
                connections: HashMap::new(),
                subscriptions: HashMap::new(),
                next_conn: 0,
                next_sub: 0,
                calls: Vec::new(),
                opened: Vec::new(),
            })),
        }
    }

    /// Write (or with `None`, delete) a storage value and notify watchers.
    pub fn set_storage(&self, key: &str, value: Option<&str>) {
        let mut state = self.state.lock();
        match value {
            Some(v) => state.storage.insert(key.to_string(), v.to_string()),
            None => state.storage.remove(key),
        };
        let targets: Vec<(u64, String)> = state
            .subscriptions
            .iter()
            .filter(|(_, s)| matches!(&s.kind, NodeSubKind::Storage(keys) if keys.iter().any(|k| k == key)))
            .map(|(id, s)| (s.conn, id.clone()))
            .collect();
        let change_set = state.change_set(&[key.to_string()]);
        for (conn, id) in targets {
            state.notify(conn, "state_storage", &id, change_set.clone());
        }
    }

    /// Swap the runtime and announce the new version to watchers.
    pub fn upgrade_runtime(&self, metadata: &Metadata, spec_version: u32) {
        let mut state = self.state.lock();
        state.metadata_hex = metadata.to_hex();
        state.spec_version = spec_version;
        let version = state.runtime_version();
        let targets: Vec<(u64, String)> = state
            .subscriptions
            .iter()
            .filter(|(_, s)| matches!(s.kind, NodeSubKind::RuntimeVersion))
            .map(|(id, s)| (s.conn, id.clone()))
            .collect();
        for (conn, id) in targets {
            state.notify(conn, "state_runtimeVersion", &id, version.clone());
        }
    }

    /// Refuse (or accept again) connections to `url`.
    pub fn set_refused(&self, url: &str, refused: bool) {
        let mut state = self.state.lock();
        if refused {
            state.refused.insert(url.to_string());
        } else {
            state.refused.remove(url);
        }
    }

    /// Never answer `method`.
    pub fn silence(&self, method: &str) {
        self.state.lock().silent.insert(method.to_string());
    }

    /// Answer `method` with an RPC error object.
    pub fn fail_method(&self, method: &str, code: i64, message: &str) {
        self.state
            .lock()
            .errors
            .insert(method.to_string(), (code, message.to_string()));
    }

    /// Drop every open socket from the server side.
    pub fn drop_connections(&self) {
        let mut state = self.state.lock();
        state.connections.clear();
        state.subscriptions.clear();
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Open `state_subscribeStorage` subscriptions across all sockets.
    pub fn storage_subscriptions(&self) -> usize {
        self.state
            .lock()
            .subscriptions
            .values()
            .filter(|s| matches!(s.kind, NodeSubKind::Storage(_)))
            .count()
    }

    pub fn calls_to(&self, method: &str) -> usize {
        self.state.lock().calls.iter().filter(|m| *m == method).count()
    }

    /// URLs successfully connected to, in order.
    pub fn connect_log(&self) -> Vec<String> {
        self.state.lock().opened.clone()
    }
}

#[async_trait]
impl SocketConnector for MockSubstrateNode {
    async fn open(&self, url: &str) -> Result<Socket, ConnectorError> {
        let (client_tx, mut client_rx) = mpsc::unbounded_channel::<String>();
        let (server_tx, server_rx) = mpsc::unbounded_channel::<String>();

        let conn = {
            let mut state = self.state.lock();
            if state.refused.contains(url) {
                return Err(ConnectorError::Transport(format!("{url}: connection refused")));
            }
            state.next_conn += 1;
            let conn = state.next_conn;
            state.connections.insert(conn, server_tx);
            state.opened.push(url.to_string());
            conn
        };

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(text) = client_rx.recv().await {
                state.lock().handle(conn, &text);
            }
            state.lock().close(conn);
        });

        Ok(Socket {
            tx: client_tx,
            rx: server_rx,
        })
    }
}

// ---------------------------------------------------------------------------
// EVM HTTP
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EvmState {
    balances: HashMap<String, U256>,
    erc20: HashMap<(String, String), U256>,
    raw_calls: HashMap<String, String>,
    rpc_errors: HashMap<String, (i64, String)>,
    down: HashSet<String>,
    hits: HashMap<String, usize>,
    calls: HashMap<String, usize>,
}

/// An [`HttpTransport`] answering `eth_getBalance`, `eth_call`
/// (`balanceOf` only) and `eth_chainId` from in-memory balances.
#[derive(Clone, Default)]
pub struct MockEvmHttp {
    state: Arc<Mutex<EvmState>>,
}

impl MockEvmHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, address: &str, amount: U256) {
        self.state.lock().balances.insert(address.to_lowercase(), amount);
    }

    pub fn set_erc20_balance(&self, contract: &str, owner: &str, amount: U256) {
        self.state
            .lock()
            .erc20
            .insert((contract.to_lowercase(), owner.to_lowercase()), amount);
    }

    /// Return `result` verbatim for any `eth_call` to `contract`.
    pub fn set_raw_call_result(&self, contract: &str, result: &str) {
        self.state
            .lock()
            .raw_calls
            .insert(contract.to_lowercase(), result.to_string());
    }

    pub fn set_rpc_error(&self, method: &str, code: i64, message: &str) {
        self.state
            .lock()
            .rpc_errors
            .insert(method.to_string(), (code, message.to_string()));
    }

    pub fn set_down(&self, url: &str, down: bool) {
        let mut state = self.state.lock();
        if down {
            state.down.insert(url.to_string());
        } else {
            state.down.remove(url);
        }
    }

    /// Requests that reached `url`, failed ones included.
    pub fn hits(&self, url: &str) -> usize {
        self.state.lock().hits.get(url).copied().unwrap_or(0)
    }

    /// Requests for `method` that reached a live endpoint.
    pub fn calls_to(&self, method: &str) -> usize {
        self.state.lock().calls.get(method).copied().unwrap_or(0)
    }
}

fn word(amount: U256) -> String {
    let mut bytes = [0u8; 32];
    amount.to_big_endian(&mut bytes);
    format!("0x{}", hex::encode(bytes))
}

#[async_trait]
impl HttpTransport for MockEvmHttp {
    async fn post(&self, url: &str, body: &Value) -> Result<Value, ConnectorError> {
        let mut state = self.state.lock();
        *state.hits.entry(url.to_string()).or_default() += 1;
        if state.down.contains(url) {
            return Err(ConnectorError::Transport(format!("{url}: connection refused")));
        }

        let id = body.get("id").cloned().unwrap_or(Value::Null);
        let method = body.get("method").and_then(Value::as_str).unwrap_or_default();
        let params = body.get("params").cloned().unwrap_or(Value::Null);
        *state.calls.entry(method.to_string()).or_default() += 1;

        if let Some((code, message)) = state.rpc_errors.get(method) {
            return Ok(json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } }));
        }

        let result = match method {
            "eth_chainId" => json!("0x1"),
            "eth_getBalance" => {
                let address = params[0].as_str().unwrap_or_default().to_lowercase();
                let amount = state.balances.get(&address).copied().unwrap_or_default();
                json!(format!("{amount:#x}"))
            }
            "eth_call" => {
                let to = params[0]["to"].as_str().unwrap_or_default().to_lowercase();
                let data = params[0]["data"].as_str().unwrap_or_default();
                match state.raw_calls.get(&to) {
                    Some(raw) => json!(raw),
                    None => {
                        let owner = format!("0x{}", &data[data.len().saturating_sub(40)..]).to_lowercase();
                        let amount = state.erc20.get(&(to, owner)).copied().unwrap_or_default();
                        json!(word(amount))
                    }
                }
            }
            _ => {
                return Ok(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32601, "message": "Method not found" },
                }));
            }
        };
        Ok(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
    }
}
