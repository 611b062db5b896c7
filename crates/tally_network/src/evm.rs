//! EVM connector: JSON-RPC over HTTP with endpoint failover, and a
//! deduplicated poller standing in for push subscriptions.
//!
//! A poll cycles `Scheduled → InFlight → Scheduled`. A failed round moves it
//! to `Idle` for a backoff delay before the next attempt; only cancelling the
//! last listener stops it. A shared loop runs at the shortest interval any of
//! its listeners asked for.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tally_core::{Backoff, ChainRegistry, HealthStore, Unsubscribe};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ConnectorConfig;
use crate::error::ConnectorError;
use crate::jsonrpc;

/// Posts one JSON-RPC body to an endpoint and returns the response object.
#[async_trait]
pub trait HttpTransport: Send + Sync + 'static {
    async fn post(&self, url: &str, body: &Value) -> Result<Value, ConnectorError>;
}

/// [`HttpTransport`] over `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post(&self, url: &str, body: &Value) -> Result<Value, ConnectorError> {
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| ConnectorError::Transport(format!("POST {url}: {e}")))?;

        if !resp.status().is_success() {
            return Err(ConnectorError::Transport(format!("{url} returned HTTP {}", resp.status())));
        }

        resp.json()
            .await
            .map_err(|e| ConnectorError::InvalidResponse(format!("Failed to parse response: {e}")))
    }
}

/// Where a poll loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Scheduled,
    InFlight,
}

type PollListener = Arc<dyn Fn(Result<Value, ConnectorError>) + Send + Sync>;

struct PollShared {
    listeners: Mutex<BTreeMap<u64, PollListener>>,
    intervals: Mutex<BTreeMap<u64, Duration>>,
    /// Wakes a sleeping loop when a faster listener joins.
    reschedule: Notify,
    last: Mutex<Option<Value>>,
    state: Mutex<PollState>,
}

impl PollShared {
    fn interval(&self) -> Duration {
        self.intervals
            .lock()
            .values()
            .min()
            .copied()
            .unwrap_or(Duration::from_secs(1))
    }

    fn emit(&self, result: Result<Value, ConnectorError>) {
        let listeners: Vec<PollListener> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(result.clone());
        }
    }

    fn set_state(&self, state: PollState) {
        *self.state.lock() = state;
    }
}

struct PollEntry {
    shared: Arc<PollShared>,
    task: JoinHandle<()>,
}

struct Inner {
    registry: Arc<ChainRegistry>,
    http: Arc<dyn HttpTransport>,
    health: Arc<dyn HealthStore>,
    config: ConnectorConfig,
    next_id: AtomicU64,
    next_listener: AtomicU64,
    polls: Mutex<HashMap<String, PollEntry>>,
}

impl Inner {
    fn remove_listener(&self, key: &str, listener_id: u64) {
        let mut polls = self.polls.lock();
        let Some(entry) = polls.get(key) else {
            return;
        };
        entry.shared.intervals.lock().remove(&listener_id);
        let empty = {
            let mut listeners = entry.shared.listeners.lock();
            listeners.remove(&listener_id);
            listeners.is_empty()
        };
        if empty {
            if let Some(entry) = polls.remove(key) {
                entry.task.abort();
                debug!(poll = key, "Poll stopped");
            }
        }
    }
}

/// JSON-RPC client for EVM networks. Cheap to clone.
#[derive(Clone)]
pub struct EvmConnector {
    inner: Arc<Inner>,
}

impl fmt::Debug for EvmConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvmConnector")
            .field("active_polls", &self.active_polls())
            .finish()
    }
}

impl EvmConnector {
    pub fn new(
        registry: Arc<ChainRegistry>,
        http: Arc<dyn HttpTransport>,
        health: Arc<dyn HealthStore>,
        config: ConnectorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                http,
                health,
                config,
                next_id: AtomicU64::new(1),
                next_listener: AtomicU64::new(1),
                polls: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn endpoints(&self, network: &str) -> Result<Vec<String>, ConnectorError> {
        let info = self
            .inner
            .registry
            .chain(network)
            .ok_or_else(|| ConnectorError::Config(format!("Unknown network: {network}")))?;
        if !info.chain.is_evm() {
            return Err(ConnectorError::Config(format!("{network} is not an EVM network")));
        }
        if info.rpcs.is_empty() {
            return Err(ConnectorError::NoEndpoints(network.to_string()));
        }
        Ok(info.rpcs.clone())
    }

    /// Call `method` on the healthiest endpoint, failing over on transport
    /// errors. An RPC error object is the node's answer and is returned
    /// as-is.
    pub async fn call(&self, network: &str, method: &str, params: Value) -> Result<Value, ConnectorError> {
        let endpoints = self.endpoints(network)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let body = jsonrpc::request_body(id, method, &params);
        let timeout = self.inner.config.request_timeout;

        for url in self.inner.health.rank(&endpoints) {
            let started = Instant::now();
            let reason = match tokio::time::timeout(timeout, self.inner.http.post(&url, &body)).await {
                Ok(Ok(response)) => match jsonrpc::response_result(&response) {
                    Err(ConnectorError::InvalidResponse(e)) => e,
                    result => {
                        self.inner.health.record_success(&url, started.elapsed());
                        return result;
                    }
                },
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {timeout:?}"),
            };
            warn!(network, endpoint = %url, method, "Request failed: {reason}");
            self.inner.health.record_failure(&url, &reason);
        }
        Err(ConnectorError::AllEndpointsFailed(network.to_string()))
    }

    /// Poll `method` every `interval`, reporting results that differ from
    /// the previous one and every error. Identical polls share one loop; a
    /// late joiner receives the last result immediately.
    pub fn poll(
        &self,
        network: &str,
        method: &str,
        params: Value,
        interval: Duration,
        on_result: impl Fn(Result<Value, ConnectorError>) + Send + Sync + 'static,
    ) -> Result<Unsubscribe, ConnectorError> {
        self.endpoints(network)?;
        let key = poll_key(network, method, &params);
        let listener_id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let listener: PollListener = Arc::new(on_result);

        let replay = {
            let mut polls = self.inner.polls.lock();
            match polls.get(&key) {
                Some(entry) => {
                    let faster = interval < entry.shared.interval();
                    entry.shared.listeners.lock().insert(listener_id, Arc::clone(&listener));
                    entry.shared.intervals.lock().insert(listener_id, interval);
                    if faster {
                        debug!(poll = %key, interval_ms = interval.as_millis() as u64, "Poll interval shortened");
                        entry.shared.reschedule.notify_one();
                    }
                    entry.shared.last.lock().clone()
                }
                None => {
                    let shared = Arc::new(PollShared {
                        listeners: Mutex::new(BTreeMap::from([(listener_id, Arc::clone(&listener))])),
                        intervals: Mutex::new(BTreeMap::from([(listener_id, interval)])),
                        reschedule: Notify::new(),
                        last: Mutex::new(None),
                        state: Mutex::new(PollState::Scheduled),
                    });
                    let task = tokio::spawn(poll_loop(
                        self.clone(),
                        network.to_string(),
                        method.to_string(),
                        params,
                        Arc::clone(&shared),
                    ));
                    debug!(poll = %key, interval_ms = interval.as_millis() as u64, "Poll started");
                    polls.insert(key.clone(), PollEntry { shared, task });
                    None
                }
            }
        };
        if let Some(value) = replay {
            listener(Ok(value));
        }

        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        Ok(Unsubscribe::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.remove_listener(&key, listener_id);
            }
        }))
    }

    pub fn poll_state(&self, network: &str, method: &str, params: &Value) -> Option<PollState> {
        self.inner
            .polls
            .lock()
            .get(&poll_key(network, method, params))
            .map(|entry| *entry.shared.state.lock())
    }

    /// Distinct poll loops running.
    pub fn active_polls(&self) -> usize {
        self.inner.polls.lock().len()
    }
}

fn poll_key(network: &str, method: &str, params: &Value) -> String {
    format!("{network}/{}", jsonrpc::signature(method, params))
}

async fn poll_loop(
    connector: EvmConnector,
    network: String,
    method: String,
    params: Value,
    shared: Arc<PollShared>,
) {
    let mut backoff = Backoff::new(connector.inner.config.backoff.clone());
    loop {
        shared.set_state(PollState::InFlight);
        let started = Instant::now();
        let (delay, backing_off) = match connector.call(&network, &method, params.clone()).await {
            Ok(value) => {
                backoff.reset();
                let changed = {
                    let mut last = shared.last.lock();
                    if last.as_ref() == Some(&value) {
                        false
                    } else {
                        *last = Some(value.clone());
                        true
                    }
                };
                if changed {
                    shared.emit(Ok(value));
                }
                shared.set_state(PollState::Scheduled);
                (shared.interval(), false)
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    network = %network,
                    method = %method,
                    retry_ms = delay.as_millis() as u64,
                    "Poll failed: {e}"
                );
                // Force the next success through so listeners can recover.
                *shared.last.lock() = None;
                shared.emit(Err(e));
                shared.set_state(PollState::Idle);
                (delay, true)
            }
        };
        let mut deadline = started + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = shared.reschedule.notified() => {
                    if !backing_off {
                        deadline = deadline.min(started + shared.interval());
                    }
                }
            }
        }
    }
}
