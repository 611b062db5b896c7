//! The per-chain connection actor.
//!
//! One task owns the socket for a chain. Callers reach it only through the
//! command channel; responses travel back on oneshot channels and
//! subscription notifications through listener callbacks.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tally_codec::Metadata;
use tally_core::{Backoff, HealthStore};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::ConnectionStatus;
use super::subscriptions::{Confirm, Listener, WireSubscriptions};
use crate::config::ConnectorConfig;
use crate::error::ConnectorError;
use crate::jsonrpc::{self, Incoming};
use crate::metadata_cache::MetadataCache;
use crate::transport::{Socket, SocketConnector};

/// Granularity of request deadline checks.
const TICK: Duration = Duration::from_millis(100);

pub(crate) type Reply = oneshot::Sender<Result<Value, ConnectorError>>;

pub(crate) enum Command {
    Request {
        method: String,
        params: Value,
        reply: Reply,
    },
    Subscribe {
        listener: u64,
        method: String,
        params: Value,
        sink: Listener,
    },
    Unsubscribe {
        listener: u64,
    },
    Shutdown,
}

enum PendingKind {
    Call(Reply),
    Subscribe { key: String },
    /// A subscribe attempt that timed out; if it is ever answered the id is
    /// released straight away.
    Abandoned,
    Unsubscribe,
    RuntimeSubscribe,
    RuntimeVersion,
    Metadata { spec_version: u32 },
}

struct Pending {
    method: String,
    kind: PendingKind,
    deadline: Instant,
}

struct Queued {
    method: String,
    params: Value,
    reply: Reply,
    deadline: Instant,
}

enum Cycle {
    Connected(String, Socket),
    Exhausted,
    Shutdown,
}

enum Exit {
    Shutdown,
    Disconnected(String),
}

/// Channels the actor publishes on.
pub(crate) struct Outputs {
    pub status: watch::Sender<ConnectionStatus>,
    pub metadata: watch::Sender<Option<Arc<Metadata>>>,
    pub wire_count: Arc<AtomicUsize>,
}

/// Everything a chain actor is built from.
pub(crate) struct ActorParts {
    pub chain: String,
    pub endpoints: Vec<String>,
    pub sockets: Arc<dyn SocketConnector>,
    pub health: Arc<dyn HealthStore>,
    pub metadata_cache: Arc<MetadataCache>,
    pub config: ConnectorConfig,
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub outputs: Outputs,
}

pub(crate) struct ChainActor {
    chain: String,
    endpoints: Vec<String>,
    sockets: Arc<dyn SocketConnector>,
    health: Arc<dyn HealthStore>,
    metadata_cache: Arc<MetadataCache>,
    config: ConnectorConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    outputs: Outputs,

    out: Option<mpsc::UnboundedSender<String>>,
    next_id: u64,
    pending: HashMap<u64, Pending>,
    queue: VecDeque<Queued>,
    subs: WireSubscriptions,
    runtime_sub: Option<String>,
    spec_version: Option<u32>,
    fetching: Option<u32>,
}

impl ChainActor {
    pub fn new(parts: ActorParts) -> Self {
        Self {
            chain: parts.chain,
            endpoints: parts.endpoints,
            sockets: parts.sockets,
            health: parts.health,
            metadata_cache: parts.metadata_cache,
            config: parts.config,
            commands: parts.commands,
            outputs: parts.outputs,
            out: None,
            next_id: 0,
            pending: HashMap::new(),
            queue: VecDeque::new(),
            subs: WireSubscriptions::default(),
            runtime_sub: None,
            spec_version: None,
            fetching: None,
        }
    }

    pub async fn run(mut self) {
        let mut backoff = Backoff::new(self.config.backoff.clone());
        let mut cycles: u32 = 0;
        let mut ever_connected = false;

        let failure = loop {
            self.set_status(if ever_connected {
                ConnectionStatus::Reconnecting
            } else {
                ConnectionStatus::Connecting
            });

            match self.connect_cycle().await {
                Cycle::Shutdown => break None,
                Cycle::Connected(url, socket) => {
                    ever_connected = true;
                    cycles = 0;
                    backoff.reset();
                    match self.serve(socket).await {
                        Exit::Shutdown => break None,
                        Exit::Disconnected(reason) => {
                            warn!(chain = %self.chain, endpoint = %url, "Connection lost: {reason}");
                            self.health.record_failure(&url, &reason);
                            self.on_disconnect();
                        }
                    }
                }
                Cycle::Exhausted => {
                    cycles += 1;
                    if self.config.max_endpoint_cycles.is_some_and(|max| cycles >= max) {
                        error!(chain = %self.chain, cycles, "All endpoints failed, giving up");
                        break Some(ConnectorError::AllEndpointsFailed(self.chain.clone()));
                    }
                    let delay = backoff.next_delay();
                    info!(
                        chain = %self.chain,
                        cycle = cycles,
                        delay_ms = delay.as_millis() as u64,
                        "All endpoints failed, backing off"
                    );
                    if self.idle_until(tokio::time::sleep(delay)).await.is_none() {
                        break None;
                    }
                }
            }
        };

        self.finish(failure);
    }

    /// Try every endpoint once, best-ranked first.
    async fn connect_cycle(&mut self) -> Cycle {
        for url in self.health.rank(&self.endpoints) {
            let sockets = Arc::clone(&self.sockets);
            let timeout = self.config.connect_timeout;
            let target = url.clone();
            let started = Instant::now();
            let attempt = async move { tokio::time::timeout(timeout, sockets.open(&target)).await };

            let Some(result) = self.idle_until(attempt).await else {
                return Cycle::Shutdown;
            };
            match result {
                Ok(Ok(socket)) => {
                    self.health.record_success(&url, started.elapsed());
                    info!(chain = %self.chain, endpoint = %url, "Connected");
                    return Cycle::Connected(url, socket);
                }
                Ok(Err(e)) => {
                    warn!(chain = %self.chain, endpoint = %url, "Connect failed: {e}");
                    self.health.record_failure(&url, &e.to_string());
                }
                Err(_) => {
                    warn!(chain = %self.chain, endpoint = %url, "Connect timed out");
                    self.health.record_failure(&url, "connect timed out");
                }
            }
        }
        Cycle::Exhausted
    }

    /// Drive `fut` while still accepting commands. `None` means shutdown was
    /// requested first.
    async fn idle_until<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        let mut tick = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                out = &mut fut => return Some(out),
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        if !self.on_command(cmd) {
                            return None;
                        }
                    }
                    None => return None,
                },
                _ = tick.tick() => self.expire(),
            }
        }
    }

    async fn serve(&mut self, socket: Socket) -> Exit {
        let Socket { tx, mut rx } = socket;
        self.out = Some(tx);
        self.set_status(ConnectionStatus::Connected);
        self.on_connected();

        let mut tick = tokio::time::interval(TICK);
        let exit = loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        if !self.on_command(cmd) {
                            break Exit::Shutdown;
                        }
                    }
                    None => break Exit::Shutdown,
                },
                frame = rx.recv() => match frame {
                    Some(text) => self.on_frame(&text),
                    None => break Exit::Disconnected("socket closed".into()),
                },
                _ = tick.tick() => self.expire(),
            }
        };
        self.out = None;
        exit
    }

    // ── Commands ─────────────────────────────────────────────────────────

    /// Returns false on shutdown.
    fn on_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Request { method, params, reply } => {
                let deadline = Instant::now() + self.config.request_timeout;
                if self.out.is_some() {
                    self.issue_at(&method, params, PendingKind::Call(reply), deadline);
                } else {
                    debug!(chain = %self.chain, method = %method, "Queueing request until connected");
                    self.queue.push_back(Queued {
                        method,
                        params,
                        reply,
                        deadline,
                    });
                }
            }
            Command::Subscribe {
                listener,
                method,
                params,
                sink,
            } => {
                if let Some(key) = self.subs.add(listener, &method, params, sink) {
                    if self.out.is_some() {
                        self.send_subscribe(&key);
                    }
                }
                self.publish_wire_count();
            }
            Command::Unsubscribe { listener } => {
                if let Some(removed) = self.subs.remove(listener) {
                    if let Some(server_id) = removed.server_id {
                        self.send_unsubscribe(&removed.method, server_id);
                    }
                }
                self.publish_wire_count();
            }
            Command::Shutdown => return false,
        }
        true
    }

    // ── Outgoing frames ──────────────────────────────────────────────────

    fn issue(&mut self, method: &str, params: Value, kind: PendingKind) -> u64 {
        let deadline = Instant::now() + self.config.request_timeout;
        self.issue_at(method, params, kind, deadline)
    }

    /// Send a request and remember it. If the writer is already gone the
    /// entry is failed by the disconnect that follows.
    fn issue_at(&mut self, method: &str, params: Value, kind: PendingKind, deadline: Instant) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        if let Some(out) = &self.out {
            trace!(chain = %self.chain, id, method, "->");
            if out.send(jsonrpc::request(id, method, &params)).is_err() {
                debug!(chain = %self.chain, id, "Writer closed before send");
            }
        }
        self.pending.insert(
            id,
            Pending {
                method: method.to_string(),
                kind,
                deadline,
            },
        );
        id
    }

    fn send_subscribe(&mut self, key: &str) {
        let Some((method, params)) = self.subs.request(key) else {
            return;
        };
        let id = self.issue(
            &method,
            params,
            PendingKind::Subscribe {
                key: key.to_string(),
            },
        );
        self.subs.mark_sent(key, id);
    }

    fn send_unsubscribe(&mut self, subscribe_method: &str, server_id: String) {
        if self.out.is_none() {
            return;
        }
        let method = jsonrpc::unsubscribe_method(subscribe_method);
        debug!(chain = %self.chain, method = %method, id = %server_id, "Closing wire subscription");
        self.issue(&method, json!([server_id]), PendingKind::Unsubscribe);
    }

    fn on_connected(&mut self) {
        self.runtime_sub = None;
        self.issue("state_subscribeRuntimeVersion", json!([]), PendingKind::RuntimeSubscribe);
        self.issue("state_getRuntimeVersion", json!([]), PendingKind::RuntimeVersion);

        let keys = self.subs.unsent_keys();
        if !keys.is_empty() {
            info!(chain = %self.chain, count = keys.len(), "Reissuing wire subscriptions");
        }
        for key in keys {
            self.send_subscribe(&key);
        }

        while let Some(q) = self.queue.pop_front() {
            self.issue_at(&q.method, q.params, PendingKind::Call(q.reply), q.deadline);
        }
    }

    // ── Incoming frames ──────────────────────────────────────────────────

    fn on_frame(&mut self, text: &str) {
        match jsonrpc::parse(text) {
            Ok(Incoming::Response { id, result }) => self.on_response(id, result),
            Ok(Incoming::Notification {
                subscription,
                result,
            }) => {
                if self.runtime_sub.as_deref() == Some(subscription.as_str()) {
                    self.on_runtime_version(&result);
                } else {
                    self.subs.route(&subscription, result);
                }
            }
            Err(e) => warn!(chain = %self.chain, "Ignoring frame: {e}"),
        }
    }

    fn on_response(&mut self, id: u64, result: Result<Value, ConnectorError>) {
        let Some(pending) = self.pending.remove(&id) else {
            debug!(chain = %self.chain, id, "Response for unknown or expired request");
            return;
        };
        trace!(chain = %self.chain, id, method = %pending.method, "<-");

        match pending.kind {
            PendingKind::Call(reply) => {
                let _ = reply.send(result);
            }
            PendingKind::Subscribe { key } => {
                let server_id = result.and_then(|v| {
                    jsonrpc::subscription_id(&v).ok_or_else(|| {
                        ConnectorError::InvalidResponse(format!("subscription id {v}"))
                    })
                });
                match server_id {
                    Ok(server_id) => {
                        if self.subs.confirm(&key, id, server_id.clone()) == Confirm::Orphan {
                            self.send_unsubscribe(&pending.method, server_id);
                        }
                    }
                    Err(e) => {
                        warn!(chain = %self.chain, method = %pending.method, "Subscription rejected: {e}");
                        self.subs.reject(&key, id, e);
                        self.publish_wire_count();
                    }
                }
            }
            PendingKind::Abandoned => {
                if let Some(server_id) = result.ok().as_ref().and_then(jsonrpc::subscription_id) {
                    self.send_unsubscribe(&pending.method, server_id);
                }
            }
            PendingKind::Unsubscribe => {
                if let Err(e) = result {
                    debug!(chain = %self.chain, "Unsubscribe failed: {e}");
                }
            }
            PendingKind::RuntimeSubscribe => match result.map(|v| jsonrpc::subscription_id(&v)) {
                Ok(Some(server_id)) => {
                    let buffered = self.subs.take_early(&server_id);
                    self.runtime_sub = Some(server_id);
                    for version in buffered {
                        self.on_runtime_version(&version);
                    }
                }
                Ok(None) => warn!(chain = %self.chain, "Runtime version subscription returned no id"),
                Err(e) => warn!(chain = %self.chain, "Runtime version subscription failed: {e}"),
            },
            PendingKind::RuntimeVersion => match result {
                Ok(version) => self.on_runtime_version(&version),
                Err(e) => warn!(chain = %self.chain, "state_getRuntimeVersion failed: {e}"),
            },
            PendingKind::Metadata { spec_version } => {
                if self.fetching != Some(spec_version) {
                    debug!(chain = %self.chain, spec_version, "Discarding superseded metadata");
                    return;
                }
                self.fetching = None;
                let parsed = result.and_then(|v| {
                    let hex = v
                        .as_str()
                        .ok_or_else(|| ConnectorError::InvalidResponse("metadata is not a string".into()))?;
                    Metadata::from_hex(hex).map_err(ConnectorError::from)
                });
                match parsed {
                    Ok(metadata) => self.install_metadata(spec_version, Arc::new(metadata)),
                    Err(e) => error!(chain = %self.chain, spec_version, "Runtime metadata unusable: {e}"),
                }
            }
        }
    }

    // ── Runtime metadata ─────────────────────────────────────────────────

    fn on_runtime_version(&mut self, version: &Value) {
        let Some(spec_version) = version
            .get("specVersion")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
        else {
            warn!(chain = %self.chain, "Runtime version without specVersion");
            return;
        };
        if self.spec_version == Some(spec_version) || self.fetching == Some(spec_version) {
            return;
        }
        if let Some(metadata) = self.metadata_cache.get(&self.chain, spec_version) {
            debug!(chain = %self.chain, spec_version, "Runtime metadata cached");
            self.install_metadata(spec_version, metadata);
            return;
        }
        info!(chain = %self.chain, spec_version, "Fetching runtime metadata");
        self.fetching = Some(spec_version);
        self.issue("state_getMetadata", json!([]), PendingKind::Metadata { spec_version });
    }

    fn install_metadata(&mut self, spec_version: u32, metadata: Arc<Metadata>) {
        if let Some(previous) = self.spec_version {
            info!(chain = %self.chain, from = previous, to = spec_version, "Runtime upgraded");
        }
        let metadata = self.metadata_cache.insert(&self.chain, spec_version, metadata);
        self.spec_version = Some(spec_version);
        self.outputs.metadata.send_replace(Some(metadata));
    }

    // ── Housekeeping ─────────────────────────────────────────────────────

    fn expire(&mut self) {
        let now = Instant::now();
        let timeout = self.config.request_timeout;

        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            let Some(pending) = self.pending.remove(&id) else {
                continue;
            };
            match pending.kind {
                PendingKind::Call(reply) => {
                    debug!(chain = %self.chain, id, method = %pending.method, "Request timed out");
                    let _ = reply.send(Err(ConnectorError::Timeout(timeout)));
                }
                PendingKind::Subscribe { key } => {
                    warn!(chain = %self.chain, method = %pending.method, "Subscribe timed out, retrying");
                    if self.subs.clear_sent(&key, id) {
                        self.pending.insert(
                            id,
                            Pending {
                                method: pending.method,
                                kind: PendingKind::Abandoned,
                                deadline: now + timeout * 4,
                            },
                        );
                        self.send_subscribe(&key);
                    }
                }
                PendingKind::Metadata { spec_version } => {
                    warn!(chain = %self.chain, spec_version, "Metadata fetch timed out");
                    if self.fetching == Some(spec_version) {
                        self.fetching = None;
                        self.issue("state_getRuntimeVersion", json!([]), PendingKind::RuntimeVersion);
                    }
                }
                PendingKind::RuntimeSubscribe | PendingKind::RuntimeVersion => {
                    warn!(chain = %self.chain, method = %pending.method, "Request timed out");
                }
                PendingKind::Abandoned | PendingKind::Unsubscribe => {}
            }
        }

        if self.queue.iter().any(|q| q.deadline <= now) {
            let (expired, kept): (VecDeque<Queued>, VecDeque<Queued>) =
                self.queue.drain(..).partition(|q| q.deadline <= now);
            self.queue = kept;
            for q in expired {
                debug!(chain = %self.chain, method = %q.method, "Queued request timed out");
                let _ = q.reply.send(Err(ConnectorError::Timeout(timeout)));
            }
        }
    }

    fn on_disconnect(&mut self) {
        for (_, pending) in self.pending.drain() {
            if let PendingKind::Call(reply) = pending.kind {
                let _ = reply.send(Err(ConnectorError::Transport("connection lost".into())));
            }
        }
        self.runtime_sub = None;
        self.fetching = None;
        self.subs.reset();
    }

    fn finish(&mut self, failure: Option<ConnectorError>) {
        let error = failure.clone().unwrap_or(ConnectorError::Closed);
        for (_, pending) in self.pending.drain() {
            if let PendingKind::Call(reply) = pending.kind {
                let _ = reply.send(Err(error.clone()));
            }
        }
        for q in self.queue.drain(..) {
            let _ = q.reply.send(Err(error.clone()));
        }
        self.subs.fail_all(&error);
        self.publish_wire_count();
        self.set_status(ConnectionStatus::Disconnected);
        match failure {
            Some(_) => info!(chain = %self.chain, "Connection actor stopped after failure"),
            None => debug!(chain = %self.chain, "Connection actor stopped"),
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.outputs.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn publish_wire_count(&self) {
        self.outputs.wire_count.store(self.subs.len(), Ordering::Relaxed);
    }
}
