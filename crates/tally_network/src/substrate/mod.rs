//! Substrate connector: one pooled, multiplexed websocket per chain.

mod actor;
mod subscriptions;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tally_codec::Metadata;
use tally_core::{ChainRegistry, HealthStore, Unsubscribe};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::config::ConnectorConfig;
use crate::error::ConnectorError;
use crate::metadata_cache::MetadataCache;
use crate::transport::SocketConnector;
use actor::{ActorParts, ChainActor, Command, Outputs};

pub use subscriptions::{Listener, SubscriptionEvent};

/// Observable state of a chain's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

struct Slot {
    generation: u64,
    refs: usize,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    metadata: watch::Receiver<Option<Arc<Metadata>>>,
    wire_count: Arc<AtomicUsize>,
}

struct Inner {
    registry: Arc<ChainRegistry>,
    sockets: Arc<dyn SocketConnector>,
    health: Arc<dyn HealthStore>,
    metadata_cache: Arc<MetadataCache>,
    config: ConnectorConfig,
    slots: Mutex<HashMap<String, Slot>>,
    next_generation: AtomicU64,
    next_listener: AtomicU64,
}

impl Inner {
    fn release(&self, chain: &str, generation: u64) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(chain) else {
            return;
        };
        if slot.generation != generation {
            return;
        }
        slot.refs -= 1;
        if slot.refs == 0 {
            if let Some(slot) = slots.remove(chain) {
                debug!(chain, "Last handle dropped, closing connection");
                let _ = slot.commands.send(Command::Shutdown);
            }
        }
    }
}

/// Owns the per-chain connections. Cheap to clone.
#[derive(Clone)]
pub struct SubstrateConnector {
    inner: Arc<Inner>,
}

impl fmt::Debug for SubstrateConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubstrateConnector")
            .field("active_connections", &self.active_connections())
            .finish()
    }
}

impl SubstrateConnector {
    pub fn new(
        registry: Arc<ChainRegistry>,
        sockets: Arc<dyn SocketConnector>,
        health: Arc<dyn HealthStore>,
        config: ConnectorConfig,
    ) -> Self {
        Self::with_metadata_cache(registry, sockets, health, config, Arc::new(MetadataCache::new()))
    }

    pub fn with_metadata_cache(
        registry: Arc<ChainRegistry>,
        sockets: Arc<dyn SocketConnector>,
        health: Arc<dyn HealthStore>,
        config: ConnectorConfig,
        metadata_cache: Arc<MetadataCache>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                sockets,
                health,
                metadata_cache,
                config,
                slots: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn metadata_cache(&self) -> &Arc<MetadataCache> {
        &self.inner.metadata_cache
    }

    /// Take a reference on the chain's connection, starting it if needed.
    /// Does not wait for the socket to open. Must be called inside a Tokio
    /// runtime.
    pub fn acquire(&self, chain: &str) -> Result<ConnectionHandle, ConnectorError> {
        let mut slots = self.inner.slots.lock();
        if let Some(slot) = slots.get_mut(chain) {
            if !slot.commands.is_closed() {
                slot.refs += 1;
                return Ok(self.handle(chain, slot));
            }
        }

        let info = self
            .inner
            .registry
            .chain(chain)
            .ok_or_else(|| ConnectorError::Config(format!("Unknown chain: {chain}")))?;
        if info.chain.is_evm() {
            return Err(ConnectorError::Config(format!("{chain} is not a Substrate chain")));
        }
        if info.rpcs.is_empty() {
            return Err(ConnectorError::NoEndpoints(chain.to_string()));
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ConnectionStatus::Connecting);
        let (metadata_tx, metadata) = watch::channel(None);
        let wire_count = Arc::new(AtomicUsize::new(0));

        let actor = ChainActor::new(ActorParts {
            chain: chain.to_string(),
            endpoints: info.rpcs.clone(),
            sockets: Arc::clone(&self.inner.sockets),
            health: Arc::clone(&self.inner.health),
            metadata_cache: Arc::clone(&self.inner.metadata_cache),
            config: self.inner.config.clone(),
            commands: command_rx,
            outputs: Outputs {
                status: status_tx,
                metadata: metadata_tx,
                wire_count: Arc::clone(&wire_count),
            },
        });
        tokio::spawn(actor.run());
        debug!(chain, endpoints = info.rpcs.len(), "Connection actor started");

        let slot = Slot {
            generation: self.inner.next_generation.fetch_add(1, Ordering::Relaxed),
            refs: 1,
            commands,
            status,
            metadata,
            wire_count,
        };
        let handle = self.handle(chain, &slot);
        slots.insert(chain.to_string(), slot);
        Ok(handle)
    }

    fn handle(&self, chain: &str, slot: &Slot) -> ConnectionHandle {
        ConnectionHandle {
            chain: chain.to_string(),
            generation: slot.generation,
            commands: slot.commands.clone(),
            status: slot.status.clone(),
            metadata: slot.metadata.clone(),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Acquire the chain's connection and wait until its socket is open.
    pub async fn connect(&self, chain: &str) -> Result<ConnectionHandle, ConnectorError> {
        let handle = self.acquire(chain)?;
        handle.wait_connected().await?;
        Ok(handle)
    }

    /// One request on the chain's shared socket.
    pub async fn send(&self, chain: &str, method: &str, params: Value) -> Result<Value, ConnectorError> {
        self.acquire(chain)?.send(method, params).await
    }

    /// Subscribe on the chain's shared socket. The returned handle keeps the
    /// connection alive until cancelled.
    pub fn subscribe(
        &self,
        chain: &str,
        method: &str,
        params: Value,
        on_update: impl Fn(SubscriptionEvent) + Send + Sync + 'static,
    ) -> Result<Unsubscribe, ConnectorError> {
        self.acquire(chain)?.subscribe(method, params, on_update)
    }

    /// Current runtime metadata for a chain, connecting if necessary.
    pub async fn metadata(&self, chain: &str) -> Result<Arc<Metadata>, ConnectorError> {
        self.acquire(chain)?.metadata().await
    }

    pub fn status(&self, chain: &str) -> ConnectionStatus {
        self.inner
            .slots
            .lock()
            .get(chain)
            .map(|slot| *slot.status.borrow())
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    /// Chains with a live connection actor.
    pub fn active_connections(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// Wire subscriptions the chain's connection currently holds, not
    /// counting its internal runtime-version watch.
    pub fn wire_subscription_count(&self, chain: &str) -> usize {
        self.inner
            .slots
            .lock()
            .get(chain)
            .map(|slot| slot.wire_count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// A counted reference to one chain's connection. The connection closes
/// when the last handle (including those held by subscriptions) drops.
pub struct ConnectionHandle {
    chain: String,
    generation: u64,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    metadata: watch::Receiver<Option<Arc<Metadata>>>,
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("chain", &self.chain)
            .field("status", &self.status())
            .finish()
    }
}

impl Clone for ConnectionHandle {
    fn clone(&self) -> Self {
        if let Some(slot) = self.inner.slots.lock().get_mut(&self.chain) {
            if slot.generation == self.generation {
                slot.refs += 1;
            }
        }
        Self {
            chain: self.chain.clone(),
            generation: self.generation,
            commands: self.commands.clone(),
            status: self.status.clone(),
            metadata: self.metadata.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.inner.release(&self.chain, self.generation);
    }
}

impl ConnectionHandle {
    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn status_updates(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Runtime metadata as it changes; `None` until first fetched.
    pub fn metadata_updates(&self) -> watch::Receiver<Option<Arc<Metadata>>> {
        self.metadata.clone()
    }

    pub fn current_metadata(&self) -> Option<Arc<Metadata>> {
        self.metadata.borrow().clone()
    }

    /// Wait for the socket to open, at most `request_timeout`. Fails early if
    /// the connection gives up.
    pub async fn wait_connected(&self) -> Result<(), ConnectorError> {
        let limit = self.inner.config.request_timeout;
        let mut status = self.status.clone();
        let waited = tokio::time::timeout(limit, async {
            let current = status
                .wait_for(|s| matches!(s, ConnectionStatus::Connected | ConnectionStatus::Disconnected))
                .await
                .map_err(|_| ConnectorError::Closed)?;
            Ok::<_, ConnectorError>(*current == ConnectionStatus::Connected)
        })
        .await;
        let connected = match waited {
            Ok(result) => result?,
            Err(_) => {
                debug!(chain = %self.chain, "Gave up waiting for a connection");
                return Err(ConnectorError::Timeout(limit));
            }
        };
        if connected {
            Ok(())
        } else {
            Err(ConnectorError::AllEndpointsFailed(self.chain.clone()))
        }
    }

    pub async fn send(&self, method: &str, params: Value) -> Result<Value, ConnectorError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Request {
                method: method.to_string(),
                params,
                reply,
            })
            .map_err(|_| ConnectorError::Closed)?;
        response.await.map_err(|_| ConnectorError::Closed)?
    }

    /// Register a listener for a wire subscription. Identical
    /// `(method, params)` pairs share one server-side subscription.
    pub fn subscribe(
        &self,
        method: &str,
        params: Value,
        on_update: impl Fn(SubscriptionEvent) + Send + Sync + 'static,
    ) -> Result<Unsubscribe, ConnectorError> {
        let listener = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.commands
            .send(Command::Subscribe {
                listener,
                method: method.to_string(),
                params,
                sink: Arc::new(on_update),
            })
            .map_err(|_| ConnectorError::Closed)?;

        let handle = self.clone();
        Ok(Unsubscribe::new(move || {
            let _ = handle.commands.send(Command::Unsubscribe { listener });
            drop(handle);
        }))
    }

    /// Wait for the chain's runtime metadata.
    pub async fn metadata(&self) -> Result<Arc<Metadata>, ConnectorError> {
        let wait = self.inner.config.request_timeout + self.inner.config.connect_timeout;
        let mut metadata = self.metadata.clone();
        let result = tokio::time::timeout(wait, async {
            let current = metadata
                .wait_for(Option::is_some)
                .await
                .map_err(|_| ConnectorError::Closed)?;
            (*current).clone().ok_or(ConnectorError::Closed)
        })
        .await;
        result.unwrap_or(Err(ConnectorError::Timeout(wait)))
    }
}

#[cfg(test)]
mod tests;
