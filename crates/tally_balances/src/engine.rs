//! Host-facing facade: builds the connectors and the orchestrator, restores
//! the cache and keeps it written.

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tally_core::{ChainRegistry, Database, EngineConfig, HealthStore, SqliteHealthStore, TokenRef, Unsubscribe};
use tally_network::{
    ConnectorConfig, EvmConnector, HttpTransport, ReqwestTransport, SocketConnector, SubstrateConnector,
    WsSocketConnector,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache_store::BalanceCacheStore;
use crate::collection::BalanceCollection;
use crate::error::BalanceError;
use crate::modules::{ModuleContext, ModuleRegistry};
use crate::orchestrator::Orchestrator;
use crate::record::{BalanceKey, BalanceRecord, BalanceStatus};

/// Collaborators the engine is built from.
pub struct EngineParts {
    pub registry: Arc<ChainRegistry>,
    pub sockets: Arc<dyn SocketConnector>,
    pub http: Arc<dyn HttpTransport>,
    pub health: Arc<dyn HealthStore>,
    pub cache: BalanceCacheStore,
    pub modules: ModuleRegistry,
}

pub struct BalanceEngine {
    orchestrator: Orchestrator,
    cache: BalanceCacheStore,
    tasks: Vec<JoinHandle<()>>,
}

impl BalanceEngine {
    /// Must be called inside a Tokio runtime.
    pub fn new(config: &EngineConfig, parts: EngineParts) -> Result<Self, BalanceError> {
        let connector_config = ConnectorConfig::from(config);
        let substrate = SubstrateConnector::new(
            Arc::clone(&parts.registry),
            parts.sockets,
            Arc::clone(&parts.health),
            connector_config.clone(),
        );
        let evm = EvmConnector::new(parts.registry, parts.http, parts.health, connector_config);
        let ctx = ModuleContext {
            substrate,
            evm,
            evm_poll_interval: config.evm_poll_interval(),
        };
        let orchestrator = Orchestrator::new(
            parts.modules,
            ctx,
            config.snapshot_channel_capacity,
            config.stale_after(),
        );

        let cached = parts
            .cache
            .load()
            .map_err(|e| BalanceError::Cache(format!("{e:#}")))?;
        info!(records = cached.len(), "Restored cached balances");
        orchestrator.seed(&cached);

        let tasks = vec![
            orchestrator.spawn_stale_sweep(),
            spawn_persist(orchestrator.subscribe_snapshots(), parts.cache.clone()),
        ];
        Ok(Self {
            orchestrator,
            cache: parts.cache,
            tasks,
        })
    }

    /// Production wiring: SQLite under the data directory, websocket and
    /// HTTPS transports, the built-in modules.
    pub fn open(config: &EngineConfig, registry: Arc<ChainRegistry>) -> Result<Self> {
        let db = Arc::new(Mutex::new(Database::open()?));
        let health = SqliteHealthStore::load(Arc::clone(&db)).context("Failed to load endpoint health")?;
        let parts = EngineParts {
            registry,
            sockets: Arc::new(WsSocketConnector),
            http: Arc::new(ReqwestTransport::new(config.request_timeout())),
            health: Arc::new(health),
            cache: BalanceCacheStore::new(db),
            modules: ModuleRegistry::with_defaults()?,
        };
        Ok(Self::new(config, parts)?)
    }

    /// Watch every address for every token. The receiver starts at the
    /// current snapshot and always holds the latest one.
    pub fn watch_balances(
        &self,
        addresses: &[String],
        tokens: &[TokenRef],
    ) -> Result<(Unsubscribe, watch::Receiver<Arc<BalanceCollection>>), BalanceError> {
        let receiver = self.orchestrator.subscribe_snapshots();
        let unsubscribe = self.orchestrator.watch(addresses, tokens)?;
        Ok((unsubscribe, receiver))
    }

    /// Every changed record, for consumers that need each update rather
    /// than the latest snapshot.
    pub fn updates(&self) -> broadcast::Receiver<BalanceRecord> {
        self.orchestrator.subscribe_updates()
    }

    /// What the cache store holds right now, all marked `cached`.
    pub fn get_cached_balances(&self) -> Result<BalanceCollection, BalanceError> {
        self.cache.load().map_err(|e| BalanceError::Cache(format!("{e:#}")))
    }

    /// Forget every cached balance.
    pub fn clear_cache(&self) -> Result<(), BalanceError> {
        self.cache.clear().map_err(|e| BalanceError::Cache(format!("{e:#}")))
    }

    /// Delete cached balances for tokens no longer in `registry` or for
    /// addresses outside `addresses`. Returns how many were deleted.
    pub fn prune_cache(&self, registry: &ChainRegistry, addresses: &[String]) -> Result<usize, BalanceError> {
        let known = |key: &BalanceKey| {
            registry.token(&key.token_id).is_some_and(|token| {
                addresses
                    .iter()
                    .any(|address| BalanceKey::for_token(token, address).address == key.address)
            })
        };
        self.cache.prune(known).map_err(|e| BalanceError::Cache(format!("{e:#}")))
    }

    pub fn snapshot(&self) -> Arc<BalanceCollection> {
        self.orchestrator.snapshot()
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }
}

impl Drop for BalanceEngine {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        // The persist task may not have seen the latest snapshot. Records
        // still `cached` came from the store and are not written back.
        let fresh = self
            .orchestrator
            .snapshot()
            .remove_where(|r| r.status == BalanceStatus::Cached);
        if let Err(e) = self.cache.flush(&fresh) {
            warn!("Failed to flush balances on shutdown: {e:#}");
        }
    }
}

/// Write what changed in each distinct snapshot to the cache. The watch
/// channel coalesces bursts into one write. Evicted records keep their rows.
fn spawn_persist(
    mut snapshots: watch::Receiver<Arc<BalanceCollection>>,
    cache: BalanceCacheStore,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = Arc::clone(&snapshots.borrow_and_update());
        while snapshots.changed().await.is_ok() {
            let snapshot = Arc::clone(&snapshots.borrow_and_update());
            if Arc::ptr_eq(&snapshot, &last) {
                continue;
            }
            if let Err(e) = cache.store_changes(&last, &snapshot) {
                warn!("Failed to persist balances: {e:#}");
            }
            last = snapshot;
        }
    })
}
