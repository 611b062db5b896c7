//! Tally Balances: the balance engine proper.
//!
//! Token kinds are served by [`BalanceModule`]s resolved through a closed
//! [`ModuleRegistry`]. The [`Orchestrator`] fans `watch` requests out to
//! modules, deduplicates identical (address, token) triples, and folds
//! their updates into copy-on-write [`BalanceCollection`] snapshots.
//! [`BalanceEngine`] wires everything to the connectors and the SQLite
//! cache for the host application.

pub mod cache_store;
pub mod collection;
pub mod engine;
pub mod error;
pub mod modules;
pub mod orchestrator;
pub mod record;

pub use cache_store::BalanceCacheStore;
pub use collection::{BalanceCollection, BalanceSum, RateTable};
pub use engine::{BalanceEngine, EngineParts};
pub use error::BalanceError;
pub use modules::{BalanceModule, ModuleContext, ModuleRegistry, ModuleUpdate, UpdateSink};
pub use orchestrator::Orchestrator;
pub use record::{Amounts, BalanceKey, BalanceRecord, BalanceStatus};
