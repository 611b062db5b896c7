//! Tally Core: shared foundation for the balance engine.
//!
//! Holds the chain/token registry, endpoint health bookkeeping and backoff
//! policy, configuration, error taxonomy, logging setup, the SQLite
//! persistence layer, and the [`Unsubscribe`] cancellation handle returned by
//! every subscribe-like API in the workspace.

pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod persistence;
pub mod registry;
pub mod unsubscribe;

pub use config::EngineConfig;
pub use error::{ErrorCategory, TallyError};
pub use health::{
    Backoff, BackoffPolicy, EndpointHealth, HealthStore, MemoryHealthStore, SqliteHealthStore,
    rank_endpoints,
};
pub use persistence::{BalanceRow, Database};
pub use registry::{ChainInfo, ChainRef, ChainRegistry, TokenKind, TokenParams, TokenRef, validate_url};
pub use unsubscribe::Unsubscribe;
