//! Tally Network: chain connectors.
//!
//! # Architecture
//!
//! - **Substrate**: one actor task per chain owns a multiplexed JSON-RPC
//!   websocket. Callers hold [`ConnectionHandle`]s; the actor lives while any
//!   handle does. Identical wire subscriptions are shared, requests issued
//!   while reconnecting are queued, and the chain's runtime metadata is
//!   published on a watch channel.
//! - **EVM**: stateless JSON-RPC over HTTP with endpoint failover, plus a
//!   deduplicated poller for balance reads.
//! - **Endpoints** are ranked by recorded health and retried with
//!   exponential backoff when a whole cycle fails.

pub mod config;
pub mod error;
pub mod evm;
pub mod jsonrpc;
pub mod metadata_cache;
pub mod substrate;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::ConnectorConfig;
pub use error::ConnectorError;
pub use evm::{EvmConnector, HttpTransport, PollState, ReqwestTransport};
pub use metadata_cache::MetadataCache;
pub use substrate::{ConnectionHandle, ConnectionStatus, SubscriptionEvent, SubstrateConnector};
pub use transport::{Socket, SocketConnector, WsSocketConnector};
