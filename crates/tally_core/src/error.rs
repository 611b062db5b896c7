use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the core layer (registry, persistence, configuration).
#[derive(Error, Debug)]
pub enum TallyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown chain: {0}")]
    UnknownChain(String),

    #[error("Unknown token: {0}")]
    UnknownToken(String),

    #[error("Invalid endpoint URL: {0}")]
    InvalidEndpoint(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for TallyError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for TallyError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("serialization: {e}"))
    }
}

/// How an error should be handled by the engine.
///
/// - `Transport` errors are retried with backoff at the connector level and
///   only ever show up as `stale` balance records.
/// - `Protocol` errors (RPC error objects, decode mismatches) mark the single
///   affected record as `error`.
/// - `Configuration` errors are reported synchronously at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transport,
    Protocol,
    Configuration,
    Storage,
    Internal,
}

impl ErrorCategory {
    /// Whether recovery happens automatically (retry or next update).
    pub fn is_recoverable(self) -> bool {
        !matches!(self, Self::Configuration)
    }
}

impl TallyError {
    /// Returns the broad error category for routing.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) | Self::UnknownChain(_) | Self::UnknownToken(_) => {
                ErrorCategory::Configuration
            }
            Self::InvalidEndpoint(_) => ErrorCategory::Configuration,
            Self::Storage(_) => ErrorCategory::Storage,
            Self::Timeout(_) => ErrorCategory::Transport,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }
}
