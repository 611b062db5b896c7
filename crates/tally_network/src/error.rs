use std::time::Duration;

use tally_codec::CodecError;
use tally_core::{ErrorCategory, TallyError};
use thiserror::Error;

/// Errors produced by the chain connectors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectorError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("All endpoints failed for {0}")]
    AllEndpointsFailed(String),

    #[error("No endpoints configured for {0}")]
    NoEndpoints(String),

    #[error("Connection closed")]
    Closed,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<TallyError> for ConnectorError {
    fn from(e: TallyError) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<serde_json::Error> for ConnectorError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidResponse(e.to_string())
    }
}

impl ConnectorError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport(_) | Self::Timeout(_) | Self::AllEndpointsFailed(_) | Self::Closed => {
                ErrorCategory::Transport
            }
            Self::Rpc { .. } | Self::InvalidResponse(_) => ErrorCategory::Protocol,
            Self::Codec(e) => e.category(),
            Self::NoEndpoints(_) | Self::Config(_) => ErrorCategory::Configuration,
        }
    }
}
