use tally_codec::CodecError;
use tally_core::{ErrorCategory, TallyError};
use tally_network::ConnectorError;
use thiserror::Error;

/// Errors raised by the balance layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BalanceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Codec error: {0}")]
    Codec(CodecError),

    #[error("Cache error: {0}")]
    Cache(String),
}

impl From<CodecError> for BalanceError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::InvalidAddress(reason) => Self::InvalidAddress(reason),
            other => Self::Codec(other),
        }
    }
}

impl From<TallyError> for BalanceError {
    fn from(e: TallyError) -> Self {
        match e.category() {
            ErrorCategory::Storage => Self::Cache(e.to_string()),
            _ => Self::Config(e.to_string()),
        }
    }
}

impl BalanceError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) | Self::InvalidAddress(_) => ErrorCategory::Configuration,
            Self::Connector(e) => e.category(),
            Self::Codec(e) => e.category(),
            Self::Cache(_) => ErrorCategory::Storage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        assert_eq!(
            BalanceError::Config("x".into()).category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            BalanceError::from(ConnectorError::Closed).category(),
            ErrorCategory::Transport
        );
        assert_eq!(
            BalanceError::from(ConnectorError::Rpc {
                code: -32000,
                message: "boom".into()
            })
            .category(),
            ErrorCategory::Protocol
        );
    }

    #[test]
    fn bad_addresses_are_not_codec_errors() {
        let e = BalanceError::from(CodecError::InvalidAddress("nope".into()));
        assert_eq!(e, BalanceError::InvalidAddress("nope".into()));
    }

    #[test]
    fn core_errors_keep_their_category() {
        let e = BalanceError::from(TallyError::Storage("disk full".into()));
        assert_eq!(e.category(), ErrorCategory::Storage);
        let e = BalanceError::from(TallyError::UnknownToken("x".into()));
        assert_eq!(e.category(), ErrorCategory::Configuration);
    }
}
