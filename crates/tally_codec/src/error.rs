use tally_core::ErrorCategory;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Invalid metadata: {0}")]
    Metadata(String),

    #[error("Unknown pallet: {0}")]
    UnknownPallet(String),

    #[error("Unknown storage item {pallet}.{item}")]
    UnknownStorage { pallet: String, item: String },

    #[error("Unknown constant {pallet}.{name}")]
    UnknownConstant { pallet: String, name: String },

    #[error("Unknown type id {0}")]
    UnknownType(u32),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("Wrong number of key arguments: expected at most {expected}, got {found}")]
    ArgCount { expected: usize, found: usize },

    #[error("Value out of range: {0}")]
    OutOfRange(String),

    #[error("SCALE decode failed: {0}")]
    Scale(String),

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    #[error("Type nesting exceeds depth limit")]
    DepthLimit,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid hex: {0}")]
    Hex(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl From<parity_scale_codec::Error> for CodecError {
    fn from(e: parity_scale_codec::Error) -> Self {
        Self::Scale(e.to_string())
    }
}

impl From<hex::FromHexError> for CodecError {
    fn from(e: hex::FromHexError) -> Self {
        Self::Hex(e.to_string())
    }
}

impl CodecError {
    pub fn mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Codec errors never involve the network: they are all protocol errors
    /// scoped to the record being decoded, apart from malformed addresses
    /// supplied by the caller.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidAddress(_) => ErrorCategory::Configuration,
            _ => ErrorCategory::Protocol,
        }
    }
}
