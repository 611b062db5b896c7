//! SCALE storage codec driven by runtime metadata, plus the address and ABI
//! helpers the balance modules need. Nothing in this crate touches the
//! network: every function is a pure transformation of its inputs.

pub mod abi;
pub mod dynamic;
pub mod error;
pub mod hashing;
pub mod metadata;
pub mod ss58;
pub mod storage;
pub mod value;

pub use dynamic::{decode_value, encode_value};
pub use error::CodecError;
pub use metadata::{Metadata, StorageHasher, TypeId};
pub use storage::{
    constant, decode, decode_key_args, decode_storage, encode_key, encode_key_hex, storage_default,
};
pub use value::{Composite, Value};

pub use primitive_types::U256;
