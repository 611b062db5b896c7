//! Storage keys and storage values.

use tracing::warn;

use crate::dynamic::{decode_prefix, decode_value, encode_value};
use crate::error::CodecError;
use crate::hashing::storage_prefix;
use crate::metadata::{Metadata, StorageEntryType, StorageHasher, StorageModifier, TypeDef, TypeId};
use crate::value::Value;

/// Key argument types paired with their hashers. A single-hasher map hashes
/// its whole key type; an N-hasher map hashes each field of its N-tuple key.
fn key_parts(md: &Metadata, ty: &StorageEntryType) -> Result<Vec<(StorageHasher, TypeId)>, CodecError> {
    match ty {
        StorageEntryType::Plain(_) => Ok(Vec::new()),
        StorageEntryType::Map { hashers, key, .. } if hashers.len() == 1 => Ok(vec![(hashers[0], *key)]),
        StorageEntryType::Map { hashers, key, .. } => match &md.resolve(*key)?.type_def {
            TypeDef::Tuple(fields) if fields.len() == hashers.len() => {
                Ok(hashers.iter().copied().zip(fields.iter().copied()).collect())
            }
            _ => Err(CodecError::Metadata(format!(
                "map with {} hashers has a key that is not a {}-tuple",
                hashers.len(),
                hashers.len()
            ))),
        },
    }
}

/// Encode the storage key for `pallet.item` with the given key arguments.
///
/// Passing fewer arguments than the map has keys yields a prefix of the full
/// key, usable for iteration.
pub fn encode_key(md: &Metadata, pallet: &str, item: &str, args: &[Value]) -> Result<Vec<u8>, CodecError> {
    let (prefix, entry) = md.storage_entry(pallet, item)?;
    let parts = key_parts(md, &entry.ty)?;
    if args.len() > parts.len() {
        return Err(CodecError::ArgCount {
            expected: parts.len(),
            found: args.len(),
        });
    }

    let mut key = storage_prefix(prefix, &entry.name).to_vec();
    for ((hasher, ty), arg) in parts.iter().zip(args) {
        let encoded = encode_value(md, *ty, arg)?;
        hasher.hash_into(&encoded, &mut key);
    }
    Ok(key)
}

/// Hex form of [`encode_key`], as sent over JSON-RPC.
pub fn encode_key_hex(md: &Metadata, pallet: &str, item: &str, args: &[Value]) -> Result<String, CodecError> {
    Ok(format!("0x{}", hex::encode(encode_key(md, pallet, item, args)?)))
}

/// Recover key arguments from a full storage key. Arguments hashed with an
/// opaque hasher come back as `None`.
pub fn decode_key_args(md: &Metadata, pallet: &str, item: &str, key: &[u8]) -> Result<Vec<Option<Value>>, CodecError> {
    let (prefix, entry) = md.storage_entry(pallet, item)?;
    let expected = storage_prefix(prefix, &entry.name);
    if key.len() < expected.len() || key[..expected.len()] != expected {
        return Err(CodecError::mismatch(format!("key of {pallet}.{item}"), "foreign prefix"));
    }

    let mut rest = &key[expected.len()..];
    let mut args = Vec::new();
    for (hasher, ty) in key_parts(md, &entry.ty)? {
        let skip = hasher.prefix_len();
        if rest.len() < skip {
            return Err(CodecError::Scale("storage key truncated".into()));
        }
        rest = &rest[skip..];
        if hasher.is_reversible() {
            args.push(Some(decode_prefix(md, ty, &mut rest)?));
        } else {
            args.push(None);
        }
    }
    if !rest.is_empty() {
        return Err(CodecError::TrailingBytes(rest.len()));
    }
    Ok(args)
}

/// Decode a storage value, reporting why it failed.
pub fn decode_storage(md: &Metadata, pallet: &str, item: &str, bytes: &[u8]) -> Result<Value, CodecError> {
    let (_, entry) = md.storage_entry(pallet, item)?;
    decode_value(md, entry.ty.value_ty(), bytes)
}

/// Decode a storage value. Failures are logged and yield `None` so that one
/// chain's schema drift never breaks decoding elsewhere.
pub fn decode(md: &Metadata, pallet: &str, item: &str, bytes: &[u8]) -> Option<Value> {
    match decode_storage(md, pallet, item, bytes) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(pallet, item, len = bytes.len(), "storage decode failed: {e}");
            None
        }
    }
}

/// The value a `Default`-modifier entry takes when the key is absent from
/// state. `None` for `Optional` entries.
pub fn storage_default(md: &Metadata, pallet: &str, item: &str) -> Result<Option<Value>, CodecError> {
    let (_, entry) = md.storage_entry(pallet, item)?;
    match entry.modifier {
        StorageModifier::Optional => Ok(None),
        StorageModifier::Default => decode_value(md, entry.ty.value_ty(), &entry.default).map(Some),
    }
}

/// Decode a pallet constant.
pub fn constant(md: &Metadata, pallet: &str, name: &str) -> Result<Value, CodecError> {
    let c = md.constant_entry(pallet, name)?;
    decode_value(md, c.ty, &c.value)
}
