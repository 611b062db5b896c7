use std::hash::Hasher;

use blake2::digest::consts::{U16, U32};
use blake2::{Blake2b, Digest};
use twox_hash::XxHash64;

use crate::metadata::StorageHasher;

pub fn blake2_128(data: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&Blake2b::<U16>::digest(data));
    out
}

pub fn blake2_256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Blake2b::<U32>::digest(data));
    out
}

fn twox(data: &[u8], out: &mut [u8]) {
    for (seed, chunk) in out.chunks_mut(8).enumerate() {
        let mut h = XxHash64::with_seed(seed as u64);
        h.write(data);
        chunk.copy_from_slice(&h.finish().to_le_bytes());
    }
}

pub fn twox_64(data: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    twox(data, &mut out);
    out
}

pub fn twox_128(data: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    twox(data, &mut out);
    out
}

pub fn twox_256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    twox(data, &mut out);
    out
}

impl StorageHasher {
    /// Hash `data` and append the result to `out`.
    pub fn hash_into(self, data: &[u8], out: &mut Vec<u8>) {
        match self {
            Self::Blake2_128 => out.extend_from_slice(&blake2_128(data)),
            Self::Blake2_256 => out.extend_from_slice(&blake2_256(data)),
            Self::Blake2_128Concat => {
                out.extend_from_slice(&blake2_128(data));
                out.extend_from_slice(data);
            }
            Self::Twox128 => out.extend_from_slice(&twox_128(data)),
            Self::Twox256 => out.extend_from_slice(&twox_256(data)),
            Self::Twox64Concat => {
                out.extend_from_slice(&twox_64(data));
                out.extend_from_slice(data);
            }
            Self::Identity => out.extend_from_slice(data),
        }
    }

    /// Length of the hash prefix written before the (optional) raw key.
    pub fn prefix_len(self) -> usize {
        match self {
            Self::Blake2_128 | Self::Blake2_128Concat | Self::Twox128 => 16,
            Self::Blake2_256 | Self::Twox256 => 32,
            Self::Twox64Concat => 8,
            Self::Identity => 0,
        }
    }

    /// Whether the raw key follows the hash, so it can be recovered.
    pub fn is_reversible(self) -> bool {
        matches!(
            self,
            Self::Blake2_128Concat | Self::Twox64Concat | Self::Identity
        )
    }
}

/// `twox128(pallet) ++ twox128(item)`: the prefix shared by every key of a
/// storage item.
pub fn storage_prefix(pallet: &str, item: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[..16].copy_from_slice(&twox_128(pallet.as_bytes()));
    out[16..].copy_from_slice(&twox_128(item.as_bytes()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_account_prefix_matches_known_value() {
        assert_eq!(
            hex::encode(storage_prefix("System", "Account")),
            "26aa394eea5630e07c48ae0c9558cef7b99d880ec681799c0cf30e8886371da9"
        );
    }

    #[test]
    fn twox_128_of_system() {
        assert_eq!(
            hex::encode(twox_128(b"System")),
            "26aa394eea5630e07c48ae0c9558cef7"
        );
    }

    #[test]
    fn concat_hashers_keep_the_raw_key() {
        let data = [1u8, 2, 3];
        for hasher in [
            StorageHasher::Blake2_128Concat,
            StorageHasher::Twox64Concat,
            StorageHasher::Identity,
        ] {
            let mut out = Vec::new();
            hasher.hash_into(&data, &mut out);
            assert_eq!(out.len(), hasher.prefix_len() + data.len());
            assert_eq!(&out[hasher.prefix_len()..], &data);
            assert!(hasher.is_reversible());
        }
    }

    #[test]
    fn opaque_hashers_have_fixed_width() {
        for hasher in [
            StorageHasher::Blake2_128,
            StorageHasher::Blake2_256,
            StorageHasher::Twox128,
            StorageHasher::Twox256,
        ] {
            let mut out = Vec::new();
            hasher.hash_into(b"anything at all", &mut out);
            assert_eq!(out.len(), hasher.prefix_len());
            assert!(!hasher.is_reversible());
        }
    }
}
