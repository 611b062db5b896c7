//! SS58 account addresses.

use blake2::{Blake2b512, Digest};

use crate::error::CodecError;

const PREFIX: &[u8] = b"SS58PRE";
const CHECKSUM_LEN: usize = 2;

/// Generic Substrate network prefix.
pub const GENERIC_PREFIX: u16 = 42;

fn checksum(data: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut hasher = Blake2b512::new();
    hasher.update(PREFIX);
    hasher.update(data);
    let digest = hasher.finalize();
    [digest[0], digest[1]]
}

fn prefix_bytes(ident: u16) -> Result<Vec<u8>, CodecError> {
    match ident {
        0..=63 => Ok(vec![ident as u8]),
        64..=16_383 => {
            let first = ((ident & 0b0000_0000_1111_1100) as u8 >> 2) | 0b0100_0000;
            let second = ((ident >> 8) as u8) | (((ident & 0b0000_0000_0000_0011) as u8) << 6);
            Ok(vec![first, second])
        }
        _ => Err(CodecError::InvalidAddress(format!("network prefix {ident} out of range"))),
    }
}

/// Decode an SS58 address into its network prefix and 32-byte account id.
pub fn decode(address: &str) -> Result<(u16, [u8; 32]), CodecError> {
    let data = bs58::decode(address)
        .into_vec()
        .map_err(|e| CodecError::InvalidAddress(format!("{address}: {e}")))?;

    let (ident, prefix_len) = match data.first() {
        Some(&b) if b < 64 => (b as u16, 1),
        Some(&b) if b < 128 => {
            let second = *data
                .get(1)
                .ok_or_else(|| CodecError::InvalidAddress(format!("{address}: too short")))?;
            let lower = ((b << 2) | (second >> 6)) as u16;
            let upper = (second & 0b0011_1111) as u16;
            (lower | (upper << 8), 2)
        }
        _ => {
            return Err(CodecError::InvalidAddress(format!(
                "{address}: unsupported address format"
            )));
        }
    };

    if data.len() != prefix_len + 32 + CHECKSUM_LEN {
        return Err(CodecError::InvalidAddress(format!(
            "{address}: expected a 32-byte account, got {} bytes",
            data.len()
        )));
    }

    let body_end = prefix_len + 32;
    if checksum(&data[..body_end]) != data[body_end..] {
        return Err(CodecError::InvalidAddress(format!("{address}: bad checksum")));
    }

    let mut account = [0u8; 32];
    account.copy_from_slice(&data[prefix_len..body_end]);
    Ok((ident, account))
}

/// Encode a 32-byte account id under the given network prefix.
pub fn encode(ident: u16, account: &[u8; 32]) -> Result<String, CodecError> {
    let mut data = prefix_bytes(ident)?;
    data.extend_from_slice(account);
    let check = checksum(&data);
    data.extend_from_slice(&check);
    Ok(bs58::encode(data).into_string())
}

/// Accept either an SS58 address or a `0x`-prefixed 32-byte hex account id.
pub fn parse_account_id(address: &str) -> Result<[u8; 32], CodecError> {
    if let Some(hex_part) = address.strip_prefix("0x") {
        let bytes = hex::decode(hex_part)
            .map_err(|e| CodecError::InvalidAddress(format!("{address}: {e}")))?;
        return <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
            CodecError::InvalidAddress(format!("{address}: expected 32 bytes, got {}", bytes.len()))
        });
    }
    decode(address).map(|(_, account)| account)
}
