//! Minimal Ethereum ABI helpers for balance reads.

use primitive_types::U256;

use crate::error::CodecError;

/// `keccak256("balanceOf(address)")[..4]`
pub const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

/// Parse a `0x`-prefixed 20-byte address. Case is not checked.
pub fn parse_address(address: &str) -> Result<[u8; 20], CodecError> {
    let hex_part = address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
        .ok_or_else(|| CodecError::InvalidAddress(format!("{address}: missing 0x prefix")))?;
    let bytes =
        hex::decode(hex_part).map_err(|e| CodecError::InvalidAddress(format!("{address}: {e}")))?;
    <[u8; 20]>::try_from(bytes.as_slice()).map_err(|_| {
        CodecError::InvalidAddress(format!("{address}: expected 20 bytes, got {}", bytes.len()))
    })
}

/// Lowercase `0x` form of an EVM address.
pub fn normalize_address(address: &str) -> Result<String, CodecError> {
    Ok(format!("0x{}", hex::encode(parse_address(address)?)))
}

/// Calldata for `balanceOf(owner)`, hex encoded.
pub fn balance_of_calldata(owner: &str) -> Result<String, CodecError> {
    let owner = parse_address(owner)?;
    let mut data = Vec::with_capacity(4 + 32);
    data.extend_from_slice(&BALANCE_OF_SELECTOR);
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(&owner);
    Ok(format!("0x{}", hex::encode(data)))
}

/// Decode the first 32-byte word of an `eth_call` result as `uint256`.
pub fn decode_uint256(result: &str) -> Result<U256, CodecError> {
    let bytes = hex::decode(result.trim_start_matches("0x"))?;
    if bytes.len() < 32 {
        return Err(CodecError::mismatch(
            "32-byte uint256 word",
            format!("{} bytes", bytes.len()),
        ));
    }
    Ok(U256::from_big_endian(&bytes[..32]))
}

/// Parse a JSON-RPC quantity such as `"0x1bc16d674ec80000"`.
pub fn parse_quantity(quantity: &str) -> Result<U256, CodecError> {
    let digits = quantity
        .strip_prefix("0x")
        .ok_or_else(|| CodecError::mismatch("0x quantity", quantity.to_string()))?;
    if digits.is_empty() {
        return Err(CodecError::mismatch("0x quantity", "empty"));
    }
    U256::from_str_radix(digits, 16)
        .map_err(|_| CodecError::mismatch("hex quantity", quantity.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: &str = "0xAbCdEf0123456789abcdef0123456789ABCDEF01";

    #[test]
    fn calldata_layout() {
        let data = balance_of_calldata(OWNER).unwrap();
        assert_eq!(data.len(), 2 + 2 * 36);
        assert!(data.starts_with("0x70a08231000000000000000000000000"));
        assert!(data.ends_with("abcdef0123456789abcdef0123456789abcdef01"));
    }

    #[test]
    fn normalizes_case() {
        assert_eq!(
            normalize_address(OWNER).unwrap(),
            "0xabcdef0123456789abcdef0123456789abcdef01"
        );
        assert!(normalize_address("abcdef").is_err());
        assert!(normalize_address("0x1234").is_err());
    }

    #[test]
    fn uint256_word() {
        let word = format!("0x{:064x}", 1_000_000u64);
        assert_eq!(decode_uint256(&word).unwrap(), U256::from(1_000_000u64));
        assert!(decode_uint256("0x").is_err());
    }

    #[test]
    fn quantities() {
        assert_eq!(
            parse_quantity("0x1bc16d674ec80000").unwrap(),
            U256::from(2_000_000_000_000_000_000u128)
        );
        assert_eq!(parse_quantity("0x0").unwrap(), U256::zero());
        assert!(parse_quantity("0x").is_err());
        assert!(parse_quantity("12").is_err());
    }
}
