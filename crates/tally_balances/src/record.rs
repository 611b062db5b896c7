//! Balance records and their identity.

use std::fmt;

use chrono::{DateTime, Utc};
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use tally_codec::{abi, ss58};
use tally_core::{ChainRef, TokenRef};

use crate::error::BalanceError;

// ---------------------------------------------------------------------------
// Amounts
// ---------------------------------------------------------------------------

/// Balance amounts in the token's smallest unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Amounts {
    pub free: U256,
    pub reserved: U256,
    pub frozen: U256,
}

impl Amounts {
    pub fn new(free: U256, reserved: U256, frozen: U256) -> Self {
        Self {
            free,
            reserved,
            frozen,
        }
    }

    pub fn free_only(free: U256) -> Self {
        Self::new(free, U256::zero(), U256::zero())
    }

    pub fn zero() -> Self {
        Self::default()
    }

    /// Spendable part of `free`.
    pub fn available(&self) -> U256 {
        self.free.saturating_sub(self.frozen)
    }

    pub fn total(&self) -> U256 {
        self.free.saturating_add(self.reserved)
    }

    pub fn is_zero(&self) -> bool {
        self.total().is_zero()
    }
}

/// `amount / 10^decimals` as a float. The integer part and the remainder
/// are split exactly before either is converted.
pub fn to_decimal(amount: U256, decimals: u8) -> f64 {
    if decimals == 0 {
        return u256_to_f64(amount);
    }
    let unit = U256::exp10(decimals as usize);
    let (whole, rem) = amount.div_mod(unit);
    u256_to_f64(whole) + u256_to_f64(rem) / u256_to_f64(unit)
}

fn u256_to_f64(v: U256) -> f64 {
    v.0.iter()
        .rev()
        .fold(0.0, |acc, limb| acc * 18_446_744_073_709_551_616.0 + *limb as f64)
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStatus {
    /// Restored from the cache store, not yet confirmed by the chain.
    Cached,
    Live,
    /// The last value is kept but the source is unreachable.
    Stale,
    Error(String),
}

impl BalanceStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl fmt::Display for BalanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cached => f.write_str("cached"),
            Self::Live => f.write_str("live"),
            Self::Stale => f.write_str("stale"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// `(chain-or-network id, token id, address)`. EVM addresses are stored
/// lower-cased and Substrate accounts under the generic SS58 prefix, so that
/// every spelling of one account shares a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BalanceKey {
    pub chain: String,
    pub token_id: String,
    pub address: String,
}

impl BalanceKey {
    pub fn for_token(token: &TokenRef, address: &str) -> Self {
        Self {
            chain: token.chain.key(),
            token_id: token.id.clone(),
            address: normalize_address(&token.chain, address),
        }
    }
}

impl fmt::Display for BalanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.chain, self.token_id, self.address)
    }
}

/// Canonical spelling of `address` on the chain's family. Input that does
/// not parse is kept as given.
pub fn normalize_address(chain: &ChainRef, address: &str) -> String {
    if chain.is_evm() {
        return address.to_lowercase();
    }
    ss58::parse_account_id(address)
        .and_then(|account| ss58::encode(ss58::GENERIC_PREFIX, &account))
        .unwrap_or_else(|_| address.to_string())
}

/// Check that `address` is well formed for the chain's family.
pub fn check_address(chain: &ChainRef, address: &str) -> Result<(), BalanceError> {
    if chain.is_evm() {
        abi::parse_address(address)?;
    } else {
        ss58::parse_account_id(address)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub key: BalanceKey,
    pub symbol: String,
    pub decimals: u8,
    pub amounts: Amounts,
    pub status: BalanceStatus,
    pub updated_at: DateTime<Utc>,
}

impl BalanceRecord {
    pub fn new(token: &TokenRef, address: &str, amounts: Amounts, status: BalanceStatus) -> Self {
        Self {
            key: BalanceKey::for_token(token, address),
            symbol: token.symbol.clone(),
            decimals: token.decimals,
            amounts,
            status,
            updated_at: Utc::now(),
        }
    }

    /// Same amounts under a new status, stamped now.
    pub fn with_status(&self, status: BalanceStatus) -> Self {
        Self {
            status,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Free plus reserved, in whole tokens.
    pub fn token_amount(&self) -> f64 {
        to_decimal(self.amounts.total(), self.decimals)
    }

    /// Equal apart from the timestamp.
    pub fn same_state(&self, other: &Self) -> bool {
        self.key == other.key && self.amounts == other.amounts && self.status == other.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: &str = "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY";

    fn polkadot() -> ChainRef {
        ChainRef::substrate("polkadot", "0x91b1")
    }

    #[test]
    fn available_saturates() {
        let a = Amounts::new(U256::from(100u64), U256::from(7u64), U256::from(30u64));
        assert_eq!(a.available(), U256::from(70u64));
        assert_eq!(a.total(), U256::from(107u64));

        let over = Amounts::new(U256::from(10u64), U256::zero(), U256::from(30u64));
        assert_eq!(over.available(), U256::zero());
        assert!(Amounts::zero().is_zero());
    }

    #[test]
    fn decimal_conversion_is_exact_for_whole_units() {
        assert_eq!(to_decimal(U256::from(10_000_000u64), 6), 10.0);
        assert_eq!(to_decimal(U256::from(1_500_000u64), 6), 1.5);
        assert_eq!(to_decimal(U256::from(42u64), 0), 42.0);
        let wei = U256::from(2_000_000_000_000_000_000u128);
        assert_eq!(to_decimal(wei, 18), 2.0);
    }

    #[test]
    fn large_values_convert() {
        let big = U256::MAX;
        assert!(to_decimal(big, 18) > 1e58);
    }

    #[test]
    fn evm_keys_ignore_case() {
        let eth = ChainRef::evm(1);
        let token = TokenRef::evm_native(&eth, "ETH", 18);
        let a = BalanceKey::for_token(&token, "0xABCDEF0123456789abcdef0123456789ABCDEF01");
        let b = BalanceKey::for_token(&token, "0xabcdef0123456789abcdef0123456789abcdef01");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), format!("1:1-evm-native:{}", b.address));
    }

    #[test]
    fn substrate_keys_use_generic_prefix() {
        let token = TokenRef::substrate_native(&polkadot(), "DOT", 10);
        let key = BalanceKey::for_token(&token, ALICE);
        assert_eq!(key.address, ALICE);
        assert_eq!(key.chain, "polkadot");

        let account = ss58::parse_account_id(ALICE).unwrap();
        let on_polkadot = ss58::encode(0, &account).unwrap();
        let on_kusama = ss58::encode(2, &account).unwrap();
        let as_hex = format!("0x{}", hex::encode(account));
        assert_ne!(on_polkadot, ALICE);
        for spelling in [on_polkadot, on_kusama, as_hex] {
            assert_eq!(BalanceKey::for_token(&token, &spelling), key);
        }
        assert_eq!(BalanceKey::for_token(&token, "garbage").address, "garbage");
    }

    #[test]
    fn address_family_checks() {
        let eth = ChainRef::evm(1);
        assert!(check_address(&polkadot(), ALICE).is_ok());
        assert!(check_address(&eth, ALICE).is_err());
        assert!(check_address(&eth, "0xabcdef0123456789abcdef0123456789abcdef01").is_ok());
        assert!(matches!(
            check_address(&polkadot(), "0xabcdef0123456789abcdef0123456789abcdef01"),
            Err(BalanceError::InvalidAddress(_))
        ));
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&BalanceStatus::Live).unwrap(), "\"live\"");
        let err = serde_json::to_string(&BalanceStatus::Error("bad".into())).unwrap();
        assert_eq!(err, "{\"error\":\"bad\"}");
    }

    #[test]
    fn record_round_trips_through_json() {
        let token = TokenRef::substrate_native(&polkadot(), "DOT", 10);
        let record = BalanceRecord::new(
            &token,
            ALICE,
            Amounts::free_only(U256::from(5u64)),
            BalanceStatus::Live,
        );
        let json = serde_json::to_string(&record).unwrap();
        let back: BalanceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert!(back.same_state(&record.with_status(BalanceStatus::Live)));
        assert!(!back.same_state(&record.with_status(BalanceStatus::Stale)));
    }
}
