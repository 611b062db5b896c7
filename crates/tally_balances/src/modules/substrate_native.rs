//! Native balances from `System.Account`.

use tally_codec::Value;
use tally_core::{TokenKind, TokenRef, Unsubscribe};

use super::storage_watch::{self, StorageQuery, account_arg, amount};
use super::{BalanceModule, ModuleContext, UpdateSink};
use crate::error::BalanceError;
use crate::record::Amounts;

pub struct SubstrateNativeModule;

impl BalanceModule for SubstrateNativeModule {
    fn name(&self) -> &'static str {
        "substrate-native"
    }

    fn token_kinds(&self) -> &'static [TokenKind] {
        &[TokenKind::SubstrateNative]
    }

    fn subscribe(
        &self,
        ctx: &ModuleContext,
        address: &str,
        token: &TokenRef,
        on_update: UpdateSink,
    ) -> Result<Unsubscribe, BalanceError> {
        let query = StorageQuery {
            pallet: "System",
            item: "Account",
            args: vec![account_arg(address)?],
            extract: account_data,
        };
        storage_watch::watch(ctx, token, query, on_update)
    }
}

/// `AccountInfo.data`. Runtimes before the 2023 balances rework split the
/// frozen amount into `misc_frozen` and `fee_frozen`; the larger one binds.
fn account_data(info: Option<&Value>) -> Result<Amounts, String> {
    let Some(info) = info else {
        return Ok(Amounts::zero());
    };
    let free = amount(info, &["data", "free"])?;
    let reserved = amount(info, &["data", "reserved"])?;
    let frozen = if info.at(&["data", "frozen"]).is_some() {
        amount(info, &["data", "frozen"])?
    } else {
        let misc = amount(info, &["data", "misc_frozen"])?;
        let fee = amount(info, &["data", "fee_frozen"])?;
        misc.max(fee)
    };
    Ok(Amounts::new(free, reserved, frozen))
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitive_types::U256;

    fn info(data: Vec<(&str, u128)>) -> Value {
        Value::named(vec![
            ("nonce", Value::U128(0)),
            (
                "data",
                Value::named(data.into_iter().map(|(k, v)| (k, Value::U128(v))).collect()),
            ),
        ])
    }

    #[test]
    fn current_layout() {
        let v = info(vec![("free", 100), ("reserved", 5), ("frozen", 40), ("flags", 0)]);
        let a = account_data(Some(&v)).unwrap();
        assert_eq!(a, Amounts::new(U256::from(100u64), U256::from(5u64), U256::from(40u64)));
        assert_eq!(a.available(), U256::from(60u64));
    }

    #[test]
    fn legacy_layout_takes_larger_lock() {
        let v = info(vec![("free", 100), ("reserved", 0), ("misc_frozen", 10), ("fee_frozen", 25)]);
        assert_eq!(account_data(Some(&v)).unwrap().frozen, U256::from(25u64));
    }

    #[test]
    fn missing_fields_are_errors() {
        let v = info(vec![("free", 1)]);
        assert!(account_data(Some(&v)).is_err());
        assert_eq!(account_data(None).unwrap(), Amounts::zero());
    }
}
