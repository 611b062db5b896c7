//! Native EVM balances via polled `eth_getBalance`.

use serde_json::{Value as JsonValue, json};
use tally_codec::abi;
use tally_core::{TokenKind, TokenRef, Unsubscribe};

use super::{BalanceModule, ModuleContext, ModuleUpdate, UpdateSink};
use crate::error::BalanceError;
use crate::record::Amounts;

pub struct EvmNativeModule;

impl BalanceModule for EvmNativeModule {
    fn name(&self) -> &'static str {
        "evm-native"
    }

    fn token_kinds(&self) -> &'static [TokenKind] {
        &[TokenKind::EvmNative]
    }

    fn subscribe(
        &self,
        ctx: &ModuleContext,
        address: &str,
        token: &TokenRef,
        on_update: UpdateSink,
    ) -> Result<Unsubscribe, BalanceError> {
        let address = abi::normalize_address(address)?;
        let unsubscribe = ctx.evm.poll(
            &token.chain.key(),
            "eth_getBalance",
            json!([address, "latest"]),
            ctx.evm_poll_interval,
            move |result| {
                on_update(match result {
                    Ok(value) => read_quantity(&value),
                    Err(e) => ModuleUpdate::from_connector_error(&e),
                })
            },
        )?;
        Ok(unsubscribe)
    }
}

fn read_quantity(value: &JsonValue) -> ModuleUpdate {
    match value.as_str().map(abi::parse_quantity) {
        Some(Ok(wei)) => ModuleUpdate::Balance(Amounts::free_only(wei)),
        Some(Err(e)) => ModuleUpdate::Error(e.to_string()),
        None => ModuleUpdate::Error(format!("expected a quantity, got {value}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitive_types::U256;

    #[test]
    fn quantities() {
        assert_eq!(
            read_quantity(&json!("0xde0b6b3a7640000")),
            ModuleUpdate::Balance(Amounts::free_only(U256::from(1_000_000_000_000_000_000u64)))
        );
        assert!(matches!(read_quantity(&json!(12)), ModuleUpdate::Error(_)));
        assert!(matches!(read_quantity(&json!("0x")), ModuleUpdate::Error(_)));
    }
}
