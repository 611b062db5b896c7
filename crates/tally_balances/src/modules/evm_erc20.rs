//! ERC-20 balances via polled `balanceOf` calls.

use serde_json::{Value as JsonValue, json};
use tally_codec::abi;
use tally_core::{TokenKind, TokenParams, TokenRef, Unsubscribe};

use super::{BalanceModule, ModuleContext, ModuleUpdate, UpdateSink};
use crate::error::BalanceError;
use crate::record::Amounts;

pub struct EvmErc20Module;

impl BalanceModule for EvmErc20Module {
    fn name(&self) -> &'static str {
        "evm-erc20"
    }

    fn token_kinds(&self) -> &'static [TokenKind] {
        &[TokenKind::EvmErc20]
    }

    fn subscribe(
        &self,
        ctx: &ModuleContext,
        address: &str,
        token: &TokenRef,
        on_update: UpdateSink,
    ) -> Result<Unsubscribe, BalanceError> {
        let TokenParams::Erc20 { contract } = &token.params else {
            return Err(BalanceError::Config(format!("token {} has no contract", token.id)));
        };
        let contract = abi::normalize_address(contract)?;
        let data = abi::balance_of_calldata(address)?;
        let unsubscribe = ctx.evm.poll(
            &token.chain.key(),
            "eth_call",
            json!([{ "to": contract, "data": data }, "latest"]),
            ctx.evm_poll_interval,
            move |result| {
                on_update(match result {
                    Ok(value) => read_word(&value),
                    Err(e) => ModuleUpdate::from_connector_error(&e),
                })
            },
        )?;
        Ok(unsubscribe)
    }
}

fn read_word(value: &JsonValue) -> ModuleUpdate {
    match value.as_str().map(abi::decode_uint256) {
        Some(Ok(amount)) => ModuleUpdate::Balance(Amounts::free_only(amount)),
        Some(Err(e)) => ModuleUpdate::Error(format!("balanceOf: {e}")),
        None => ModuleUpdate::Error(format!("balanceOf: expected hex data, got {value}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitive_types::U256;

    #[test]
    fn words() {
        let word = format!("0x{:064x}", 42u64);
        assert_eq!(
            read_word(&json!(word)),
            ModuleUpdate::Balance(Amounts::free_only(U256::from(42u64)))
        );
        assert!(matches!(read_word(&json!("0x")), ModuleUpdate::Error(_)));
        assert!(matches!(read_word(&JsonValue::Null), ModuleUpdate::Error(_)));
    }
}
