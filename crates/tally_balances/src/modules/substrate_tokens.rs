//! ORML multi-currency balances from `Tokens.Accounts(account, currency_id)`.

use tally_codec::Value;
use tally_core::{TokenKind, TokenParams, TokenRef, Unsubscribe};

use super::storage_watch::{self, StorageQuery, account_arg, amount};
use super::{BalanceModule, ModuleContext, UpdateSink};
use crate::error::BalanceError;
use crate::record::Amounts;

pub struct SubstrateTokensModule;

impl BalanceModule for SubstrateTokensModule {
    fn name(&self) -> &'static str {
        "substrate-tokens"
    }

    fn token_kinds(&self) -> &'static [TokenKind] {
        &[TokenKind::SubstrateTokens]
    }

    fn subscribe(
        &self,
        ctx: &ModuleContext,
        address: &str,
        token: &TokenRef,
        on_update: UpdateSink,
    ) -> Result<Unsubscribe, BalanceError> {
        let TokenParams::Currency { currency_id } = &token.params else {
            return Err(BalanceError::Config(format!("token {} has no currency id", token.id)));
        };
        let query = StorageQuery {
            pallet: "Tokens",
            item: "Accounts",
            args: vec![account_arg(address)?, Value::from_json(currency_id)],
            extract: orml_account,
        };
        storage_watch::watch(ctx, token, query, on_update)
    }
}

fn orml_account(data: Option<&Value>) -> Result<Amounts, String> {
    let Some(data) = data else {
        return Ok(Amounts::zero());
    };
    Ok(Amounts::new(
        amount(data, &["free"])?,
        amount(data, &["reserved"])?,
        amount(data, &["frozen"])?,
    ))
}
