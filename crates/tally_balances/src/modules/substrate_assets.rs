//! pallet-assets balances from `Assets.Account(asset_id, account)`.

use tally_codec::Value;
use tally_core::{TokenKind, TokenParams, TokenRef, Unsubscribe};

use super::storage_watch::{self, StorageQuery, account_arg, amount};
use super::{BalanceModule, ModuleContext, UpdateSink};
use crate::error::BalanceError;
use crate::record::Amounts;

pub struct SubstrateAssetsModule;

impl BalanceModule for SubstrateAssetsModule {
    fn name(&self) -> &'static str {
        "substrate-assets"
    }

    fn token_kinds(&self) -> &'static [TokenKind] {
        &[TokenKind::SubstrateAssets]
    }

    fn subscribe(
        &self,
        ctx: &ModuleContext,
        address: &str,
        token: &TokenRef,
        on_update: UpdateSink,
    ) -> Result<Unsubscribe, BalanceError> {
        let TokenParams::Asset { asset_id } = &token.params else {
            return Err(BalanceError::Config(format!("token {} has no asset id", token.id)));
        };
        let query = StorageQuery {
            pallet: "Assets",
            item: "Account",
            args: vec![Value::U128(*asset_id), account_arg(address)?],
            extract: asset_account,
        };
        storage_watch::watch(ctx, token, query, on_update)
    }
}

/// A frozen or blocked account cannot move any of its balance. Older
/// runtimes flag this with `is_frozen` instead of a status enum.
fn asset_account(account: Option<&Value>) -> Result<Amounts, String> {
    let Some(account) = account else {
        return Ok(Amounts::zero());
    };
    let balance = amount(account, &["balance"])?;
    let locked = account
        .field("status")
        .and_then(Value::variant_name)
        .is_some_and(|s| s == "Frozen" || s == "Blocked")
        || account.field("is_frozen").and_then(Value::as_bool) == Some(true);
    let frozen = if locked { balance } else { Default::default() };
    Ok(Amounts::new(balance, Default::default(), frozen))
}
