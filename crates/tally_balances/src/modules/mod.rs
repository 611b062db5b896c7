//! Balance modules: one per [`TokenKind`], resolved through a closed
//! registry at startup.

mod evm_erc20;
mod evm_native;
mod storage_watch;
mod substrate_assets;
mod substrate_native;
mod substrate_tokens;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tally_core::{TokenKind, TokenRef, Unsubscribe};
use tally_network::{ConnectorError, EvmConnector, SubstrateConnector};

use crate::error::BalanceError;
use crate::record::Amounts;

pub use evm_erc20::EvmErc20Module;
pub use evm_native::EvmNativeModule;
pub use substrate_assets::SubstrateAssetsModule;
pub use substrate_native::SubstrateNativeModule;
pub use substrate_tokens::SubstrateTokensModule;

/// What a module reports for one (address, token) pair.
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleUpdate {
    Balance(Amounts),
    /// The source is unreachable; the last value stands until the grace
    /// period since the last good read runs out.
    Stale,
    /// The value could not be read or decoded.
    Error(String),
}

impl ModuleUpdate {
    /// Transport trouble is retried by the connectors and only hints at
    /// staleness; everything else is an error on this record.
    pub fn from_connector_error(e: &ConnectorError) -> Self {
        match e.category() {
            tally_core::ErrorCategory::Transport => Self::Stale,
            _ => Self::Error(e.to_string()),
        }
    }
}

pub type UpdateSink = Arc<dyn Fn(ModuleUpdate) + Send + Sync>;

/// Connectors handed to every module.
#[derive(Clone)]
pub struct ModuleContext {
    pub substrate: SubstrateConnector,
    pub evm: EvmConnector,
    pub evm_poll_interval: Duration,
}

/// A source of balances for one or more token kinds.
pub trait BalanceModule: Send + Sync {
    fn name(&self) -> &'static str;

    fn token_kinds(&self) -> &'static [TokenKind];

    /// Start watching `address` for `token`. Updates arrive on `on_update`
    /// until the returned handle is cancelled. Must be called inside a
    /// Tokio runtime.
    fn subscribe(
        &self,
        ctx: &ModuleContext,
        address: &str,
        token: &TokenRef,
        on_update: UpdateSink,
    ) -> Result<Unsubscribe, BalanceError>;
}

/// Maps every [`TokenKind`] to exactly one module.
#[derive(Clone)]
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn BalanceModule>>,
    by_kind: HashMap<TokenKind, usize>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.modules.iter().map(|m| m.name()).collect();
        f.debug_struct("ModuleRegistry").field("modules", &names).finish()
    }
}

impl ModuleRegistry {
    /// Fails unless each kind is served by exactly one module.
    pub fn new(modules: Vec<Arc<dyn BalanceModule>>) -> Result<Self, BalanceError> {
        let mut serving: HashMap<TokenKind, Vec<usize>> = HashMap::new();
        for (i, module) in modules.iter().enumerate() {
            for kind in module.token_kinds() {
                serving.entry(*kind).or_default().push(i);
            }
        }

        let mut problems = Vec::new();
        let mut by_kind = HashMap::new();
        for kind in TokenKind::ALL {
            match serving.get(&kind).map(Vec::as_slice) {
                Some([only]) => {
                    by_kind.insert(kind, *only);
                }
                Some(many) if many.len() > 1 => {
                    let names: Vec<&str> = many.iter().map(|&i| modules[i].name()).collect();
                    problems.push(format!("{kind} is served by {}", names.join(", ")));
                }
                _ => problems.push(format!("no module serves {kind}")),
            }
        }
        if !problems.is_empty() {
            return Err(BalanceError::Config(problems.join("; ")));
        }

        Ok(Self { modules, by_kind })
    }

    /// The built-in modules.
    pub fn with_defaults() -> Result<Self, BalanceError> {
        Self::new(vec![
            Arc::new(SubstrateNativeModule),
            Arc::new(SubstrateAssetsModule),
            Arc::new(SubstrateTokensModule),
            Arc::new(EvmNativeModule),
            Arc::new(EvmErc20Module),
        ])
    }

    pub fn module_for(&self, kind: TokenKind) -> Result<&Arc<dyn BalanceModule>, BalanceError> {
        self.by_kind
            .get(&kind)
            .map(|&i| &self.modules[i])
            .ok_or_else(|| BalanceError::Config(format!("no module serves {kind}")))
    }

    pub fn modules(&self) -> impl Iterator<Item = &Arc<dyn BalanceModule>> {
        self.modules.iter()
    }
}
