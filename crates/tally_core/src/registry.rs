//! Chain registry: static descriptions of chains, EVM networks and tokens.
//!
//! The registry is owned by the host application and handed to the
//! connectors read-only. Custom RPC overrides replace a chain's endpoint list
//! wholesale, mirroring how a settings screen would edit them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::TallyError;

/// Identifies a Substrate chain or an EVM network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum ChainRef {
    Substrate { id: String, genesis_hash: String },
    Evm { chain_id: u64 },
}

impl ChainRef {
    pub fn substrate(id: impl Into<String>, genesis_hash: impl Into<String>) -> Self {
        Self::Substrate {
            id: id.into(),
            genesis_hash: genesis_hash.into(),
        }
    }

    pub fn evm(chain_id: u64) -> Self {
        Self::Evm { chain_id }
    }

    /// The chain-or-network id used in balance identity keys and as the
    /// registry key.
    pub fn key(&self) -> String {
        match self {
            Self::Substrate { id, .. } => id.clone(),
            Self::Evm { chain_id } => chain_id.to_string(),
        }
    }

    /// Whether this reference points at an EVM network.
    pub fn is_evm(&self) -> bool {
        matches!(self, Self::Evm { .. })
    }
}

impl fmt::Display for ChainRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Substrate { id, .. } => write!(f, "substrate:{id}"),
            Self::Evm { chain_id } => write!(f, "evm:{chain_id}"),
        }
    }
}

/// The closed set of token kinds the engine knows how to track.
///
/// Adding a kind means adding a variant here and a module serving it in the
/// balance module registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenKind {
    SubstrateNative,
    SubstrateAssets,
    SubstrateTokens,
    EvmNative,
    EvmErc20,
}

impl TokenKind {
    pub const ALL: [TokenKind; 5] = [
        TokenKind::SubstrateNative,
        TokenKind::SubstrateAssets,
        TokenKind::SubstrateTokens,
        TokenKind::EvmNative,
        TokenKind::EvmErc20,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubstrateNative => "substrate-native",
            Self::SubstrateAssets => "substrate-assets",
            Self::SubstrateTokens => "substrate-tokens",
            Self::EvmNative => "evm-native",
            Self::EvmErc20 => "evm-erc20",
        }
    }

    pub fn is_evm(&self) -> bool {
        matches!(self, Self::EvmNative | Self::EvmErc20)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific token parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TokenParams {
    Native,
    /// pallet-assets asset index.
    Asset { asset_id: u128 },
    /// ORML tokens currency id, in the JSON shape of the on-chain enum
    /// (e.g. `{"Token": "KSM"}`).
    Currency { currency_id: serde_json::Value },
    /// ERC-20 contract address (`0x`-prefixed, 20 bytes).
    Erc20 { contract: String },
}

/// A token on a chain or network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRef {
    /// Globally unique token id, e.g. `polkadot-substrate-native`.
    pub id: String,
    pub symbol: String,
    pub decimals: u8,
    pub chain: ChainRef,
    pub kind: TokenKind,
    pub params: TokenParams,
}

impl TokenRef {
    pub fn substrate_native(chain: &ChainRef, symbol: &str, decimals: u8) -> Self {
        Self {
            id: format!("{}-substrate-native", chain.key()),
            symbol: symbol.into(),
            decimals,
            chain: chain.clone(),
            kind: TokenKind::SubstrateNative,
            params: TokenParams::Native,
        }
    }

    pub fn substrate_asset(chain: &ChainRef, asset_id: u128, symbol: &str, decimals: u8) -> Self {
        Self {
            id: format!("{}-substrate-assets-{asset_id}", chain.key()),
            symbol: symbol.into(),
            decimals,
            chain: chain.clone(),
            kind: TokenKind::SubstrateAssets,
            params: TokenParams::Asset { asset_id },
        }
    }

    pub fn substrate_tokens(
        chain: &ChainRef,
        currency_id: serde_json::Value,
        symbol: &str,
        decimals: u8,
    ) -> Self {
        Self {
            id: format!("{}-substrate-tokens-{}", chain.key(), symbol.to_lowercase()),
            symbol: symbol.into(),
            decimals,
            chain: chain.clone(),
            kind: TokenKind::SubstrateTokens,
            params: TokenParams::Currency { currency_id },
        }
    }

    pub fn evm_native(chain: &ChainRef, symbol: &str, decimals: u8) -> Self {
        Self {
            id: format!("{}-evm-native", chain.key()),
            symbol: symbol.into(),
            decimals,
            chain: chain.clone(),
            kind: TokenKind::EvmNative,
            params: TokenParams::Native,
        }
    }

    pub fn evm_erc20(chain: &ChainRef, contract: &str, symbol: &str, decimals: u8) -> Self {
        Self {
            id: format!("{}-evm-erc20-{}", chain.key(), contract.to_lowercase()),
            symbol: symbol.into(),
            decimals,
            chain: chain.clone(),
            kind: TokenKind::EvmErc20,
            params: TokenParams::Erc20 {
                contract: contract.to_lowercase(),
            },
        }
    }

    /// Check that the kind, params and chain family agree.
    pub fn validate(&self) -> Result<(), TallyError> {
        let params_ok = matches!(
            (&self.kind, &self.params),
            (TokenKind::SubstrateNative, TokenParams::Native)
                | (TokenKind::EvmNative, TokenParams::Native)
                | (TokenKind::SubstrateAssets, TokenParams::Asset { .. })
                | (TokenKind::SubstrateTokens, TokenParams::Currency { .. })
                | (TokenKind::EvmErc20, TokenParams::Erc20 { .. })
        );
        if !params_ok {
            return Err(TallyError::Config(format!(
                "token {} has params that do not match kind {}",
                self.id, self.kind
            )));
        }
        if self.kind.is_evm() != self.chain.is_evm() {
            return Err(TallyError::Config(format!(
                "token {} of kind {} is attached to {}",
                self.id, self.kind, self.chain
            )));
        }
        Ok(())
    }
}

/// A chain or network together with its ordered RPC endpoint list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub chain: ChainRef,
    pub name: String,
    pub rpcs: Vec<String>,
    #[serde(default)]
    pub is_custom: bool,
}

/// Holds chain descriptions and token definitions, keyed by
/// [`ChainRef::key`] and token id respectively.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainRegistry {
    chains: BTreeMap<String, ChainInfo>,
    tokens: BTreeMap<String, TokenRef>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with a handful of well-known public chains.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let polkadot = ChainRef::substrate(
            "polkadot",
            "0x91b171bb158e2d3848fa23a9f1c25182fb8e20313b2c1eb49219da7a70ce90c3",
        );
        let kusama = ChainRef::substrate(
            "kusama",
            "0xb0a8d493285c2df73290dfb7e61f870f17b41801197a149ca93654499ea3dafe",
        );
        let ethereum = ChainRef::evm(1);
        let base = ChainRef::evm(8453);

        let defaults = [
            (
                polkadot.clone(),
                "Polkadot",
                vec![
                    "wss://rpc.polkadot.io",
                    "wss://polkadot-rpc.dwellir.com",
                    "wss://polkadot.api.onfinality.io/public-ws",
                ],
            ),
            (
                kusama.clone(),
                "Kusama",
                vec!["wss://kusama-rpc.polkadot.io", "wss://kusama-rpc.dwellir.com"],
            ),
            (
                ethereum.clone(),
                "Ethereum Mainnet",
                vec!["https://eth.llamarpc.com", "https://rpc.ankr.com/eth"],
            ),
            (base.clone(), "Base Mainnet", vec!["https://mainnet.base.org"]),
        ];
        for (chain, name, rpcs) in defaults {
            registry.chains.insert(
                chain.key(),
                ChainInfo {
                    chain,
                    name: name.into(),
                    rpcs: rpcs.into_iter().map(String::from).collect(),
                    is_custom: false,
                },
            );
        }

        for token in [
            TokenRef::substrate_native(&polkadot, "DOT", 10),
            TokenRef::substrate_native(&kusama, "KSM", 12),
            TokenRef::evm_native(&ethereum, "ETH", 18),
            TokenRef::evm_native(&base, "ETH", 18),
            TokenRef::evm_erc20(
                &ethereum,
                "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48",
                "USDC",
                6,
            ),
        ] {
            registry.tokens.insert(token.id.clone(), token);
        }
        registry
    }

    /// Register a chain. Every endpoint must be a valid URL for its family.
    pub fn add_chain(&mut self, info: ChainInfo) -> Result<(), TallyError> {
        if info.rpcs.is_empty() {
            return Err(TallyError::Config(format!("{} has no RPC endpoints", info.chain)));
        }
        for url in &info.rpcs {
            if !validate_url(url, &info.chain) {
                return Err(TallyError::InvalidEndpoint(url.clone()));
            }
        }
        self.chains.insert(info.chain.key(), info);
        Ok(())
    }

    pub fn chain(&self, key: &str) -> Option<&ChainInfo> {
        self.chains.get(key)
    }

    pub fn chains(&self) -> impl Iterator<Item = &ChainInfo> {
        self.chains.values()
    }

    /// Ordered endpoint list for a chain.
    pub fn endpoints(&self, key: &str) -> Result<&[String], TallyError> {
        self.chains
            .get(key)
            .map(|c| c.rpcs.as_slice())
            .ok_or_else(|| TallyError::UnknownChain(key.to_string()))
    }

    /// Replace a chain's endpoints with user-supplied ones.
    pub fn set_custom_rpcs(&mut self, key: &str, rpcs: Vec<String>) -> Result<(), TallyError> {
        let info = self
            .chains
            .get_mut(key)
            .ok_or_else(|| TallyError::UnknownChain(key.to_string()))?;
        if rpcs.is_empty() {
            return Err(TallyError::Config(format!("{key}: custom RPC list is empty")));
        }
        if let Some(bad) = rpcs.iter().find(|u| !validate_url(u, &info.chain)) {
            return Err(TallyError::InvalidEndpoint(bad.clone()));
        }
        info.rpcs = rpcs;
        info.is_custom = true;
        Ok(())
    }

    /// Register a token. Its chain must already be known.
    pub fn add_token(&mut self, token: TokenRef) -> Result<(), TallyError> {
        token.validate()?;
        if !self.chains.contains_key(&token.chain.key()) {
            return Err(TallyError::UnknownChain(token.chain.key()));
        }
        self.tokens.insert(token.id.clone(), token);
        Ok(())
    }

    pub fn token(&self, id: &str) -> Option<&TokenRef> {
        self.tokens.get(id)
    }

    pub fn tokens(&self) -> impl Iterator<Item = &TokenRef> {
        self.tokens.values()
    }

    pub fn tokens_for_chain<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a TokenRef> + 'a {
        self.tokens.values().filter(move |t| t.chain.key() == key)
    }

    /// Persist the registry to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize registry")?;
        std::fs::write(path, json).context("failed to write registry file")?;
        info!(path = %path.display(), chains = self.chains.len(), "chain registry saved");
        Ok(())
    }

    /// Load a registry from a JSON file, falling back to the defaults when
    /// the file does not exist.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "registry file not found, using defaults");
            return Ok(Self::with_defaults());
        }
        let json = std::fs::read_to_string(path).context("failed to read registry file")?;
        let registry: Self =
            serde_json::from_str(&json).context("failed to deserialize registry")?;
        info!(path = %path.display(), chains = registry.chains.len(), "chain registry loaded");
        Ok(registry)
    }
}

/// Validate that a URL is well-formed and uses a scheme suitable for the
/// chain family: websockets for Substrate, HTTP(S) for EVM JSON-RPC.
pub fn validate_url(url: &str, chain: &ChainRef) -> bool {
    match url::Url::parse(url) {
        Ok(parsed) => {
            let scheme = parsed.scheme();
            let scheme_ok = if chain.is_evm() {
                scheme == "http" || scheme == "https"
            } else {
                scheme == "ws" || scheme == "wss"
            };
            scheme_ok && parsed.host().is_some()
        }
        Err(_) => false,
    }
}
