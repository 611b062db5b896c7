//! Runtime metadata (V14) as served by `state_getMetadata`.
//!
//! The types below mirror the SCALE layout of `RuntimeMetadataPrefixed` in
//! its portable form, so a metadata blob decodes straight into them with the
//! derived [`Decode`] impls. Only V14 is accepted.

use std::collections::HashMap;

use parity_scale_codec::{Decode, Encode};

use crate::error::CodecError;

/// `"meta"` little-endian.
pub const META_MAGIC: u32 = 0x6174_656d;
pub const METADATA_VERSION: u8 = 14;

// ---------------------------------------------------------------------------
// Portable type registry
// ---------------------------------------------------------------------------

/// Reference into the portable type registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub struct TypeId(#[codec(compact)] pub u32);

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct PortableRegistry {
    pub types: Vec<PortableType>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct PortableType {
    #[codec(compact)]
    pub id: u32,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Type {
    pub path: Vec<String>,
    pub type_params: Vec<TypeParameter>,
    pub type_def: TypeDef,
    pub docs: Vec<String>,
}

impl Type {
    pub fn new(path: &[&str], type_def: TypeDef) -> Self {
        Self {
            path: path.iter().map(|s| s.to_string()).collect(),
            type_params: Vec::new(),
            type_def,
            docs: Vec::new(),
        }
    }

    pub fn path_ident(&self) -> Option<&str> {
        self.path.last().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct TypeParameter {
    pub name: String,
    pub ty: Option<TypeId>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum TypeDef {
    Composite(Vec<Field>),
    Variant(Vec<Variant>),
    Sequence(TypeId),
    Array { len: u32, ty: TypeId },
    Tuple(Vec<TypeId>),
    Primitive(Primitive),
    Compact(TypeId),
    BitSequence { store: TypeId, order: TypeId },
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Field {
    pub name: Option<String>,
    pub ty: TypeId,
    pub type_name: Option<String>,
    pub docs: Vec<String>,
}

impl Field {
    pub fn named(name: &str, ty: u32) -> Self {
        Self {
            name: Some(name.to_string()),
            ty: TypeId(ty),
            type_name: None,
            docs: Vec::new(),
        }
    }

    pub fn unnamed(ty: u32) -> Self {
        Self {
            name: None,
            ty: TypeId(ty),
            type_name: None,
            docs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Variant {
    pub name: String,
    pub fields: Vec<Field>,
    pub index: u8,
    pub docs: Vec<String>,
}

impl Variant {
    pub fn new(name: &str, index: u8, fields: Vec<Field>) -> Self {
        Self {
            name: name.to_string(),
            fields,
            index,
            docs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum Primitive {
    Bool,
    Char,
    Str,
    U8,
    U16,
    U32,
    U64,
    U128,
    U256,
    I8,
    I16,
    I32,
    I64,
    I128,
    I256,
}

impl Primitive {
    /// Encoded width in bytes for fixed-size numeric primitives.
    pub fn width(self) -> Option<usize> {
        match self {
            Self::U8 | Self::I8 => Some(1),
            Self::U16 | Self::I16 => Some(2),
            Self::U32 | Self::I32 => Some(4),
            Self::U64 | Self::I64 => Some(8),
            Self::U128 | Self::I128 => Some(16),
            Self::U256 | Self::I256 => Some(32),
            Self::Bool | Self::Char | Self::Str => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Pallets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct PalletMetadata {
    pub name: String,
    pub storage: Option<PalletStorage>,
    pub calls: Option<TypeId>,
    pub event: Option<TypeId>,
    pub constants: Vec<PalletConstant>,
    pub error: Option<TypeId>,
    pub index: u8,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct PalletStorage {
    pub prefix: String,
    pub entries: Vec<StorageEntry>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct StorageEntry {
    pub name: String,
    pub modifier: StorageModifier,
    pub ty: StorageEntryType,
    pub default: Vec<u8>,
    pub docs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum StorageModifier {
    Optional,
    Default,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum StorageEntryType {
    Plain(TypeId),
    Map {
        hashers: Vec<StorageHasher>,
        key: TypeId,
        value: TypeId,
    },
}

impl StorageEntryType {
    pub fn value_ty(&self) -> TypeId {
        match self {
            Self::Plain(ty) => *ty,
            Self::Map { value, .. } => *value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
#[allow(non_camel_case_types)]
pub enum StorageHasher {
    Blake2_128,
    Blake2_256,
    Blake2_128Concat,
    Twox128,
    Twox256,
    Twox64Concat,
    Identity,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct PalletConstant {
    pub name: String,
    pub ty: TypeId,
    pub value: Vec<u8>,
    pub docs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct ExtrinsicMetadata {
    pub ty: TypeId,
    pub version: u8,
    pub signed_extensions: Vec<SignedExtension>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct SignedExtension {
    pub identifier: String,
    pub ty: TypeId,
    pub additional_signed: TypeId,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct RuntimeMetadataV14 {
    pub types: PortableRegistry,
    pub pallets: Vec<PalletMetadata>,
    pub extrinsic: ExtrinsicMetadata,
    pub ty: TypeId,
}

// ---------------------------------------------------------------------------
// Metadata handle
// ---------------------------------------------------------------------------

/// Parsed runtime metadata with an id → type index.
#[derive(Debug, Clone)]
pub struct Metadata {
    inner: RuntimeMetadataV14,
    type_index: HashMap<u32, usize>,
}

impl Metadata {
    pub fn new(inner: RuntimeMetadataV14) -> Self {
        let type_index = inner
            .types
            .types
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id, i))
            .collect();
        Self { inner, type_index }
    }

    /// Parse a `RuntimeMetadataPrefixed` blob.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let input = &mut &bytes[..];
        let magic = u32::decode(input)?;
        if magic != META_MAGIC {
            return Err(CodecError::Metadata(format!("bad magic 0x{magic:08x}")));
        }
        let version = u8::decode(input)?;
        if version != METADATA_VERSION {
            return Err(CodecError::Metadata(format!(
                "unsupported metadata version V{version}"
            )));
        }
        let inner = RuntimeMetadataV14::decode(input)?;
        if !input.is_empty() {
            return Err(CodecError::TrailingBytes(input.len()));
        }
        Ok(Self::new(inner))
    }

    /// Parse the hex string returned by `state_getMetadata`.
    pub fn from_hex(hex_str: &str) -> Result<Self, CodecError> {
        let bytes = hex::decode(hex_str.trim_start_matches("0x"))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = META_MAGIC.encode();
        out.push(METADATA_VERSION);
        self.inner.encode_to(&mut out);
        out
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.to_bytes()))
    }

    pub fn inner(&self) -> &RuntimeMetadataV14 {
        &self.inner
    }

    pub fn resolve(&self, id: TypeId) -> Result<&Type, CodecError> {
        self.type_index
            .get(&id.0)
            .map(|&i| &self.inner.types.types[i].ty)
            .ok_or(CodecError::UnknownType(id.0))
    }

    pub fn pallet(&self, name: &str) -> Result<&PalletMetadata, CodecError> {
        self.inner
            .pallets
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| CodecError::UnknownPallet(name.to_string()))
    }

    /// Look up a storage entry together with its pallet's storage prefix.
    pub fn storage_entry(&self, pallet: &str, item: &str) -> Result<(&str, &StorageEntry), CodecError> {
        let storage = self
            .pallet(pallet)?
            .storage
            .as_ref()
            .ok_or_else(|| CodecError::UnknownStorage {
                pallet: pallet.to_string(),
                item: item.to_string(),
            })?;
        let entry = storage
            .entries
            .iter()
            .find(|e| e.name == item)
            .ok_or_else(|| CodecError::UnknownStorage {
                pallet: pallet.to_string(),
                item: item.to_string(),
            })?;
        Ok((storage.prefix.as_str(), entry))
    }

    pub fn has_storage(&self, pallet: &str, item: &str) -> bool {
        self.storage_entry(pallet, item).is_ok()
    }

    pub fn constant_entry(&self, pallet: &str, name: &str) -> Result<&PalletConstant, CodecError> {
        self.pallet(pallet)?
            .constants
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| CodecError::UnknownConstant {
                pallet: pallet.to_string(),
                name: name.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

/// A small hand-built runtime exposing the storage items the balance modules
/// read: `System.Account`, `Assets.Account`, `Tokens.Accounts`, and the
/// `Balances.ExistentialDeposit` constant.
#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures {
    use super::*;

    pub const U8: u32 = 0;
    pub const U32: u32 = 1;
    pub const U64: u32 = 2;
    pub const U128: u32 = 3;
    pub const BYTES32: u32 = 4;
    pub const ACCOUNT_ID: u32 = 5;
    pub const ACCOUNT_DATA: u32 = 6;
    pub const ACCOUNT_INFO: u32 = 7;
    pub const ASSET_ACCOUNT_STATUS: u32 = 8;
    pub const EXISTENCE_REASON: u32 = 9;
    pub const UNIT: u32 = 10;
    pub const ASSET_ACCOUNT: u32 = 11;
    pub const ASSET_KEY: u32 = 12;
    pub const TOKEN_SYMBOL: u32 = 13;
    pub const CURRENCY_ID: u32 = 14;
    pub const ORML_ACCOUNT_DATA: u32 = 15;
    pub const TOKENS_KEY: u32 = 16;
    pub const COMPACT_U128: u32 = 17;
    pub const BOOL: u32 = 18;
    pub const BYTES: u32 = 19;
    pub const STR: u32 = 20;
    pub const BITS: u32 = 21;
    pub const LSB0: u32 = 22;
    pub const I64: u32 = 23;

    pub const EXISTENTIAL_DEPOSIT: u128 = 10_000_000_000;

    /// Fixture with the current `AccountData { free, reserved, frozen, flags }`.
    pub fn metadata() -> Metadata {
        build(false)
    }

    /// Fixture with the pre-2023 `AccountData { free, reserved, misc_frozen, fee_frozen }`.
    pub fn legacy_metadata() -> Metadata {
        build(true)
    }

    fn prim(p: Primitive) -> Type {
        Type::new(&[], TypeDef::Primitive(p))
    }

    fn build(legacy: bool) -> Metadata {
        let account_data = if legacy {
            vec![
                Field::named("free", U128),
                Field::named("reserved", U128),
                Field::named("misc_frozen", U128),
                Field::named("fee_frozen", U128),
            ]
        } else {
            vec![
                Field::named("free", U128),
                Field::named("reserved", U128),
                Field::named("frozen", U128),
                Field::named("flags", U128),
            ]
        };

        let types = vec![
            prim(Primitive::U8),
            prim(Primitive::U32),
            prim(Primitive::U64),
            prim(Primitive::U128),
            Type::new(&[], TypeDef::Array { len: 32, ty: TypeId(U8) }),
            Type::new(
                &["sp_core", "crypto", "AccountId32"],
                TypeDef::Composite(vec![Field::unnamed(BYTES32)]),
            ),
            Type::new(
                &["pallet_balances", "types", "AccountData"],
                TypeDef::Composite(account_data),
            ),
            Type::new(
                &["frame_system", "AccountInfo"],
                TypeDef::Composite(vec![
                    Field::named("nonce", U32),
                    Field::named("consumers", U32),
                    Field::named("providers", U32),
                    Field::named("sufficients", U32),
                    Field::named("data", ACCOUNT_DATA),
                ]),
            ),
            Type::new(
                &["pallet_assets", "types", "AccountStatus"],
                TypeDef::Variant(vec![
                    Variant::new("Liquid", 0, vec![]),
                    Variant::new("Frozen", 1, vec![]),
                    Variant::new("Blocked", 2, vec![]),
                ]),
            ),
            Type::new(
                &["pallet_assets", "types", "ExistenceReason"],
                TypeDef::Variant(vec![
                    Variant::new("Consumer", 0, vec![]),
                    Variant::new("Sufficient", 1, vec![]),
                    Variant::new("DepositHeld", 2, vec![Field::unnamed(U128)]),
                    Variant::new("DepositRefunded", 3, vec![]),
                ]),
            ),
            Type::new(&[], TypeDef::Tuple(vec![])),
            Type::new(
                &["pallet_assets", "types", "AssetAccount"],
                TypeDef::Composite(vec![
                    Field::named("balance", U128),
                    Field::named("status", ASSET_ACCOUNT_STATUS),
                    Field::named("reason", EXISTENCE_REASON),
                    Field::named("extra", UNIT),
                ]),
            ),
            Type::new(&[], TypeDef::Tuple(vec![TypeId(U32), TypeId(ACCOUNT_ID)])),
            Type::new(
                &["acala_primitives", "currency", "TokenSymbol"],
                TypeDef::Variant(vec![
                    Variant::new("ACA", 0, vec![]),
                    Variant::new("AUSD", 1, vec![]),
                    Variant::new("DOT", 2, vec![]),
                    Variant::new("LDOT", 3, vec![]),
                    Variant::new("KAR", 128, vec![]),
                    Variant::new("KUSD", 129, vec![]),
                    Variant::new("KSM", 130, vec![]),
                ]),
            ),
            Type::new(
                &["acala_primitives", "currency", "CurrencyId"],
                TypeDef::Variant(vec![
                    Variant::new("Token", 0, vec![Field::unnamed(TOKEN_SYMBOL)]),
                    Variant::new("ForeignAsset", 5, vec![Field::unnamed(U32)]),
                ]),
            ),
            Type::new(
                &["orml_tokens", "AccountData"],
                TypeDef::Composite(vec![
                    Field::named("free", U128),
                    Field::named("reserved", U128),
                    Field::named("frozen", U128),
                ]),
            ),
            Type::new(
                &[],
                TypeDef::Tuple(vec![TypeId(ACCOUNT_ID), TypeId(CURRENCY_ID)]),
            ),
            Type::new(&[], TypeDef::Compact(TypeId(U128))),
            prim(Primitive::Bool),
            Type::new(&[], TypeDef::Sequence(TypeId(U8))),
            prim(Primitive::Str),
            Type::new(
                &[],
                TypeDef::BitSequence {
                    store: TypeId(U8),
                    order: TypeId(LSB0),
                },
            ),
            Type::new(&["bitvec", "order", "Lsb0"], TypeDef::Composite(vec![])),
            prim(Primitive::I64),
        ];

        let account_info_default = vec![0u8; 4 * 4 + 4 * 16];
        let orml_default = vec![0u8; 3 * 16];

        let pallets = vec![
            PalletMetadata {
                name: "System".into(),
                storage: Some(PalletStorage {
                    prefix: "System".into(),
                    entries: vec![StorageEntry {
                        name: "Account".into(),
                        modifier: StorageModifier::Default,
                        ty: StorageEntryType::Map {
                            hashers: vec![StorageHasher::Blake2_128Concat],
                            key: TypeId(ACCOUNT_ID),
                            value: TypeId(ACCOUNT_INFO),
                        },
                        default: account_info_default,
                        docs: vec![],
                    }],
                }),
                calls: None,
                event: None,
                constants: vec![],
                error: None,
                index: 0,
            },
            PalletMetadata {
                name: "Balances".into(),
                storage: None,
                calls: None,
                event: None,
                constants: vec![PalletConstant {
                    name: "ExistentialDeposit".into(),
                    ty: TypeId(U128),
                    value: EXISTENTIAL_DEPOSIT.encode(),
                    docs: vec![],
                }],
                error: None,
                index: 10,
            },
            PalletMetadata {
                name: "Assets".into(),
                storage: Some(PalletStorage {
                    prefix: "Assets".into(),
                    entries: vec![StorageEntry {
                        name: "Account".into(),
                        modifier: StorageModifier::Optional,
                        ty: StorageEntryType::Map {
                            hashers: vec![
                                StorageHasher::Blake2_128Concat,
                                StorageHasher::Blake2_128Concat,
                            ],
                            key: TypeId(ASSET_KEY),
                            value: TypeId(ASSET_ACCOUNT),
                        },
                        default: vec![0],
                        docs: vec![],
                    }],
                }),
                calls: None,
                event: None,
                constants: vec![],
                error: None,
                index: 50,
            },
            PalletMetadata {
                name: "Tokens".into(),
                storage: Some(PalletStorage {
                    prefix: "Tokens".into(),
                    entries: vec![StorageEntry {
                        name: "Accounts".into(),
                        modifier: StorageModifier::Default,
                        ty: StorageEntryType::Map {
                            hashers: vec![
                                StorageHasher::Blake2_128Concat,
                                StorageHasher::Twox64Concat,
                            ],
                            key: TypeId(TOKENS_KEY),
                            value: TypeId(ORML_ACCOUNT_DATA),
                        },
                        default: orml_default,
                        docs: vec![],
                    }],
                }),
                calls: None,
                event: None,
                constants: vec![],
                error: None,
                index: 60,
            },
        ];

        Metadata::new(RuntimeMetadataV14 {
            types: PortableRegistry {
                types: types
                    .into_iter()
                    .enumerate()
                    .map(|(id, ty)| PortableType { id: id as u32, ty })
                    .collect(),
            },
            pallets,
            extrinsic: ExtrinsicMetadata {
                ty: TypeId(UNIT),
                version: 4,
                signed_extensions: vec![],
            },
            ty: TypeId(UNIT),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_survives_byte_round_trip() {
        let md = fixtures::metadata();
        let parsed = Metadata::from_bytes(&md.to_bytes()).unwrap();
        assert_eq!(parsed.inner(), md.inner());
        assert!(parsed.has_storage("System", "Account"));
        assert!(parsed.has_storage("Tokens", "Accounts"));
        assert!(!parsed.has_storage("Tokens", "Nope"));
    }

    #[test]
    fn hex_prefix_is_optional() {
        let md = fixtures::metadata();
        let hex_str = md.to_hex();
        assert!(hex_str.starts_with("0x6d657461"));
        assert!(Metadata::from_hex(&hex_str).is_ok());
        assert!(Metadata::from_hex(&hex_str[2..]).is_ok());
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut bytes = fixtures::metadata().to_bytes();
        bytes[4] = 15;
        assert!(matches!(
            Metadata::from_bytes(&bytes),
            Err(CodecError::Metadata(msg)) if msg.contains("V15")
        ));
        bytes[0] = 0;
        assert!(matches!(Metadata::from_bytes(&bytes), Err(CodecError::Metadata(_))));
    }

    #[test]
    fn truncated_blob_is_an_error() {
        let bytes = fixtures::metadata().to_bytes();
        assert!(Metadata::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn lookups_report_what_is_missing() {
        let md = fixtures::metadata();
        assert!(matches!(md.pallet("Staking"), Err(CodecError::UnknownPallet(p)) if p == "Staking"));
        assert!(md.constant_entry("Balances", "ExistentialDeposit").is_ok());
        assert!(matches!(
            md.constant_entry("Balances", "MaxLocks"),
            Err(CodecError::UnknownConstant { .. })
        ));
        assert!(matches!(md.resolve(TypeId(999)), Err(CodecError::UnknownType(999))));
    }
}
