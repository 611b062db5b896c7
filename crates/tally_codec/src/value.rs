//! Dynamic values produced and consumed by the type-directed codec.

use std::fmt;

use primitive_types::U256;

/// A SCALE value shaped by the runtime type registry rather than by a
/// compile-time Rust type.
///
/// Unsigned integers of any width up to 128 bits decode as `U128`, signed
/// ones as `I128`. Sequences and arrays of `u8` decode as `Bytes`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Char(char),
    Str(String),
    U128(u128),
    I128(i128),
    U256(U256),
    /// Little-endian two's complement.
    I256([u8; 32]),
    Bytes(Vec<u8>),
    Composite(Composite),
    Variant { name: String, fields: Composite },
    Sequence(Vec<Value>),
    BitSequence(Vec<bool>),
}

/// Fields of a composite or variant, named or positional.
#[derive(Debug, Clone, PartialEq)]
pub enum Composite {
    Named(Vec<(String, Value)>),
    Unnamed(Vec<Value>),
}

impl Composite {
    pub fn len(&self) -> usize {
        match self {
            Self::Named(f) => f.len(),
            Self::Unnamed(f) => f.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Field values in declaration order.
    pub fn values(&self) -> Box<dyn Iterator<Item = &Value> + '_> {
        match self {
            Self::Named(f) => Box::new(f.iter().map(|(_, v)| v)),
            Self::Unnamed(f) => Box::new(f.iter()),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Self::Named(f) => f.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            Self::Unnamed(_) => None,
        }
    }
}

impl Value {
    pub fn named(fields: Vec<(&str, Value)>) -> Self {
        Self::Composite(Composite::Named(
            fields.into_iter().map(|(n, v)| (n.to_string(), v)).collect(),
        ))
    }

    pub fn unnamed(fields: Vec<Value>) -> Self {
        Self::Composite(Composite::Unnamed(fields))
    }

    pub fn variant(name: &str, fields: Vec<Value>) -> Self {
        Self::Variant {
            name: name.to_string(),
            fields: Composite::Unnamed(fields),
        }
    }

    pub fn unit_variant(name: &str) -> Self {
        Self::variant(name, Vec::new())
    }

    /// Named field lookup on composites and variants.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Self::Composite(c) | Self::Variant { fields: c, .. } => c.field(name),
            _ => None,
        }
    }

    /// Follow a path of named fields, e.g. `["data", "free"]`.
    pub fn at(&self, path: &[&str]) -> Option<&Value> {
        path.iter().try_fold(self, |v, name| v.field(name))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u128(&self) -> Option<u128> {
        match self {
            Self::U128(v) => Some(*v),
            Self::I128(v) => u128::try_from(*v).ok(),
            Self::U256(v) if v.bits() <= 128 => Some(v.low_u128()),
            _ => None,
        }
    }

    pub fn as_u256(&self) -> Option<U256> {
        match self {
            Self::U256(v) => Some(*v),
            other => other.as_u128().map(U256::from),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn variant_name(&self) -> Option<&str> {
        match self {
            Self::Variant { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Short description used in type-mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Char(_) => "char",
            Self::Str(_) => "str",
            Self::U128(_) => "unsigned integer",
            Self::I128(_) => "signed integer",
            Self::U256(_) => "u256",
            Self::I256(_) => "i256",
            Self::Bytes(_) => "bytes",
            Self::Composite(_) => "composite",
            Self::Variant { .. } => "variant",
            Self::Sequence(_) => "sequence",
            Self::BitSequence(_) => "bit sequence",
        }
    }

    /// Build a value from caller-supplied JSON (token parameters, test
    /// inputs). Objects become named composites, arrays sequences, `null`
    /// the unit value. The codec coerces these into variants, byte arrays
    /// and wrapper types as the target type requires.
    pub fn from_json(json: &serde_json::Value) -> Self {
        use serde_json::Value as J;
        match json {
            J::Null => Self::unnamed(Vec::new()),
            J::Bool(b) => Self::Bool(*b),
            J::Number(n) => {
                if let Some(u) = n.as_u64() {
                    Self::U128(u as u128)
                } else if let Some(i) = n.as_i64() {
                    Self::I128(i as i128)
                } else {
                    Self::Str(n.to_string())
                }
            }
            J::String(s) => Self::Str(s.clone()),
            J::Array(items) => Self::Sequence(items.iter().map(Self::from_json).collect()),
            J::Object(map) => Self::Composite(Composite::Named(
                map.iter().map(|(k, v)| (k.clone(), Self::from_json(v))).collect(),
            )),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Char(c) => write!(f, "{c:?}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::U128(v) => write!(f, "{v}"),
            Self::I128(v) => write!(f, "{v}"),
            Self::U256(v) => write!(f, "{v}"),
            Self::I256(b) => write!(f, "i256(0x{})", hex::encode(b)),
            Self::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
            Self::Composite(c) => write_composite(f, c),
            Self::Variant { name, fields } => {
                write!(f, "{name}")?;
                if fields.is_empty() {
                    Ok(())
                } else {
                    write_composite(f, fields)
                }
            }
            Self::Sequence(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Self::BitSequence(bits) => {
                write!(f, "0b")?;
                for b in bits {
                    write!(f, "{}", u8::from(*b))?;
                }
                Ok(())
            }
        }
    }
}

fn write_composite(f: &mut fmt::Formatter<'_>, c: &Composite) -> fmt::Result {
    match c {
        Composite::Named(fields) => {
            write!(f, "{{ ")?;
            for (i, (n, v)) in fields.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{n}: {v}")?;
            }
            write!(f, " }}")
        }
        Composite::Unnamed(fields) => {
            write!(f, "(")?;
            for (i, v) in fields.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{v}")?;
            }
            write!(f, ")")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_lookup_through_nested_composites() {
        let v = Value::named(vec![
            ("nonce", Value::U128(1)),
            (
                "data",
                Value::named(vec![("free", Value::U128(42)), ("reserved", Value::U128(0))]),
            ),
        ]);
        assert_eq!(v.at(&["data", "free"]).and_then(Value::as_u128), Some(42));
        assert!(v.at(&["data", "missing"]).is_none());
        assert!(v.at(&["nonce", "x"]).is_none());
    }

    #[test]
    fn integer_views() {
        assert_eq!(Value::I128(-1).as_u128(), None);
        assert_eq!(Value::I128(7).as_u128(), Some(7));
        assert_eq!(Value::U256(U256::MAX).as_u128(), None);
        assert_eq!(Value::U128(5).as_u256(), Some(U256::from(5u8)));
    }

    #[test]
    fn from_json_shapes() {
        let json = serde_json::json!({ "Token": "KSM" });
        let v = Value::from_json(&json);
        assert_eq!(v.field("Token").and_then(Value::as_str), Some("KSM"));

        assert_eq!(Value::from_json(&serde_json::json!(-3)), Value::I128(-3));
        assert_eq!(
            Value::from_json(&serde_json::json!([1, true])),
            Value::Sequence(vec![Value::U128(1), Value::Bool(true)])
        );
        assert_eq!(Value::from_json(&serde_json::Value::Null), Value::unnamed(vec![]));
    }

    #[test]
    fn display_is_compact() {
        let v = Value::variant("Token", vec![Value::unit_variant("KSM")]);
        assert_eq!(v.to_string(), "Token(KSM)");
        assert_eq!(Value::Bytes(vec![0xab, 0x01]).to_string(), "0xab01");
    }
}
