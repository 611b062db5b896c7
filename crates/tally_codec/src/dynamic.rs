//! Type-directed SCALE encoding and decoding of [`Value`]s.
//!
//! Encoding is forgiving about the *shape* of the input so that values built
//! from JSON can be used directly: a string names a unit variant, a
//! single-key object names a variant with payload, a `0x` string fills a byte
//! array, and a bare value fills a single-field wrapper type.

use parity_scale_codec::{Compact, Decode, Encode};
use primitive_types::U256;

use crate::error::CodecError;
use crate::metadata::{Field, Metadata, Primitive, TypeDef, TypeId};
use crate::value::{Composite, Value};

/// Maximum nesting of types followed while encoding or decoding.
pub const MAX_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode `value` as type `ty`.
pub fn encode_value(md: &Metadata, ty: TypeId, value: &Value) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    encode_into(md, ty, value, &mut out, 0)?;
    Ok(out)
}

fn encode_into(
    md: &Metadata,
    ty: TypeId,
    value: &Value,
    out: &mut Vec<u8>,
    depth: usize,
) -> Result<(), CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::DepthLimit);
    }
    let resolved = md.resolve(ty)?;
    match &resolved.type_def {
        TypeDef::Composite(fields) => encode_fields(md, fields, value, out, depth),
        TypeDef::Variant(variants) => {
            let (name, payload) = variant_parts(value)?;
            let variant = variants.iter().find(|v| v.name == name).ok_or_else(|| {
                CodecError::mismatch(
                    format!("variant of {}", resolved.path.join("::")),
                    format!("unknown variant {name}"),
                )
            })?;
            out.push(variant.index);
            encode_fields(md, &variant.fields, &payload, out, depth)
        }
        TypeDef::Sequence(elem) => {
            if let Some(bytes) = byte_input(md, *elem, value)? {
                Compact(bytes.len() as u32).encode_to(out);
                out.extend_from_slice(&bytes);
                return Ok(());
            }
            let items = sequence_items(value)?;
            Compact(items.len() as u32).encode_to(out);
            for item in items {
                encode_into(md, *elem, item, out, depth + 1)?;
            }
            Ok(())
        }
        TypeDef::Array { len, ty: elem } => {
            let len = *len as usize;
            if let Some(bytes) = byte_input(md, *elem, value)? {
                if bytes.len() != len {
                    return Err(CodecError::mismatch(
                        format!("[u8; {len}]"),
                        format!("{} bytes", bytes.len()),
                    ));
                }
                out.extend_from_slice(&bytes);
                return Ok(());
            }
            let items = sequence_items(value)?;
            if items.len() != len {
                return Err(CodecError::mismatch(
                    format!("array of {len}"),
                    format!("{} items", items.len()),
                ));
            }
            for item in items {
                encode_into(md, *elem, item, out, depth + 1)?;
            }
            Ok(())
        }
        TypeDef::Tuple(elems) => {
            if elems.len() == 1 && !matches!(value, Value::Composite(_) | Value::Sequence(_)) {
                return encode_into(md, elems[0], value, out, depth + 1);
            }
            let items = sequence_items(value)?;
            if items.len() != elems.len() {
                return Err(CodecError::mismatch(
                    format!("tuple of {}", elems.len()),
                    format!("{} items", items.len()),
                ));
            }
            for (elem, item) in elems.iter().zip(items) {
                encode_into(md, *elem, item, out, depth + 1)?;
            }
            Ok(())
        }
        TypeDef::Primitive(p) => encode_primitive(*p, value, out),
        TypeDef::Compact(inner) => {
            let n = compact_number(md, *inner, value, depth + 1)?;
            Compact(n).encode_to(out);
            Ok(())
        }
        TypeDef::BitSequence { store, order } => {
            let bits = match value {
                Value::BitSequence(bits) => bits,
                other => return Err(CodecError::mismatch("bit sequence", other.kind())),
            };
            let layout = bit_layout(md, *store, *order)?;
            Compact(bits.len() as u32).encode_to(out);
            for chunk in bits.chunks(layout.store_bits) {
                let mut word: u64 = 0;
                for (i, bit) in chunk.iter().enumerate() {
                    if *bit {
                        word |= 1u64 << layout.shift(i);
                    }
                }
                out.extend_from_slice(&word.to_le_bytes()[..layout.store_bits / 8]);
            }
            Ok(())
        }
    }
}

fn encode_fields(
    md: &Metadata,
    fields: &[Field],
    value: &Value,
    out: &mut Vec<u8>,
    depth: usize,
) -> Result<(), CodecError> {
    let wrap = fields.len() == 1;
    let items: Vec<&Value> = match value {
        Value::Composite(Composite::Named(named))
            if named.len() == fields.len() && fields.iter().all(|f| f.name.is_some()) =>
        {
            let by_name: Option<Vec<&Value>> = fields
                .iter()
                .map(|f| {
                    let name = f.name.as_deref().unwrap_or_default();
                    named.iter().find(|(n, _)| n == name).map(|(_, v)| v)
                })
                .collect();
            match by_name {
                Some(items) => items,
                None if wrap => return encode_into(md, fields[0].ty, value, out, depth + 1),
                None => {
                    return Err(CodecError::mismatch(
                        format!("fields {}", field_names(fields)),
                        "differently named fields",
                    ));
                }
            }
        }
        Value::Composite(c) if c.len() == fields.len() => c.values().collect(),
        Value::Sequence(items) if items.len() == fields.len() => items.iter().collect(),
        // One-field wrappers such as `AccountId32` accept their inner value.
        _ if wrap => return encode_into(md, fields[0].ty, value, out, depth + 1),
        other => {
            return Err(CodecError::mismatch(
                format!("composite of {} fields", fields.len()),
                other.kind(),
            ));
        }
    };
    for (field, item) in fields.iter().zip(items) {
        encode_into(md, field.ty, item, out, depth + 1)?;
    }
    Ok(())
}

fn field_names(fields: &[Field]) -> String {
    fields
        .iter()
        .map(|f| f.name.as_deref().unwrap_or("_"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Items of a positional container: sequence, unnamed composite, or the
/// values of a named composite in order.
fn sequence_items(value: &Value) -> Result<Vec<&Value>, CodecError> {
    match value {
        Value::Sequence(items) => Ok(items.iter().collect()),
        Value::Composite(c) => Ok(c.values().collect()),
        other => Err(CodecError::mismatch("sequence", other.kind())),
    }
}

fn variant_parts(value: &Value) -> Result<(String, Value), CodecError> {
    match value {
        Value::Variant { name, fields } => Ok((name.clone(), Value::Composite(fields.clone()))),
        Value::Str(name) => Ok((name.clone(), Value::unnamed(Vec::new()))),
        Value::Composite(Composite::Named(fields)) if fields.len() == 1 => {
            Ok((fields[0].0.clone(), fields[0].1.clone()))
        }
        other => Err(CodecError::mismatch("variant", other.kind())),
    }
}

fn is_u8(md: &Metadata, ty: TypeId) -> Result<bool, CodecError> {
    Ok(matches!(
        md.resolve(ty)?.type_def,
        TypeDef::Primitive(Primitive::U8)
    ))
}

/// Raw bytes for a `u8` container, if the value is given as bytes or hex.
fn byte_input(md: &Metadata, elem: TypeId, value: &Value) -> Result<Option<Vec<u8>>, CodecError> {
    if !is_u8(md, elem)? {
        return Ok(None);
    }
    match value {
        Value::Bytes(b) => Ok(Some(b.clone())),
        Value::Str(s) if s.starts_with("0x") => Ok(Some(hex::decode(&s[2..])?)),
        _ => Ok(None),
    }
}

fn unsigned(value: &Value) -> Result<U256, CodecError> {
    match value {
        Value::U128(v) => Ok(U256::from(*v)),
        Value::U256(v) => Ok(*v),
        Value::I128(v) if *v >= 0 => Ok(U256::from(*v as u128)),
        Value::Str(s) => U256::from_dec_str(s)
            .map_err(|_| CodecError::mismatch("unsigned integer", format!("string {s:?}"))),
        other => Err(CodecError::mismatch("unsigned integer", other.kind())),
    }
}

fn signed(value: &Value) -> Result<i128, CodecError> {
    match value {
        Value::I128(v) => Ok(*v),
        Value::U128(v) => {
            i128::try_from(*v).map_err(|_| CodecError::OutOfRange(format!("{v} as i128")))
        }
        Value::Str(s) => s
            .parse()
            .map_err(|_| CodecError::mismatch("signed integer", format!("string {s:?}"))),
        other => Err(CodecError::mismatch("signed integer", other.kind())),
    }
}

fn encode_primitive(p: Primitive, value: &Value, out: &mut Vec<u8>) -> Result<(), CodecError> {
    match p {
        Primitive::Bool => match value {
            Value::Bool(b) => b.encode_to(out),
            other => return Err(CodecError::mismatch("bool", other.kind())),
        },
        Primitive::Char => match value {
            Value::Char(c) => (*c as u32).encode_to(out),
            other => return Err(CodecError::mismatch("char", other.kind())),
        },
        Primitive::Str => match value {
            Value::Str(s) => s.encode_to(out),
            other => return Err(CodecError::mismatch("str", other.kind())),
        },
        Primitive::U8 | Primitive::U16 | Primitive::U32 | Primitive::U64 | Primitive::U128 => {
            let width = p.width().unwrap_or(16);
            let v = unsigned(value)?;
            if v.bits() > width * 8 {
                return Err(CodecError::OutOfRange(format!("{v} does not fit {p:?}")));
            }
            out.extend_from_slice(&v.low_u128().to_le_bytes()[..width]);
        }
        Primitive::U256 => {
            let mut buf = [0u8; 32];
            unsigned(value)?.to_little_endian(&mut buf);
            out.extend_from_slice(&buf);
        }
        Primitive::I8 | Primitive::I16 | Primitive::I32 | Primitive::I64 | Primitive::I128 => {
            let width = p.width().unwrap_or(16);
            let v = signed(value)?;
            let bits = (width * 8) as u32;
            if bits < 128 {
                let min = -(1i128 << (bits - 1));
                let max = (1i128 << (bits - 1)) - 1;
                if v < min || v > max {
                    return Err(CodecError::OutOfRange(format!("{v} does not fit {p:?}")));
                }
            }
            out.extend_from_slice(&v.to_le_bytes()[..width]);
        }
        Primitive::I256 => match value {
            Value::I256(bytes) => out.extend_from_slice(bytes),
            other => {
                let v = signed(other)?;
                let fill = if v < 0 { 0xff } else { 0x00 };
                let mut buf = [fill; 32];
                buf[..16].copy_from_slice(&v.to_le_bytes());
                out.extend_from_slice(&buf);
            }
        },
    }
    Ok(())
}

fn compact_number(md: &Metadata, inner: TypeId, value: &Value, depth: usize) -> Result<u128, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::DepthLimit);
    }
    match &md.resolve(inner)?.type_def {
        TypeDef::Primitive(_) => {
            let v = unsigned(value)?;
            if v.bits() > 128 {
                return Err(CodecError::OutOfRange(format!("{v} does not fit compact u128")));
            }
            Ok(v.low_u128())
        }
        TypeDef::Composite(fields) if fields.len() == 1 => {
            let v = match value {
                Value::Composite(c) if c.len() == 1 => c.values().next().unwrap_or(value),
                other => other,
            };
            compact_number(md, fields[0].ty, v, depth + 1)
        }
        _ => Err(CodecError::Unsupported("compact of non-integer type".into())),
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a value of type `ty`, requiring `bytes` to be consumed exactly.
pub fn decode_value(md: &Metadata, ty: TypeId, bytes: &[u8]) -> Result<Value, CodecError> {
    let input = &mut &bytes[..];
    let value = decode_from(md, ty, input, 0)?;
    if !input.is_empty() {
        return Err(CodecError::TrailingBytes(input.len()));
    }
    Ok(value)
}

/// Decode a value of type `ty` from the front of `input`, advancing it.
pub fn decode_prefix(md: &Metadata, ty: TypeId, input: &mut &[u8]) -> Result<Value, CodecError> {
    decode_from(md, ty, input, 0)
}

fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], CodecError> {
    if input.len() < n {
        return Err(CodecError::Scale(format!(
            "need {n} bytes, {} remaining",
            input.len()
        )));
    }
    let (head, tail) = input.split_at(n);
    *input = tail;
    Ok(head)
}

fn decode_from(
    md: &Metadata,
    ty: TypeId,
    input: &mut &[u8],
    depth: usize,
) -> Result<Value, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::DepthLimit);
    }
    let resolved = md.resolve(ty)?;
    match &resolved.type_def {
        TypeDef::Composite(fields) => Ok(Value::Composite(decode_fields(md, fields, input, depth)?)),
        TypeDef::Variant(variants) => {
            let index = u8::decode(input)?;
            let variant = variants.iter().find(|v| v.index == index).ok_or_else(|| {
                CodecError::mismatch(
                    format!("variant of {}", resolved.path.join("::")),
                    format!("index {index}"),
                )
            })?;
            Ok(Value::Variant {
                name: variant.name.clone(),
                fields: decode_fields(md, &variant.fields, input, depth)?,
            })
        }
        TypeDef::Sequence(elem) => {
            let len = <Compact<u32>>::decode(input)?.0 as usize;
            if is_u8(md, *elem)? {
                return Ok(Value::Bytes(take(input, len)?.to_vec()));
            }
            // Every element is at least one byte except zero-sized types;
            // cap the preallocation by what is left.
            let mut items = Vec::with_capacity(len.min(input.len()));
            for _ in 0..len {
                items.push(decode_from(md, *elem, input, depth + 1)?);
            }
            Ok(Value::Sequence(items))
        }
        TypeDef::Array { len, ty: elem } => {
            let len = *len as usize;
            if is_u8(md, *elem)? {
                return Ok(Value::Bytes(take(input, len)?.to_vec()));
            }
            let mut items = Vec::with_capacity(len.min(input.len()));
            for _ in 0..len {
                items.push(decode_from(md, *elem, input, depth + 1)?);
            }
            Ok(Value::Sequence(items))
        }
        TypeDef::Tuple(elems) => {
            let mut items = Vec::with_capacity(elems.len());
            for elem in elems {
                items.push(decode_from(md, *elem, input, depth + 1)?);
            }
            Ok(Value::Composite(Composite::Unnamed(items)))
        }
        TypeDef::Primitive(p) => decode_primitive(*p, input),
        TypeDef::Compact(inner) => decode_compact(md, *inner, input, depth + 1),
        TypeDef::BitSequence { store, order } => {
            let layout = bit_layout(md, *store, *order)?;
            let len = <Compact<u32>>::decode(input)?.0 as usize;
            let words = len.div_ceil(layout.store_bits);
            let raw = take(input, words * layout.store_bits / 8)?;
            let mut bits = Vec::with_capacity(len);
            for chunk in raw.chunks(layout.store_bits / 8) {
                let mut buf = [0u8; 8];
                buf[..chunk.len()].copy_from_slice(chunk);
                let word = u64::from_le_bytes(buf);
                for i in 0..layout.store_bits {
                    if bits.len() == len {
                        break;
                    }
                    bits.push((word >> layout.shift(i)) & 1 == 1);
                }
            }
            Ok(Value::BitSequence(bits))
        }
    }
}

fn decode_fields(
    md: &Metadata,
    fields: &[Field],
    input: &mut &[u8],
    depth: usize,
) -> Result<Composite, CodecError> {
    if !fields.is_empty() && fields.iter().all(|f| f.name.is_some()) {
        let mut named = Vec::with_capacity(fields.len());
        for field in fields {
            let v = decode_from(md, field.ty, input, depth + 1)?;
            named.push((field.name.clone().unwrap_or_default(), v));
        }
        Ok(Composite::Named(named))
    } else {
        let mut unnamed = Vec::with_capacity(fields.len());
        for field in fields {
            unnamed.push(decode_from(md, field.ty, input, depth + 1)?);
        }
        Ok(Composite::Unnamed(unnamed))
    }
}

fn decode_primitive(p: Primitive, input: &mut &[u8]) -> Result<Value, CodecError> {
    Ok(match p {
        Primitive::Bool => Value::Bool(bool::decode(input)?),
        Primitive::Char => {
            let raw = u32::decode(input)?;
            Value::Char(
                char::from_u32(raw).ok_or_else(|| CodecError::Scale(format!("invalid char {raw}")))?,
            )
        }
        Primitive::Str => Value::Str(String::decode(input)?),
        Primitive::U8 | Primitive::U16 | Primitive::U32 | Primitive::U64 | Primitive::U128 => {
            let width = p.width().unwrap_or(16);
            let mut buf = [0u8; 16];
            buf[..width].copy_from_slice(take(input, width)?);
            Value::U128(u128::from_le_bytes(buf))
        }
        Primitive::U256 => Value::U256(U256::from_little_endian(take(input, 32)?)),
        Primitive::I8 | Primitive::I16 | Primitive::I32 | Primitive::I64 | Primitive::I128 => {
            let width = p.width().unwrap_or(16);
            let raw = take(input, width)?;
            let fill = if raw[width - 1] & 0x80 != 0 { 0xff } else { 0x00 };
            let mut buf = [fill; 16];
            buf[..width].copy_from_slice(raw);
            Value::I128(i128::from_le_bytes(buf))
        }
        Primitive::I256 => {
            let mut buf = [0u8; 32];
            buf.copy_from_slice(take(input, 32)?);
            Value::I256(buf)
        }
    })
}

fn decode_compact(md: &Metadata, inner: TypeId, input: &mut &[u8], depth: usize) -> Result<Value, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::DepthLimit);
    }
    match &md.resolve(inner)?.type_def {
        TypeDef::Primitive(_) => Ok(Value::U128(<Compact<u128>>::decode(input)?.0)),
        TypeDef::Composite(fields) if fields.len() == 1 => {
            let v = decode_compact(md, fields[0].ty, input, depth + 1)?;
            Ok(Value::Composite(match &fields[0].name {
                Some(name) => Composite::Named(vec![(name.clone(), v)]),
                None => Composite::Unnamed(vec![v]),
            }))
        }
        _ => Err(CodecError::Unsupported("compact of non-integer type".into())),
    }
}

// ---------------------------------------------------------------------------
// Bit sequences
// ---------------------------------------------------------------------------

struct BitLayout {
    store_bits: usize,
    msb_first: bool,
}

impl BitLayout {
    fn shift(&self, i: usize) -> usize {
        if self.msb_first {
            self.store_bits - 1 - i
        } else {
            i
        }
    }
}

fn bit_layout(md: &Metadata, store: TypeId, order: TypeId) -> Result<BitLayout, CodecError> {
    let store_bits = match md.resolve(store)?.type_def {
        TypeDef::Primitive(Primitive::U8) => 8,
        TypeDef::Primitive(Primitive::U16) => 16,
        TypeDef::Primitive(Primitive::U32) => 32,
        TypeDef::Primitive(Primitive::U64) => 64,
        _ => return Err(CodecError::Unsupported("bit store type".into())),
    };
    let msb_first = match md.resolve(order)?.path_ident() {
        Some("Lsb0") => false,
        Some("Msb0") => true,
        other => {
            return Err(CodecError::Unsupported(format!(
                "bit order {}",
                other.unwrap_or("<anonymous>")
            )));
        }
    };
    Ok(BitLayout {
        store_bits,
        msb_first,
    })
}
