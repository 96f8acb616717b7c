//! Value encoding for column entries
//!
//! Every entry of an attribute column is one [`Value`] encoded little endian:
//!
//! - numeric scalars at their natural width, `bool` as one byte
//! - strings as `u32` length followed by UTF-8 bytes
//! - vectors as `u32` element count followed by the encoded elements
//! - packed vectors as `u32` element count followed by the elements packed
//!   into `nbits` bits each, LSB first
//!
//! The packed encoding keeps the low `nbits` bits of integers (sign extended
//! again on decode for signed types) and the top `nbits` bits of the IEEE-754
//! single precision representation of floats. Doubles are packed through
//! single precision.

use auxcol_common::{Error, LogicalType, PackingHint, Result, Value};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// How a column entry is decoded.
///
/// `packed_nbits` is the bit width stored with a packed column; decoding a
/// packed type without it fails. `evolve_to` requests coercion of the decoded
/// value into the registered type.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    pub packed_nbits: Option<u8>,
    pub evolve_to: Option<LogicalType>,
}

impl DecodeOptions {
    /// Options for a column with no packing and no evolution
    #[must_use]
    pub fn plain() -> Self {
        Self::default()
    }

    /// Set the packed bit width
    #[must_use]
    pub const fn with_packed_nbits(mut self, nbits: u8) -> Self {
        self.packed_nbits = Some(nbits);
        self
    }

    /// Set the evolution target
    #[must_use]
    pub fn with_evolve_to(mut self, target: LogicalType) -> Self {
        self.evolve_to = Some(target);
        self
    }
}

/// Encode `value` as an entry of a column of type `ty`.
///
/// `nbits` is required when `ty` is packed.
pub fn encode(value: &Value, ty: &LogicalType, nbits: Option<u8>) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    encode_into(&mut buf, value, ty, nbits)?;
    Ok(buf.freeze())
}

fn shape_error(value: &Value, ty: &LogicalType) -> Error {
    Error::invalid_argument(format!("value {value} does not match column type {ty}"))
}

#[allow(clippy::cast_possible_truncation)]
fn encode_into(buf: &mut BytesMut, value: &Value, ty: &LogicalType, nbits: Option<u8>) -> Result<()> {
    match (value, ty) {
        (Value::Bool(v), LogicalType::Bool) => buf.put_u8(u8::from(*v)),
        (Value::I8(v), LogicalType::I8) => buf.put_i8(*v),
        (Value::U8(v), LogicalType::U8) => buf.put_u8(*v),
        (Value::I16(v), LogicalType::I16) => buf.put_i16_le(*v),
        (Value::U16(v), LogicalType::U16) => buf.put_u16_le(*v),
        (Value::I32(v), LogicalType::I32) => buf.put_i32_le(*v),
        (Value::U32(v), LogicalType::U32) => buf.put_u32_le(*v),
        (Value::I64(v), LogicalType::I64) => buf.put_i64_le(*v),
        (Value::U64(v), LogicalType::U64) => buf.put_u64_le(*v),
        (Value::F32(v), LogicalType::F32) => buf.put_f32_le(*v),
        (Value::F64(v), LogicalType::F64) => buf.put_f64_le(*v),
        (Value::String(s), LogicalType::String) => {
            buf.put_u32_le(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        (Value::List(items), LogicalType::Vector(inner)) => {
            buf.put_u32_le(items.len() as u32);
            for item in items {
                encode_into(buf, item, inner, None)?;
            }
        }
        (Value::List(items), LogicalType::Packed(inner)) => {
            let nbits = nbits.ok_or_else(|| {
                Error::invalid_argument(format!("packed column type {ty} requires a bit width"))
            })?;
            check_packing(inner, nbits)?;
            buf.put_u32_le(items.len() as u32);
            let mut writer = BitWriter::new(buf, nbits);
            for item in items {
                writer.push(pack_element(item, inner, nbits).ok_or_else(|| shape_error(item, inner))?);
            }
            writer.finish();
        }
        _ => return Err(shape_error(value, ty)),
    }
    Ok(())
}

/// Decode one column entry of on-disk type `ty`.
///
/// Packed types decode to plain vectors. With `evolve_to` set the decoded
/// value is coerced; a missing coercion path is a type error.
pub fn decode(data: &[u8], ty: &LogicalType, opts: &DecodeOptions) -> Result<Value> {
    let mut cursor = data;
    let value = decode_from(&mut cursor, ty, opts)?;
    if cursor.has_remaining() {
        return Err(Error::format(format!(
            "{} trailing bytes after {ty} entry",
            cursor.remaining()
        )));
    }

    match &opts.evolve_to {
        Some(target) if !value.conforms_to(target) => value.coerce_to(target).ok_or_else(|| {
            Error::type_error(
                ty.type_name(),
                format!("no conversion from {ty} to {target}"),
            )
        }),
        _ => Ok(value),
    }
}

fn need(cursor: &&[u8], n: usize, ty: &LogicalType) -> Result<()> {
    if cursor.remaining() < n {
        return Err(Error::format(format!("entry truncated while decoding {ty}")));
    }
    Ok(())
}

fn decode_from(cursor: &mut &[u8], ty: &LogicalType, opts: &DecodeOptions) -> Result<Value> {
    need(cursor, scalar_size(ty), ty)?;
    Ok(match ty {
        LogicalType::Bool => Value::Bool(cursor.get_u8() != 0),
        LogicalType::I8 => Value::I8(cursor.get_i8()),
        LogicalType::U8 => Value::U8(cursor.get_u8()),
        LogicalType::I16 => Value::I16(cursor.get_i16_le()),
        LogicalType::U16 => Value::U16(cursor.get_u16_le()),
        LogicalType::I32 => Value::I32(cursor.get_i32_le()),
        LogicalType::U32 => Value::U32(cursor.get_u32_le()),
        LogicalType::I64 => Value::I64(cursor.get_i64_le()),
        LogicalType::U64 => Value::U64(cursor.get_u64_le()),
        LogicalType::F32 => Value::F32(cursor.get_f32_le()),
        LogicalType::F64 => Value::F64(cursor.get_f64_le()),
        LogicalType::String => {
            let len = cursor.get_u32_le() as usize;
            need(cursor, len, ty)?;
            let text = std::str::from_utf8(&cursor[..len])
                .map_err(|e| Error::format(format!("invalid UTF-8 in string entry: {e}")))?
                .to_string();
            cursor.advance(len);
            Value::String(text)
        }
        LogicalType::Vector(inner) => {
            let count = cursor.get_u32_le() as usize;
            // Every element takes at least one byte
            let mut items = Vec::with_capacity(count.min(cursor.remaining()));
            for _ in 0..count {
                items.push(decode_from(cursor, inner, &DecodeOptions::plain())?);
            }
            Value::List(items)
        }
        LogicalType::Packed(inner) => {
            let nbits = opts.packed_nbits.ok_or_else(|| {
                Error::type_error(
                    ty.type_name(),
                    "packed column decoded without a bit width",
                )
            })?;
            check_packing(inner, nbits)?;
            let count = cursor.get_u32_le() as usize;
            let body = count.saturating_mul(usize::from(nbits)).div_ceil(8);
            need(cursor, body, ty)?;
            let mut reader = BitReader::new(&cursor[..body], nbits);
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(unpack_element(reader.read(), inner, nbits));
            }
            cursor.advance(body);
            Value::List(items)
        }
        LogicalType::Unknown(name) => {
            return Err(Error::type_error(
                name.clone(),
                "column type has no runtime mapping",
            ));
        }
    })
}

/// Bytes consumed before the variable part of an entry
const fn scalar_size(ty: &LogicalType) -> usize {
    match ty {
        LogicalType::Bool | LogicalType::I8 | LogicalType::U8 => 1,
        LogicalType::I16 | LogicalType::U16 => 2,
        LogicalType::I32
        | LogicalType::U32
        | LogicalType::F32
        | LogicalType::String
        | LogicalType::Vector(_)
        | LogicalType::Packed(_) => 4,
        LogicalType::I64 | LogicalType::U64 | LogicalType::F64 => 8,
        LogicalType::Unknown(_) => 0,
    }
}

fn check_packing(element: &LogicalType, nbits: u8) -> Result<()> {
    if PackingHint::new(nbits).is_valid_for(element) {
        Ok(())
    } else {
        Err(Error::invalid_argument(format!(
            "bit width {nbits} is not valid for packed {element}"
        )))
    }
}

const fn low_mask(nbits: u8) -> u64 {
    if nbits >= 64 { u64::MAX } else { (1u64 << nbits) - 1 }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn pack_element(value: &Value, element: &LogicalType, nbits: u8) -> Option<u64> {
    let raw = match (value, element) {
        (Value::F32(v), LogicalType::F32) => u64::from(v.to_bits() >> (32 - u32::from(nbits))),
        (Value::F64(v), LogicalType::F64) => {
            u64::from((*v as f32).to_bits() >> (32 - u32::from(nbits)))
        }
        (v, ty) if v.conforms_to(ty) => v.as_i128()? as u64,
        _ => return None,
    };
    Some(raw & low_mask(nbits))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn unpack_element(raw: u64, element: &LogicalType, nbits: u8) -> Value {
    let shift = 64 - u32::from(nbits);
    let signed = ((raw << shift) as i64) >> shift;
    match element {
        LogicalType::F32 => Value::F32(f32::from_bits((raw as u32) << (32 - u32::from(nbits)))),
        LogicalType::F64 => Value::F64(f64::from(f32::from_bits(
            (raw as u32) << (32 - u32::from(nbits)),
        ))),
        LogicalType::I8 => Value::I8(signed as i8),
        LogicalType::I16 => Value::I16(signed as i16),
        LogicalType::I32 => Value::I32(signed as i32),
        LogicalType::U8 => Value::U8(raw as u8),
        LogicalType::U16 => Value::U16(raw as u16),
        _ => Value::U32(raw as u32),
    }
}

/// Appends fixed-width values LSB first
struct BitWriter<'a> {
    buf: &'a mut BytesMut,
    nbits: u8,
    acc: u64,
    filled: u32,
}

impl<'a> BitWriter<'a> {
    fn new(buf: &'a mut BytesMut, nbits: u8) -> Self {
        Self {
            buf,
            nbits,
            acc: 0,
            filled: 0,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn push(&mut self, raw: u64) {
        self.acc |= raw << self.filled;
        self.filled += u32::from(self.nbits);
        while self.filled >= 8 {
            self.buf.put_u8(self.acc as u8);
            self.acc >>= 8;
            self.filled -= 8;
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn finish(self) {
        if self.filled > 0 {
            self.buf.put_u8(self.acc as u8);
        }
    }
}

/// Reads fixed-width values written by [`BitWriter`]
struct BitReader<'a> {
    data: &'a [u8],
    nbits: u8,
    acc: u64,
    filled: u32,
}

impl<'a> BitReader<'a> {
    const fn new(data: &'a [u8], nbits: u8) -> Self {
        Self {
            data,
            nbits,
            acc: 0,
            filled: 0,
        }
    }

    fn read(&mut self) -> u64 {
        let want = u32::from(self.nbits);
        while self.filled < want {
            let byte = self.data.first().copied().unwrap_or(0);
            if !self.data.is_empty() {
                self.data = &self.data[1..];
            }
            self.acc |= u64::from(byte) << self.filled;
            self.filled += 8;
        }
        let raw = self.acc & low_mask(self.nbits);
        self.acc >>= want;
        self.filled -= want;
        raw
    }
}
