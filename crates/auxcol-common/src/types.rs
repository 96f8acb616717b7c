//! Core type definitions for auxcol
//!
//! This module defines attribute identifiers, the closed logical type model
//! used to match on-disk column types against registered runtime types, and
//! the in-memory value representation of one decoded row.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Process-wide stable identifier of a (name, logical type) pair
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct AttributeId(u32);

impl AttributeId {
    /// Create from a raw index
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw index
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Get the raw index as a vector position
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttributeId({})", self.0)
    }
}

/// Set of attribute ids carried by a container instance.
///
/// Only grows: there is no removal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttributeSet(BTreeSet<AttributeId>);

impl AttributeSet {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an id, returns true if it was not present
    pub fn insert(&mut self, id: AttributeId) -> bool {
        self.0.insert(id)
    }

    /// Check membership
    #[must_use]
    pub fn contains(&self, id: AttributeId) -> bool {
        self.0.contains(&id)
    }

    /// Number of ids
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no ids are present
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = AttributeId> + '_ {
        self.0.iter().copied()
    }

    /// Add all ids of another set
    pub fn extend(&mut self, other: &Self) {
        self.0.extend(other.0.iter().copied());
    }
}

impl FromIterator<AttributeId> for AttributeSet {
    fn from_iter<I: IntoIterator<Item = AttributeId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Bit width requested for the packed encoding of a vector attribute
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackingHint {
    pub nbits: u8,
}

impl PackingHint {
    /// Smallest bit width accepted for floating point elements
    /// (sign, exponent and one mantissa bit)
    pub const MIN_FLOAT_NBITS: u8 = 10;

    /// Create a new hint
    #[must_use]
    pub const fn new(nbits: u8) -> Self {
        Self { nbits }
    }

    /// Check the bit width against the element type
    #[must_use]
    pub fn is_valid_for(&self, element: &LogicalType) -> bool {
        match element {
            LogicalType::F32 | LogicalType::F64 => {
                (Self::MIN_FLOAT_NBITS..=32).contains(&self.nbits)
            }
            _ => element.is_packable() && self.nbits >= 1 && u32::from(self.nbits) <= element.bit_width(),
        }
    }
}

/// Logical type of an attribute or of an on-disk column.
///
/// On-disk type names are parsed into this closed set through an explicit
/// alias table, so platform-dependent spellings of the same integer width
/// compare equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalType {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    String,
    Vector(Box<LogicalType>),
    /// Vector of scalars written with an explicit bit width
    Packed(Box<LogicalType>),
    /// On-disk type with no runtime mapping
    Unknown(String),
}

/// Scalar alias table: (logical type, accepted spellings).
/// The first spelling is the canonical name written to disk.
const SCALAR_NAMES: &[(LogicalType, &[&str])] = &[
    (LogicalType::Bool, &["bool", "Bool_t"]),
    (
        LogicalType::I8,
        &["char", "signed char", "Char_t", "int8_t", "std::int8_t"],
    ),
    (
        LogicalType::U8,
        &["unsigned char", "UChar_t", "uint8_t", "std::uint8_t"],
    ),
    (
        LogicalType::I16,
        &["short", "short int", "Short_t", "int16_t", "std::int16_t"],
    ),
    (
        LogicalType::U16,
        &[
            "unsigned short",
            "unsigned short int",
            "UShort_t",
            "uint16_t",
            "std::uint16_t",
        ],
    ),
    (
        LogicalType::I32,
        &["int", "Int_t", "int32_t", "std::int32_t"],
    ),
    (
        LogicalType::U32,
        &["unsigned int", "unsigned", "UInt_t", "uint32_t", "std::uint32_t"],
    ),
    (
        LogicalType::I64,
        &[
            "long",
            "long int",
            "long long",
            "long long int",
            "Long_t",
            "Long64_t",
            "int64_t",
            "std::int64_t",
        ],
    ),
    (
        LogicalType::U64,
        &[
            "unsigned long",
            "unsigned long int",
            "unsigned long long",
            "unsigned long long int",
            "ULong_t",
            "ULong64_t",
            "uint64_t",
            "std::uint64_t",
            "size_t",
            "std::size_t",
        ],
    ),
    (LogicalType::F32, &["float", "Float_t", "Float16_t"]),
    (LogicalType::F64, &["double", "Double_t", "Double32_t"]),
    (
        LogicalType::String,
        &[
            "std::string",
            "string",
            "basic_string<char>",
            "std::basic_string<char>",
        ],
    ),
];

const VECTOR_PREFIXES: &[&str] = &["std::vector<", "vector<"];
const PACKED_PREFIX: &str = "SG::PackedContainer<";

impl LogicalType {
    /// Parse an on-disk type name.
    ///
    /// Never fails: names outside the table become [`LogicalType::Unknown`].
    #[must_use]
    pub fn parse(name: &str) -> Self {
        let normalized = normalize_type_name(name);
        Self::parse_normalized(&normalized)
    }

    fn parse_normalized(name: &str) -> Self {
        if let Some(inner) = template_argument(name, PACKED_PREFIX) {
            return Self::Packed(Box::new(Self::parse_normalized(inner)));
        }
        for prefix in VECTOR_PREFIXES {
            if let Some(inner) = template_argument(name, prefix) {
                return Self::Vector(Box::new(Self::parse_normalized(inner)));
            }
        }
        SCALAR_NAMES
            .iter()
            .find(|(_, spellings)| spellings.contains(&name))
            .map_or_else(|| Self::Unknown(name.to_string()), |(ty, _)| ty.clone())
    }

    /// Canonical on-disk type name
    #[must_use]
    pub fn type_name(&self) -> String {
        match self {
            Self::Vector(inner) => format!("std::vector<{}>", inner.type_name()),
            Self::Packed(inner) => format!("{PACKED_PREFIX}{}>", inner.type_name()),
            Self::Unknown(name) => name.clone(),
            scalar => SCALAR_NAMES
                .iter()
                .find(|(ty, _)| ty == scalar)
                .map_or_else(String::new, |(_, spellings)| spellings[0].to_string()),
        }
    }

    /// True for numeric and boolean scalars
    #[must_use]
    pub const fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::Bool
                | Self::I8
                | Self::U8
                | Self::I16
                | Self::U16
                | Self::I32
                | Self::U32
                | Self::I64
                | Self::U64
                | Self::F32
                | Self::F64
        )
    }

    /// True for anything that is not a vector
    #[must_use]
    pub const fn is_scalar(&self) -> bool {
        self.is_numeric() || matches!(self, Self::String)
    }

    /// True for signed integer types
    #[must_use]
    pub const fn is_signed_integer(&self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }

    /// Width in bits of a numeric scalar, 0 otherwise
    #[must_use]
    pub const fn bit_width(&self) -> u32 {
        match self {
            Self::Bool | Self::I8 | Self::U8 => 8,
            Self::I16 | Self::U16 => 16,
            Self::I32 | Self::U32 | Self::F32 => 32,
            Self::I64 | Self::U64 | Self::F64 => 64,
            _ => 0,
        }
    }

    /// Element types the packed encoding supports
    #[must_use]
    pub const fn is_packable(&self) -> bool {
        matches!(
            self,
            Self::I8 | Self::U8 | Self::I16 | Self::U16 | Self::I32 | Self::U32 | Self::F32 | Self::F64
        )
    }

    /// True for packed vectors
    #[must_use]
    pub const fn is_packed(&self) -> bool {
        matches!(self, Self::Packed(_))
    }

    /// Element type of a vector or packed vector
    #[must_use]
    pub fn element(&self) -> Option<&Self> {
        match self {
            Self::Vector(inner) | Self::Packed(inner) => Some(inner),
            _ => None,
        }
    }

    /// The in-memory shape of this type: packed vectors decode to plain vectors
    #[must_use]
    pub fn unpacked(&self) -> Self {
        match self {
            Self::Packed(inner) => Self::Vector(inner.clone()),
            other => other.clone(),
        }
    }

    /// True if this type or any element type has no runtime mapping
    #[must_use]
    pub fn contains_unknown(&self) -> bool {
        match self {
            Self::Unknown(_) => true,
            Self::Vector(inner) | Self::Packed(inner) => inner.contains_unknown(),
            _ => false,
        }
    }

    /// Check whether values of this type can be coerced into `target`
    #[must_use]
    pub fn can_evolve_to(&self, target: &Self) -> bool {
        if self.contains_unknown() || target.contains_unknown() {
            return false;
        }
        match (self.unpacked(), target.unpacked()) {
            (a, b) if a.is_numeric() && b.is_numeric() => true,
            (Self::String, Self::String) => true,
            (Self::Vector(a), Self::Vector(b)) => a.can_evolve_to(&b),
            _ => false,
        }
    }

    /// Default value synthesized for rows that did not supply one
    #[must_use]
    pub fn default_value(&self) -> Option<Value> {
        Some(match self {
            Self::Bool => Value::Bool(false),
            Self::I8 => Value::I8(0),
            Self::U8 => Value::U8(0),
            Self::I16 => Value::I16(0),
            Self::U16 => Value::U16(0),
            Self::I32 => Value::I32(0),
            Self::U32 => Value::U32(0),
            Self::I64 => Value::I64(0),
            Self::U64 => Value::U64(0),
            Self::F32 => Value::F32(0.0),
            Self::F64 => Value::F64(0.0),
            Self::String => Value::String(String::new()),
            Self::Vector(_) | Self::Packed(_) => Value::List(Vec::new()),
            Self::Unknown(_) => return None,
        })
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.type_name())
    }
}

/// Collapse whitespace the way type names are spelled inconsistently on disk:
/// `std::vector< int >`, `vector<vector<int> >`, `unsigned  int`.
fn normalize_type_name(name: &str) -> String {
    let words: Vec<&str> = name.split_whitespace().collect();
    let mut out = String::with_capacity(name.len());
    for (i, word) in words.iter().enumerate() {
        if i > 0 {
            let prev = out.chars().last().unwrap_or(' ');
            let next = word.chars().next().unwrap_or(' ');
            let glue = matches!(prev, '<' | '>' | ',' | ':') || matches!(next, '<' | '>' | ',' | ':');
            if !glue {
                out.push(' ');
            }
        }
        out.push_str(word);
    }
    out
}

/// Extract the first template argument of `name` if it is `prefix...>`
fn template_argument<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    let body = name.strip_prefix(prefix)?.strip_suffix('>')?;
    let mut depth = 0usize;
    for (pos, c) in body.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => depth = depth.checked_sub(1)?,
            ',' if depth == 0 => return Some(&body[..pos]),
            _ => {}
        }
    }
    (depth == 0 && !body.is_empty()).then_some(body)
}

/// One decoded row of one attribute column
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    /// Elements of a vector or packed column
    List(Vec<Value>),
}

impl Value {
    /// Check that this value has the shape of `ty`
    #[must_use]
    pub fn conforms_to(&self, ty: &LogicalType) -> bool {
        match (self, ty) {
            (Self::Bool(_), LogicalType::Bool)
            | (Self::I8(_), LogicalType::I8)
            | (Self::U8(_), LogicalType::U8)
            | (Self::I16(_), LogicalType::I16)
            | (Self::U16(_), LogicalType::U16)
            | (Self::I32(_), LogicalType::I32)
            | (Self::U32(_), LogicalType::U32)
            | (Self::I64(_), LogicalType::I64)
            | (Self::U64(_), LogicalType::U64)
            | (Self::F32(_), LogicalType::F32)
            | (Self::F64(_), LogicalType::F64)
            | (Self::String(_), LogicalType::String) => true,
            (Self::List(items), LogicalType::Vector(inner) | LogicalType::Packed(inner)) => {
                items.iter().all(|v| v.conforms_to(inner))
            }
            _ => false,
        }
    }

    /// Number of elements for a list, 1 for a scalar
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::List(items) => items.len(),
            _ => 1,
        }
    }

    /// True for an empty list
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::List(items) if items.is_empty())
    }

    /// Elements of a list value
    #[must_use]
    pub fn as_list(&self) -> Option<&[Self]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Integer view of a numeric scalar (floats truncate toward zero)
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_i128(&self) -> Option<i128> {
        Some(match *self {
            Self::Bool(b) => i128::from(b),
            Self::I8(v) => i128::from(v),
            Self::U8(v) => i128::from(v),
            Self::I16(v) => i128::from(v),
            Self::U16(v) => i128::from(v),
            Self::I32(v) => i128::from(v),
            Self::U32(v) => i128::from(v),
            Self::I64(v) => i128::from(v),
            Self::U64(v) => i128::from(v),
            Self::F32(v) => v as i128,
            Self::F64(v) => v as i128,
            _ => return None,
        })
    }

    /// Floating point view of a numeric scalar
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        Some(match *self {
            Self::F32(v) => f64::from(v),
            Self::F64(v) => v,
            _ => self.as_i128()? as f64,
        })
    }

    /// Convert this value to `target`, the schema evolution path.
    ///
    /// Returns `None` when no coercion exists between the two shapes.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn coerce_to(&self, target: &LogicalType) -> Option<Self> {
        if self.conforms_to(target) {
            return Some(self.clone());
        }
        match (self, target.unpacked()) {
            (Self::String(s), LogicalType::String) => Some(Self::String(s.clone())),
            (Self::List(items), LogicalType::Vector(inner)) => items
                .iter()
                .map(|v| v.coerce_to(&inner))
                .collect::<Option<Vec<_>>>()
                .map(Self::List),
            (Self::List(_) | Self::String(_), _) => None,
            (scalar, ty) => {
                let is_float = matches!(scalar, Self::F32(_) | Self::F64(_));
                let int = scalar.as_i128()?;
                let float = scalar.as_f64()?;
                Some(match ty {
                    LogicalType::Bool => Self::Bool(if is_float { float != 0.0 } else { int != 0 }),
                    LogicalType::I8 => Self::I8(int as i8),
                    LogicalType::U8 => Self::U8(int as u8),
                    LogicalType::I16 => Self::I16(int as i16),
                    LogicalType::U16 => Self::U16(int as u16),
                    LogicalType::I32 => Self::I32(int as i32),
                    LogicalType::U32 => Self::U32(int as u32),
                    LogicalType::I64 => Self::I64(int as i64),
                    LogicalType::U64 => Self::U64(int as u64),
                    LogicalType::F32 => Self::F32(float as f32),
                    LogicalType::F64 => Self::F64(float),
                    _ => return None,
                })
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::I8(v) => write!(f, "{v}"),
            Self::U8(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::U64(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wide_integer_aliases() {
        for name in [
            "long",
            "long int",
            "long long",
            "Long64_t",
            "Long_t",
            "int64_t",
            "std::int64_t",
        ] {
            assert_eq!(LogicalType::parse(name), LogicalType::I64, "{name}");
        }
        for name in [
            "unsigned long",
            "unsigned long long",
            "ULong64_t",
            "uint64_t",
            "size_t",
        ] {
            assert_eq!(LogicalType::parse(name), LogicalType::U64, "{name}");
        }
        // Aliases never require schema evolution between each other
        assert_eq!(
            LogicalType::parse("vector<Long64_t>"),
            LogicalType::parse("std::vector<long long>")
        );
    }

    #[test]
    fn test_parse_templates() {
        assert_eq!(
            LogicalType::parse("std::vector< std::vector<float> >"),
            LogicalType::Vector(Box::new(LogicalType::Vector(Box::new(LogicalType::F32))))
        );
        assert_eq!(
            LogicalType::parse("std::vector<int,std::allocator<int> >"),
            LogicalType::Vector(Box::new(LogicalType::I32))
        );
        assert_eq!(
            LogicalType::parse("SG::PackedContainer<float>"),
            LogicalType::Packed(Box::new(LogicalType::F32))
        );
        assert_eq!(
            LogicalType::parse("ElementLink<xAOD::TrackParticleContainer>"),
            LogicalType::Unknown("ElementLink<xAOD::TrackParticleContainer>".into())
        );
        assert!(LogicalType::parse("std::vector<TLorentzVector>").contains_unknown());
    }

    #[test]
    fn test_canonical_names_reparse() {
        let types = [
            LogicalType::Bool,
            LogicalType::U16,
            LogicalType::I64,
            LogicalType::String,
            LogicalType::Vector(Box::new(LogicalType::U8)),
            LogicalType::Packed(Box::new(LogicalType::F32)),
        ];
        for ty in types {
            assert_eq!(LogicalType::parse(&ty.type_name()), ty);
        }
        assert_eq!(LogicalType::I64.type_name(), "long");
    }

    #[test]
    fn test_evolution_paths() {
        assert!(LogicalType::F32.can_evolve_to(&LogicalType::F64));
        assert!(LogicalType::I32.can_evolve_to(&LogicalType::I64));
        assert!(
            LogicalType::Packed(Box::new(LogicalType::F32))
                .can_evolve_to(&LogicalType::Vector(Box::new(LogicalType::F64)))
        );
        assert!(!LogicalType::String.can_evolve_to(&LogicalType::F32));
        assert!(!LogicalType::F32.can_evolve_to(&LogicalType::Vector(Box::new(LogicalType::F32))));
        assert!(!LogicalType::Unknown("X".into()).can_evolve_to(&LogicalType::Unknown("X".into())));
    }

    #[test]
    fn test_value_coercion() {
        assert_eq!(
            Value::F32(1.5).coerce_to(&LogicalType::F64),
            Some(Value::F64(1.5))
        );
        assert_eq!(Value::I32(-3).coerce_to(&LogicalType::I64), Some(Value::I64(-3)));
        assert_eq!(Value::U8(1).coerce_to(&LogicalType::Bool), Some(Value::Bool(true)));
        assert_eq!(
            Value::List(vec![Value::I32(1), Value::I32(2)])
                .coerce_to(&LogicalType::Vector(Box::new(LogicalType::F64))),
            Some(Value::List(vec![Value::F64(1.0), Value::F64(2.0)]))
        );
        assert_eq!(Value::String("a".into()).coerce_to(&LogicalType::F32), None);
    }

    #[test]
    fn test_defaults() {
        assert_eq!(LogicalType::I32.default_value(), Some(Value::I32(0)));
        assert_eq!(
            LogicalType::Vector(Box::new(LogicalType::F32)).default_value(),
            Some(Value::List(Vec::new()))
        );
        assert_eq!(LogicalType::Unknown("X".into()).default_value(), None);
    }

    #[test]
    fn test_packing_hint_validity() {
        assert!(PackingHint::new(16).is_valid_for(&LogicalType::F32));
        assert!(!PackingHint::new(8).is_valid_for(&LogicalType::F32));
        assert!(PackingHint::new(12).is_valid_for(&LogicalType::U16));
        assert!(!PackingHint::new(17).is_valid_for(&LogicalType::U16));
        assert!(!PackingHint::new(8).is_valid_for(&LogicalType::String));
    }

    #[test]
    fn test_attribute_set_grows() {
        let mut set = AttributeSet::new();
        assert!(set.insert(AttributeId::new(3)));
        assert!(!set.insert(AttributeId::new(3)));
        set.insert(AttributeId::new(1));
        let ids: Vec<u32> = set.iter().map(|id| id.as_u32()).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
