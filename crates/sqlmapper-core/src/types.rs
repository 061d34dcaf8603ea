//! Source (wire) and target (property) type identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The type a column reports on the wire, as captured from cursor metadata.
///
/// This is the coarse SQL type family, not a database-specific type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    Boolean,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Decimal,
    Char,
    Varchar,
    LongVarchar,
    Binary,
    VarBinary,
    Date,
    Time,
    Timestamp,
    Null,
    Other,
}

/// The type a property or parameter wants to receive.
///
/// Codec resolution is keyed by `(TargetType, SourceType)` pairs with the
/// fallback chain described on [`crate::codec::CodecRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetType {
    Bool,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Decimal,
    Text,
    Bytes,
    Json,
    /// No conversion requested; values pass through as read.
    Raw,
}

impl SourceType {
    /// The target type a column of this source type naturally decodes to.
    pub fn natural_target(self) -> TargetType {
        match self {
            SourceType::Boolean => TargetType::Bool,
            SourceType::TinyInt | SourceType::SmallInt => TargetType::Int16,
            SourceType::Integer => TargetType::Int32,
            SourceType::BigInt => TargetType::Int64,
            SourceType::Real => TargetType::Float32,
            SourceType::Double => TargetType::Float64,
            SourceType::Decimal => TargetType::Decimal,
            SourceType::Char | SourceType::Varchar | SourceType::LongVarchar => TargetType::Text,
            SourceType::Binary | SourceType::VarBinary => TargetType::Bytes,
            SourceType::Date | SourceType::Time | SourceType::Timestamp => TargetType::Text,
            SourceType::Null | SourceType::Other => TargetType::Raw,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Map a reported source-class name (the cursor's value-class hint) onto a
/// target type. Used as the second step of codec fallback when no exact
/// `(target, source)` pair is registered.
pub fn target_for_class(class_name: &str) -> Option<TargetType> {
    match class_name {
        "bool" => Some(TargetType::Bool),
        "i16" => Some(TargetType::Int16),
        "i32" => Some(TargetType::Int32),
        "i64" => Some(TargetType::Int64),
        "f32" => Some(TargetType::Float32),
        "f64" => Some(TargetType::Float64),
        "decimal" => Some(TargetType::Decimal),
        "String" | "str" => Some(TargetType::Text),
        "Vec<u8>" | "bytes" => Some(TargetType::Bytes),
        "json" => Some(TargetType::Json),
        _ => None,
    }
}
