//! Codec capability: converting a column's wire value into a property value.
//!
//! A [`Codec`] adapts one value. The [`CodecRegistry`] resolves which codec
//! applies for a `(TargetType, SourceType)` pair with the fallback chain:
//! exact pair, then the column's reported source class combined with the
//! source type, then the source type alone, then a generic passthrough.

use crate::error::{Error, Result, TypeError};
use crate::row::{ColumnMeta, Row};
use crate::types::{SourceType, TargetType, target_for_class};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A read adapter for one value.
pub trait Codec: Send + Sync {
    /// The target type this codec produces.
    fn target(&self) -> TargetType;

    /// Convert a non-null value into canonical target form.
    fn decode(&self, value: &Value) -> Result<Value>;

    /// Read a column from a row and decode it. NULL passes through; a
    /// missing column is a mapping error.
    fn read(&self, row: &Row, column: &str) -> Result<Value> {
        let value = row.get_by_name(column).ok_or_else(|| {
            Error::mapping_column(column, "column not present in result set")
        })?;
        if value.is_null() {
            return Ok(Value::Null);
        }
        self.decode(value).map_err(|e| match e {
            Error::Type(mut te) => {
                te.column = Some(column.to_string());
                Error::Type(te)
            }
            e => e,
        })
    }
}

fn type_err(expected: &'static str, actual: &Value) -> Error {
    Error::Type(TypeError {
        expected,
        actual: actual.type_name().to_string(),
        column: None,
    })
}

/// Converts values into one fixed target type using the widening rules the
/// value model supports.
struct ConvertCodec {
    target: TargetType,
}

impl Codec for ConvertCodec {
    fn target(&self) -> TargetType {
        self.target
    }

    fn decode(&self, value: &Value) -> Result<Value> {
        match self.target {
            TargetType::Bool => value
                .as_bool()
                .map(Value::Bool)
                .ok_or_else(|| type_err("bool", value)),
            TargetType::Int16 => value
                .as_i64()
                .and_then(|v| i16::try_from(v).ok())
                .map(Value::SmallInt)
                .ok_or_else(|| type_err("i16", value)),
            TargetType::Int32 => value
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(Value::Int)
                .ok_or_else(|| type_err("i32", value)),
            TargetType::Int64 => value
                .as_i64()
                .map(Value::BigInt)
                .ok_or_else(|| type_err("i64", value)),
            TargetType::Float32 => value
                .as_f64()
                .map(|v| Value::Float(v as f32))
                .ok_or_else(|| type_err("f32", value)),
            TargetType::Float64 => value
                .as_f64()
                .map(Value::Double)
                .ok_or_else(|| type_err("f64", value)),
            TargetType::Decimal => match value {
                Value::Decimal(s) | Value::Text(s) => Ok(Value::Decimal(s.clone())),
                v if v.as_f64().is_some() => Ok(Value::Decimal(v.to_string())),
                v => Err(type_err("decimal", v)),
            },
            TargetType::Text => match value {
                Value::Text(s) => Ok(Value::Text(s.clone())),
                Value::Bytes(_) => Err(type_err("text", value)),
                v => Ok(Value::Text(v.to_string())),
            },
            TargetType::Bytes => match value {
                Value::Bytes(b) => Ok(Value::Bytes(b.clone())),
                Value::Text(s) => Ok(Value::Bytes(s.as_bytes().to_vec())),
                v => Err(type_err("bytes", v)),
            },
            TargetType::Json => match value {
                Value::Json(j) => Ok(Value::Json(j.clone())),
                Value::Text(s) => serde_json::from_str(s).map(Value::Json).map_err(|e| {
                    Error::Type(TypeError {
                        expected: "valid JSON",
                        actual: format!("invalid JSON: {e}"),
                        column: None,
                    })
                }),
                v => Err(type_err("json", v)),
            },
            TargetType::Raw => Ok(value.clone()),
        }
    }
}

/// The terminal fallback: values pass through untouched.
struct PassthroughCodec;

impl Codec for PassthroughCodec {
    fn target(&self) -> TargetType {
        TargetType::Raw
    }

    fn decode(&self, value: &Value) -> Result<Value> {
        Ok(value.clone())
    }
}

/// Registry of codecs keyed by `(TargetType, SourceType)` pairs.
pub struct CodecRegistry {
    pairs: HashMap<(TargetType, SourceType), Arc<dyn Codec>>,
    targets: HashMap<TargetType, Arc<dyn Codec>>,
    passthrough: Arc<dyn Codec>,
}

impl CodecRegistry {
    /// Build a registry pre-populated with the standard conversions.
    pub fn new() -> Self {
        let mut registry = Self {
            pairs: HashMap::new(),
            targets: HashMap::new(),
            passthrough: Arc::new(PassthroughCodec),
        };

        use SourceType::{
            BigInt, Binary, Boolean, Char, Date, Decimal, Double, Integer, LongVarchar, Other,
            Real, SmallInt, Time, Timestamp, TinyInt, VarBinary, Varchar,
        };
        use TargetType as T;

        let numeric = [Boolean, TinyInt, SmallInt, Integer, BigInt];
        for target in [
            T::Bool,
            T::Int16,
            T::Int32,
            T::Int64,
            T::Float32,
            T::Float64,
            T::Decimal,
            T::Text,
            T::Bytes,
            T::Json,
            T::Raw,
        ] {
            registry.register_target(target, Arc::new(ConvertCodec { target }));
        }
        for source in numeric {
            registry.register_default_pair(T::Bool, source);
            registry.register_default_pair(T::Int16, source);
            registry.register_default_pair(T::Int32, source);
            registry.register_default_pair(T::Int64, source);
        }
        for source in [Real, Double] {
            registry.register_default_pair(T::Float32, source);
            registry.register_default_pair(T::Float64, source);
        }
        for source in [Decimal, Char, Varchar] {
            registry.register_default_pair(T::Decimal, source);
        }
        for source in [Char, Varchar, LongVarchar, Date, Time, Timestamp] {
            registry.register_default_pair(T::Text, source);
        }
        for source in [Binary, VarBinary] {
            registry.register_default_pair(T::Bytes, source);
        }
        for source in [Varchar, LongVarchar, Other] {
            registry.register_default_pair(T::Json, source);
        }

        registry
    }

    fn register_default_pair(&mut self, target: TargetType, source: SourceType) {
        let codec = Arc::new(ConvertCodec { target });
        self.pairs.insert((target, source), codec);
    }

    /// Register a codec for an exact `(target, source)` pair.
    pub fn register_pair(&mut self, target: TargetType, source: SourceType, codec: Arc<dyn Codec>) {
        self.pairs.insert((target, source), codec);
    }

    /// Register a codec keyed by target type alone.
    pub fn register_target(&mut self, target: TargetType, codec: Arc<dyn Codec>) {
        self.targets.insert(target, codec);
    }

    /// Is a conversion registered for this exact pair? Automapping uses this
    /// to decide whether an unmapped column is assignable at all.
    pub fn supports(&self, target: TargetType, source: SourceType) -> bool {
        target == TargetType::Raw || self.pairs.contains_key(&(target, source))
    }

    /// Is any codec registered producing this target type?
    pub fn supports_target(&self, target: TargetType) -> bool {
        self.targets.contains_key(&target)
    }

    pub fn for_pair(&self, target: TargetType, source: SourceType) -> Option<Arc<dyn Codec>> {
        self.pairs.get(&(target, source)).cloned()
    }

    pub fn for_target(&self, target: TargetType) -> Option<Arc<dyn Codec>> {
        self.targets.get(&target).cloned()
    }

    pub fn passthrough(&self) -> Arc<dyn Codec> {
        Arc::clone(&self.passthrough)
    }

    /// Resolve the codec for reading `column` into `target`.
    ///
    /// Fallback chain: exact `(target, source)` pair; the column's reported
    /// source class combined with the source type; the source type's natural
    /// target alone; passthrough.
    pub fn resolve(&self, target: TargetType, column: &ColumnMeta) -> Arc<dyn Codec> {
        if let Some(codec) = self.for_pair(target, column.source_type) {
            return codec;
        }
        if let Some(class_target) = target_for_class(&column.source_class) {
            if let Some(codec) = self.for_pair(class_target, column.source_type) {
                return codec;
            }
            if let Some(codec) = self.for_target(class_target) {
                return codec;
            }
        }
        if let Some(codec) = self.for_target(column.source_type.natural_target()) {
            return codec;
        }
        self.passthrough()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widening_conversions() {
        let registry = CodecRegistry::new();
        let codec = registry
            .for_pair(TargetType::Int64, SourceType::Integer)
            .unwrap();
        assert_eq!(codec.decode(&Value::Int(7)).unwrap(), Value::BigInt(7));
    }

    #[test]
    fn narrowing_out_of_range_fails() {
        let registry = CodecRegistry::new();
        let codec = registry
            .for_pair(TargetType::Int16, SourceType::Integer)
            .unwrap();
        assert!(codec.decode(&Value::Int(1 << 20)).is_err());
    }

    #[test]
    fn read_propagates_null_and_missing() {
        let registry = CodecRegistry::new();
        let codec = registry
            .for_pair(TargetType::Text, SourceType::Varchar)
            .unwrap();
        let row = Row::new(vec!["name".to_string()], vec![Value::Null]);
        assert_eq!(codec.read(&row, "name").unwrap(), Value::Null);
        assert!(codec.read(&row, "missing").is_err());
    }

    #[test]
    fn resolve_falls_back_through_class_and_source() {
        let registry = CodecRegistry::new();

        // No (Json, BigInt) pair registered, but class name says i64.
        let column = ColumnMeta::new("n", SourceType::BigInt).with_class("i64");
        let codec = registry.resolve(TargetType::Json, &column);
        assert_eq!(codec.target(), TargetType::Int64);

        // No class hint: natural target of the source type.
        let column = ColumnMeta::new("n", SourceType::Varchar);
        let codec = registry.resolve(TargetType::Bytes, &column);
        assert_eq!(codec.target(), TargetType::Text);
    }

    #[test]
    fn passthrough_is_terminal() {
        let registry = CodecRegistry::new();
        let column = ColumnMeta::new("x", SourceType::Other);
        let codec = registry.resolve(TargetType::Bool, &column);
        let v = Value::Text("anything".to_string());
        assert_eq!(codec.decode(&v).unwrap(), v);
    }
}
