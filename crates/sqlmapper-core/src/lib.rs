//! Core types for the SQLMapper data-mapping engine.
//!
//! This crate defines the value model, row representation, codec registry,
//! statement and result-shape configuration, and the arena-based object
//! model. The execution engine lives in `sqlmapper-executor`; caching in
//! `sqlmapper-cache`.

pub mod codec;
pub mod error;
pub mod mapping;
pub mod object;
pub mod param;
pub mod row;
pub mod types;
pub mod value;

pub use codec::{Codec, CodecRegistry};
pub use error::{ConfigurationError, Error, ExecutionError, MappingError, Result, TypeError};
pub use mapping::{
    AutoMappingBehavior, BoundSql, Configuration, ConstructorMapping, Discriminator,
    LocalCacheScope, ParamMode, ParameterMapping, PropertyMapping, ResultShape, RowBounds,
    Settings, SqlSource, StatementDescriptor, StatementKind, StaticSqlSource,
};
pub use object::{
    ConstructorSig, DataObject, DefaultObjectFactory, LoadId, ObjectArena, ObjectFactory,
    ObjectHandle, PropertyDescriptor, Slot, SlotItem, TypeDescriptor, TypeRegistry,
};
pub use param::ParamBag;
pub use row::{ColumnInfo, ColumnMeta, Row};
pub use types::{SourceType, TargetType, target_for_class};
pub use value::{Value, hash_value, value_hash};
