//! Statement descriptors, result shapes, and the configuration registry.
//!
//! A [`StatementDescriptor`] names one logical operation (query, update, or
//! procedure call) and points at the [`SqlSource`] that renders its SQL. A
//! [`ResultShape`] declares how cursor rows materialize into objects. The
//! [`Configuration`] owns both registries plus the type and codec registries
//! and the global [`Settings`].

use crate::codec::CodecRegistry;
use crate::error::{Error, Result};
use crate::object::TypeRegistry;
use crate::param::ParamBag;
use crate::types::TargetType;
use crate::value::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Pagination bounds applied while draining a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowBounds {
    pub offset: usize,
    pub limit: usize,
}

impl RowBounds {
    pub const DEFAULT: RowBounds = RowBounds {
        offset: 0,
        limit: usize::MAX,
    };

    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    pub fn is_default(&self) -> bool {
        *self == Self::DEFAULT
    }
}

impl Default for RowBounds {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Direction of one statement parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamMode {
    In,
    Out,
    InOut,
}

/// One bound parameter slot of a rendered statement.
#[derive(Debug, Clone)]
pub struct ParameterMapping {
    /// Property name in the parameter bag this slot reads from (and, for OUT
    /// parameters, writes back to).
    pub property: String,
    pub mode: ParamMode,
    pub target_type: TargetType,
}

impl ParameterMapping {
    pub fn input(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            mode: ParamMode::In,
            target_type: TargetType::Raw,
        }
    }

    pub fn output(property: impl Into<String>, target_type: TargetType) -> Self {
        Self {
            property: property.into(),
            mode: ParamMode::Out,
            target_type,
        }
    }

    pub fn mode(mut self, mode: ParamMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn is_input(&self) -> bool {
        !matches!(self.mode, ParamMode::Out)
    }

    pub fn is_output(&self) -> bool {
        !matches!(self.mode, ParamMode::In)
    }
}

/// A statement rendered against a concrete parameter bag: the final SQL
/// text, the ordered parameter slots, and any additional values the
/// rendering produced along the way.
#[derive(Debug, Clone)]
pub struct BoundSql {
    pub sql: String,
    pub parameters: Vec<ParameterMapping>,
    /// Values computed during rendering that are not part of the caller's
    /// bag, keyed by property name. Consulted before the bag itself.
    pub additional: BTreeMap<String, Value>,
}

impl BoundSql {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            parameters: Vec::new(),
            additional: BTreeMap::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<ParameterMapping>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn set_additional(&mut self, name: impl Into<String>, value: Value) {
        self.additional.insert(name.into(), value);
    }

    /// Look up a parameter value, preferring additional values over the bag.
    pub fn parameter_value<'a>(&'a self, bag: &'a ParamBag, property: &str) -> Option<&'a Value> {
        self.additional
            .get(property)
            .or_else(|| bag.get(property))
    }
}

/// Renders SQL for one statement against a parameter bag.
pub trait SqlSource: Send + Sync {
    fn bound_sql(&self, bag: &ParamBag) -> BoundSql;
}

/// The trivial source: fixed SQL text with a fixed parameter list.
pub struct StaticSqlSource {
    sql: String,
    parameters: Vec<ParameterMapping>,
}

impl StaticSqlSource {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<ParameterMapping>) -> Self {
        self.parameters = parameters;
        self
    }
}

impl SqlSource for StaticSqlSource {
    fn bound_sql(&self, _bag: &ParamBag) -> BoundSql {
        BoundSql::new(self.sql.clone()).with_parameters(self.parameters.clone())
    }
}

/// What kind of operation a statement performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Query,
    Update,
    Call,
}

/// How long first-level cache entries survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalCacheScope {
    /// Entries live until a write, commit, rollback, or explicit clear.
    Session,
    /// Entries are discarded after each top-level query finishes.
    Statement,
}

/// How unmapped columns are assigned to properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoMappingBehavior {
    /// Never automap.
    None,
    /// Automap only result shapes with no nested shapes.
    Partial,
    /// Automap everything, nested shapes included.
    Full,
}

/// One registered statement.
pub struct StatementDescriptor {
    pub id: String,
    pub kind: StatementKind,
    pub source: Arc<dyn SqlSource>,
    /// Result shape id, for queries that materialize objects. Absent for
    /// updates and single-value reads handled by the caller.
    pub shape: Option<String>,
    /// Clear caches before executing this statement.
    pub flush_cache: bool,
    /// Consult the shared cache for this statement.
    pub use_cache: bool,
    /// Shared cache id this statement participates in.
    pub cache_ref: Option<String>,
    /// Rows arrive grouped by parent key, enabling streaming emission of
    /// nested results.
    pub result_ordered: bool,
}

impl StatementDescriptor {
    pub fn new(id: impl Into<String>, kind: StatementKind, source: Arc<dyn SqlSource>) -> Self {
        let use_cache = !matches!(kind, StatementKind::Update);
        Self {
            id: id.into(),
            kind,
            source,
            shape: None,
            flush_cache: !use_cache,
            use_cache,
            cache_ref: None,
            result_ordered: false,
        }
    }

    pub fn shape(mut self, shape_id: impl Into<String>) -> Self {
        self.shape = Some(shape_id.into());
        self
    }

    pub fn flush_cache(mut self, flush: bool) -> Self {
        self.flush_cache = flush;
        self
    }

    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn cache_ref(mut self, cache_id: impl Into<String>) -> Self {
        self.cache_ref = Some(cache_id.into());
        self
    }

    pub fn result_ordered(mut self, ordered: bool) -> Self {
        self.result_ordered = ordered;
        self
    }

    pub fn bound_sql(&self, bag: &ParamBag) -> BoundSql {
        self.source.bound_sql(bag)
    }
}

impl std::fmt::Debug for StatementDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementDescriptor")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("shape", &self.shape)
            .field("flush_cache", &self.flush_cache)
            .field("use_cache", &self.use_cache)
            .field("cache_ref", &self.cache_ref)
            .field("result_ordered", &self.result_ordered)
            .finish_non_exhaustive()
    }
}

/// Routes a row to one of several result shapes based on a column value.
#[derive(Debug, Clone)]
pub struct Discriminator {
    pub column: String,
    pub target_type: TargetType,
    /// Decoded column value (string form) to result-shape id.
    pub cases: HashMap<String, String>,
}

impl Discriminator {
    pub fn new(column: impl Into<String>, target_type: TargetType) -> Self {
        Self {
            column: column.into(),
            target_type,
            cases: HashMap::new(),
        }
    }

    pub fn case(mut self, value: impl Into<String>, shape_id: impl Into<String>) -> Self {
        self.cases.insert(value.into(), shape_id.into());
        self
    }

    pub fn shape_for(&self, value: &str) -> Option<&str> {
        self.cases.get(value).map(String::as_str)
    }
}

/// One property mapping within a result shape.
#[derive(Debug, Clone)]
pub struct PropertyMapping {
    pub property: String,
    /// Cursor column this property reads from. Empty for pure nested-shape
    /// mappings that take their value from child rows.
    pub column: String,
    /// Prefix prepended to the nested shape's column names when this mapping
    /// joins a flattened child.
    pub column_prefix: Option<String>,
    /// Result shape materialized from the same row's columns.
    pub nested_shape: Option<String>,
    /// Statement executed to fetch this property's value.
    pub nested_query: Option<String>,
    /// Defer the nested query until the property is first read.
    pub lazy: bool,
    /// Participates in row identity.
    pub is_id: bool,
    pub target_type: TargetType,
    /// For nested queries with composite parameters: (bag property, column).
    pub composites: Vec<(String, String)>,
    /// Columns that must be non-null before the nested shape materializes.
    pub not_null_columns: Vec<String>,
    /// Explicit collection flag. `None` means infer from the property
    /// descriptor of the enclosing type.
    pub collection: Option<bool>,
}

impl PropertyMapping {
    pub fn column(property: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            column: column.into(),
            column_prefix: None,
            nested_shape: None,
            nested_query: None,
            lazy: false,
            is_id: false,
            target_type: TargetType::Raw,
            composites: Vec::new(),
            not_null_columns: Vec::new(),
            collection: None,
        }
    }

    pub fn id(property: impl Into<String>, column: impl Into<String>) -> Self {
        let mut m = Self::column(property, column);
        m.is_id = true;
        m
    }

    pub fn nested(property: impl Into<String>, shape_id: impl Into<String>) -> Self {
        let mut m = Self::column(property, "");
        m.nested_shape = Some(shape_id.into());
        m
    }

    pub fn query(
        property: impl Into<String>,
        column: impl Into<String>,
        statement_id: impl Into<String>,
    ) -> Self {
        let mut m = Self::column(property, column);
        m.nested_query = Some(statement_id.into());
        m
    }

    pub fn target_type(mut self, target: TargetType) -> Self {
        self.target_type = target;
        self
    }

    pub fn column_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.column_prefix = Some(prefix.into());
        self
    }

    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn composite(mut self, property: impl Into<String>, column: impl Into<String>) -> Self {
        self.composites.push((property.into(), column.into()));
        self
    }

    pub fn not_null_columns(mut self, columns: Vec<String>) -> Self {
        self.not_null_columns = columns;
        self
    }

    pub fn collection(mut self, collection: bool) -> Self {
        self.collection = Some(collection);
        self
    }

    /// Does this mapping produce its value from the same row's columns via a
    /// nested shape (as opposed to a separate query)?
    pub fn is_nested_result(&self) -> bool {
        self.nested_shape.is_some() && self.nested_query.is_none()
    }

    /// Does this mapping carry a simple column read?
    pub fn is_simple(&self) -> bool {
        self.nested_shape.is_none() && self.nested_query.is_none()
    }
}

/// One constructor argument declaration.
#[derive(Debug, Clone)]
pub struct ConstructorMapping {
    pub column: String,
    pub target_type: TargetType,
    /// Nested query fetching this argument's value.
    pub nested_query: Option<String>,
    /// Result shape materialized from the same row for this argument.
    pub nested_shape: Option<String>,
    /// For nested queries with composite parameters: (bag property, column).
    pub composites: Vec<(String, String)>,
    /// Argument name, when the declaration names one. Positional otherwise.
    pub name: Option<String>,
}

impl ConstructorMapping {
    pub fn new(column: impl Into<String>, target_type: TargetType) -> Self {
        Self {
            column: column.into(),
            target_type,
            nested_query: None,
            nested_shape: None,
            composites: Vec::new(),
            name: None,
        }
    }

    pub fn shape(mut self, shape_id: impl Into<String>) -> Self {
        self.nested_shape = Some(shape_id.into());
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn query(mut self, statement_id: impl Into<String>) -> Self {
        self.nested_query = Some(statement_id.into());
        self
    }

    pub fn composite(mut self, property: impl Into<String>, column: impl Into<String>) -> Self {
        self.composites.push((property.into(), column.into()));
        self
    }
}

/// Declares how rows of one result set materialize into objects.
#[derive(Debug, Clone)]
pub struct ResultShape {
    pub id: String,
    /// Registered type this shape produces.
    pub type_name: String,
    pub mappings: Vec<PropertyMapping>,
    pub constructor: Vec<ConstructorMapping>,
    pub discriminator: Option<Discriminator>,
    /// Per-shape automapping override. `None` defers to global behavior.
    pub auto_mapping: Option<bool>,
}

impl ResultShape {
    pub fn new(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            mappings: Vec::new(),
            constructor: Vec::new(),
            discriminator: None,
            auto_mapping: None,
        }
    }

    pub fn mapping(mut self, mapping: PropertyMapping) -> Self {
        self.mappings.push(mapping);
        self
    }

    pub fn constructor_arg(mut self, arg: ConstructorMapping) -> Self {
        self.constructor.push(arg);
        self
    }

    pub fn discriminator(mut self, discriminator: Discriminator) -> Self {
        self.discriminator = Some(discriminator);
        self
    }

    pub fn auto_mapping(mut self, enabled: bool) -> Self {
        self.auto_mapping = Some(enabled);
        self
    }

    /// Mappings that participate in row identity. Falls back to all property
    /// mappings when no id mapping is declared.
    pub fn id_mappings(&self) -> Vec<&PropertyMapping> {
        let ids: Vec<&PropertyMapping> = self.mappings.iter().filter(|m| m.is_id).collect();
        if ids.is_empty() {
            self.mappings.iter().collect()
        } else {
            ids
        }
    }

    /// Upper-cased column names claimed by this shape, prefix applied.
    pub fn mapped_columns(&self, prefix: &str) -> Vec<String> {
        let prefix = prefix.to_uppercase();
        self.mappings
            .iter()
            .filter(|m| !m.column.is_empty())
            .map(|m| {
                let col = m.column.to_uppercase();
                if prefix.is_empty() {
                    col
                } else {
                    format!("{prefix}{col}")
                }
            })
            .collect()
    }

    pub fn mapped_properties(&self) -> impl Iterator<Item = &str> {
        self.mappings.iter().map(|m| m.property.as_str())
    }

    pub fn has_nested_shapes(&self) -> bool {
        self.mappings.iter().any(PropertyMapping::is_nested_result)
    }

    pub fn has_nested_queries(&self) -> bool {
        self.mappings.iter().any(|m| m.nested_query.is_some())
            || self.constructor.iter().any(|c| c.nested_query.is_some())
    }
}

/// Global behavior switches.
#[derive(Debug, Clone)]
pub struct Settings {
    pub local_cache_scope: LocalCacheScope,
    pub auto_mapping_behavior: AutoMappingBehavior,
    /// Translate `user_name` columns to `userName` properties during
    /// automapping.
    pub map_underscore_to_camel_case: bool,
    /// Assign NULL column values to properties instead of skipping them.
    pub call_setters_on_nulls: bool,
    /// Produce an empty instance for rows where every mapped column is NULL
    /// instead of producing no object.
    pub return_instance_for_empty_row: bool,
    /// Reject in-memory pagination over cursors that cannot seek.
    pub safe_row_bounds: bool,
    /// Reject streaming cursors over statements whose results cannot stream.
    pub safe_cursor: bool,
    /// Fetch lazy properties eagerly on first access to any property.
    pub aggressive_lazy_loading: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            local_cache_scope: LocalCacheScope::Session,
            auto_mapping_behavior: AutoMappingBehavior::Partial,
            map_underscore_to_camel_case: false,
            call_setters_on_nulls: false,
            return_instance_for_empty_row: false,
            safe_row_bounds: false,
            safe_cursor: true,
            aggressive_lazy_loading: false,
        }
    }
}

/// The registry of statements, shapes, types, and codecs a session runs
/// against.
pub struct Configuration {
    statements: HashMap<String, Arc<StatementDescriptor>>,
    shapes: HashMap<String, Arc<ResultShape>>,
    pub types: TypeRegistry,
    pub codecs: CodecRegistry,
    pub settings: Settings,
    /// Environment id mixed into cache keys so identical statements from
    /// different environments never collide.
    pub environment: String,
}

impl Configuration {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            statements: HashMap::new(),
            shapes: HashMap::new(),
            types: TypeRegistry::new(),
            codecs: CodecRegistry::new(),
            settings: Settings::default(),
            environment: environment.into(),
        }
    }

    pub fn add_statement(&mut self, statement: StatementDescriptor) {
        self.statements
            .insert(statement.id.clone(), Arc::new(statement));
    }

    pub fn statement(&self, id: &str) -> Result<Arc<StatementDescriptor>> {
        self.statements
            .get(id)
            .cloned()
            .ok_or_else(|| Error::config(format!("unknown statement id '{id}'")))
    }

    pub fn has_statement(&self, id: &str) -> bool {
        self.statements.contains_key(id)
    }

    pub fn add_shape(&mut self, shape: ResultShape) {
        self.shapes.insert(shape.id.clone(), Arc::new(shape));
    }

    pub fn shape(&self, id: &str) -> Result<Arc<ResultShape>> {
        self.shapes
            .get(id)
            .cloned()
            .ok_or_else(|| Error::config(format!("unknown result shape '{id}'")))
    }

    /// Should this shape be automapped, honoring the per-shape override?
    pub fn should_auto_map(&self, shape: &ResultShape, is_nested: bool) -> bool {
        if let Some(enabled) = shape.auto_mapping {
            return enabled;
        }
        match self.settings.auto_mapping_behavior {
            AutoMappingBehavior::None => false,
            AutoMappingBehavior::Partial => !is_nested,
            AutoMappingBehavior::Full => true,
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new("default")
    }
}
