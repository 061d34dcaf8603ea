//! Row materialization: turning cursor rows into values and object graphs.
//!
//! Two algorithms share one entry point. Simple shapes (no nested shapes)
//! materialize row by row. Nested shapes group rows by a composite row key,
//! folding join duplicates into one parent object and linking children
//! through collection or association properties.

use crate::backend::RowCursor;
use crate::cursor::ColumnAnalysis;
use crate::result::{ResultList, RowValue};
use crate::session::{LazyLoad, Session, build_cache_key, extract_slot, row_to_item, row_to_slot};
use crate::backend::Backend;
use sqlmapper_cache::{CacheKey, CacheLookup};
use sqlmapper_core::{
    ConstructorMapping, Error, ObjectHandle, ParamBag, PropertyMapping, Result, ResultShape,
    RowBounds, Slot, StatementDescriptor, TargetType, TypeDescriptor, Value, target_for_class,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Scratch state for one materialization pass. Lives for the duration of a
/// buffered query or for the life of a streaming cursor.
pub(crate) struct MaterializeState {
    pub analysis: ColumnAnalysis,
    /// Combined row key -> materialized row (or a recorded empty row).
    nested_results: HashMap<CacheKey, Option<RowValue>>,
    /// Shape id -> object currently being materialized further up the row.
    ancestors: HashMap<String, ObjectHandle>,
    /// Memoized automapping plans keyed by "shape_id:PREFIX".
    automap: HashMap<String, Vec<AutoMapping>>,
}

impl MaterializeState {
    pub(crate) fn new(analysis: ColumnAnalysis) -> Self {
        Self {
            analysis,
            nested_results: HashMap::new(),
            ancestors: HashMap::new(),
            automap: HashMap::new(),
        }
    }

    pub(crate) fn clear_groups(&mut self) {
        self.nested_results.clear();
    }

    /// Lookup for the streaming cursor: outer `None` means the key is
    /// unseen, inner `None` means the key produced an empty row.
    pub(crate) fn partial_for(&self, key: &CacheKey) -> Option<Option<RowValue>> {
        self.nested_results.get(key).cloned()
    }
}

#[derive(Clone)]
struct AutoMapping {
    column: String,
    property: String,
    target: TargetType,
}

/// What object construction produced.
pub(crate) enum Created {
    Value(Value),
    Object(ObjectHandle),
}

/// What one property mapping yielded.
enum MappedValue {
    /// A deferred load was registered; the slot is written later.
    Deferred,
    /// A lazy ticket to park in the slot.
    Pending(sqlmapper_core::LoadId),
    Slot(Slot),
}

fn prepend(prefix: &str, column: &str) -> String {
    if prefix.is_empty() || column.is_empty() {
        column.to_string()
    } else {
        format!("{prefix}{column}")
    }
}

fn child_prefix(parent: &str, mapping: &PropertyMapping) -> String {
    match &mapping.column_prefix {
        Some(own) => format!("{parent}{own}"),
        None => parent.to_string(),
    }
}

impl<B: Backend> Session<B> {
    /// Drain one cursor into a result list according to the statement's
    /// shape.
    pub(crate) fn materialize_cursor(
        &mut self,
        statement: &Arc<StatementDescriptor>,
        cursor: Box<dyn RowCursor>,
        bounds: RowBounds,
        bag: &ParamBag,
    ) -> Result<ResultList> {
        let Some(shape_id) = &statement.shape else {
            // Procedure calls may produce only output parameters.
            return Ok(ResultList::new());
        };
        let shape = self.config.shape(shape_id)?;
        let mut state = MaterializeState::new(ColumnAnalysis::new(cursor.columns().to_vec()));
        if shape.has_nested_shapes() {
            if self.config.settings.safe_row_bounds && !bounds.is_default() {
                return Err(Error::config(format!(
                    "pagination bounds are not allowed on nested result shape '{}'",
                    shape.id
                )));
            }
            self.handle_rows_nested(statement, &shape, cursor, bounds, bag, &mut state)
        } else {
            self.handle_rows_simple(&shape, cursor, bounds, bag, &mut state)
        }
    }

    fn skip_rows(&self, cursor: &mut dyn RowCursor, bounds: RowBounds) -> Result<()> {
        if bounds.offset == 0 {
            return Ok(());
        }
        if cursor.supports_absolute() {
            cursor.absolute(bounds.offset)
        } else {
            for _ in 0..bounds.offset {
                if cursor.advance()?.is_none() {
                    break;
                }
            }
            Ok(())
        }
    }

    fn handle_rows_simple(
        &mut self,
        shape: &Arc<ResultShape>,
        mut cursor: Box<dyn RowCursor>,
        bounds: RowBounds,
        bag: &ParamBag,
        state: &mut MaterializeState,
    ) -> Result<ResultList> {
        self.skip_rows(cursor.as_mut(), bounds)?;
        let mut list = ResultList::new();
        while list.len() < bounds.limit {
            let Some(row) = cursor.advance()? else {
                break;
            };
            let resolved = self.resolve_discriminated(&row, Arc::clone(shape), "", state)?;
            let value = self.row_value_simple(&row, &resolved, "", bag, state)?;
            list.push(value);
        }
        Ok(list)
    }

    fn handle_rows_nested(
        &mut self,
        statement: &Arc<StatementDescriptor>,
        shape: &Arc<ResultShape>,
        mut cursor: Box<dyn RowCursor>,
        bounds: RowBounds,
        bag: &ParamBag,
        state: &mut MaterializeState,
    ) -> Result<ResultList> {
        self.skip_rows(cursor.as_mut(), bounds)?;
        let mut list = ResultList::new();
        // In ordered mode the current group's object is held back until the
        // first row of the next group proves the group is complete.
        let mut previous: Option<RowValue> = None;
        while list.len() < bounds.limit {
            let Some(row) = cursor.advance()? else {
                break;
            };
            let resolved = self.resolve_discriminated(&row, Arc::clone(shape), "", state)?;
            let row_key = self.create_row_key(&row, &resolved, "", state)?;
            let partial_entry = row_key
                .as_ref()
                .and_then(|k| state.nested_results.get(k).cloned());
            let partial = partial_entry.clone().flatten();

            if statement.result_ordered {
                if partial.is_none() && previous.is_some() {
                    state.clear_groups();
                    list.push(previous.take());
                }
                previous = self.row_value_nested(&row, &resolved, row_key, "", partial, bag, state)?;
            } else {
                let value =
                    self.row_value_nested(&row, &resolved, row_key, "", partial, bag, state)?;
                if partial_entry.is_none() {
                    list.push(value);
                }
            }
        }
        if statement.result_ordered && previous.is_some() && list.len() < bounds.limit {
            list.push(previous);
        }
        Ok(list)
    }

    /// Follow the discriminator chain until a shape without one (or a
    /// repeat) is reached. A case naming an unknown shape id is fatal; a
    /// column value with no case keeps the current shape.
    pub(crate) fn resolve_discriminated(
        &mut self,
        row: &sqlmapper_core::Row,
        shape: Arc<ResultShape>,
        prefix: &str,
        state: &mut MaterializeState,
    ) -> Result<Arc<ResultShape>> {
        let mut current = shape;
        let mut past: HashSet<String> = HashSet::new();
        while let Some(discriminator) = current.discriminator.clone() {
            let column = prepend(prefix, &discriminator.column);
            let codec = state
                .analysis
                .codec_for(&self.config, discriminator.target_type, &column);
            let value = codec.read(row, &column)?;
            let Some(next_id) = discriminator.shape_for(&value.to_string()) else {
                break;
            };
            let next = self.config.shape(next_id)?;
            let repeat = next.id == current.id || !past.insert(next.id.clone());
            current = next;
            if repeat {
                break;
            }
        }
        Ok(current)
    }

    // ---- simple row values ----

    pub(crate) fn row_value_simple(
        &mut self,
        row: &sqlmapper_core::Row,
        shape: &Arc<ResultShape>,
        prefix: &str,
        bag: &ParamBag,
        state: &mut MaterializeState,
    ) -> Result<Option<RowValue>> {
        let Some((created, used_ctor)) = self.create_result_object(row, shape, prefix, bag, state)?
        else {
            return Ok(None);
        };
        match created {
            Created::Value(v) => Ok(Some(RowValue::Value(v))),
            Created::Object(handle) => {
                let mut found = used_ctor;
                if self.config.should_auto_map(shape, false) {
                    found |= self.apply_automatic_mappings(row, shape, prefix, handle, state)?;
                }
                found |= self.apply_property_mappings(row, shape, prefix, handle, bag, state)?;
                if found || self.config.settings.return_instance_for_empty_row {
                    Ok(Some(RowValue::Object(handle)))
                } else {
                    Ok(None)
                }
            }
        }
    }

    // ---- object construction ----

    fn create_result_object(
        &mut self,
        row: &sqlmapper_core::Row,
        shape: &Arc<ResultShape>,
        prefix: &str,
        bag: &ParamBag,
        state: &mut MaterializeState,
    ) -> Result<Option<(Created, bool)>> {
        // Shapes naming a value type decode a single column directly.
        if let Some(target) = target_for_class(&shape.type_name) {
            let column = shape
                .mappings
                .first()
                .map(|m| prepend(prefix, &m.column))
                .or_else(|| state.analysis.columns().first().map(|c| c.name.clone()))
                .ok_or_else(|| {
                    Error::mapping_column("<none>", "result set has no columns to decode")
                })?;
            let codec = state.analysis.codec_for(&self.config, target, &column);
            let value = codec.read(row, &column)?;
            return Ok(Some((Created::Value(value), false)));
        }

        let descriptor = self.config.types.get(&shape.type_name)?;
        if !shape.constructor.is_empty() {
            return Ok(self
                .create_with_constructor_mappings(row, shape, prefix, bag, state)?
                .map(|h| (Created::Object(h), true)));
        }
        if descriptor.has_default_constructor || descriptor.open {
            let object = self.factory.create(&descriptor)?;
            return Ok(Some((Created::Object(self.arena.alloc(object)), false)));
        }
        if self.config.should_auto_map(shape, false) {
            if let Some(handle) = self.create_by_constructor_signature(&descriptor, row, state)? {
                return Ok(Some((Created::Object(handle), true)));
            }
        }
        Err(Error::config(format!(
            "do not know how to create an instance of '{}'",
            shape.type_name
        )))
    }

    /// Build through declared constructor mappings. Produces nothing when
    /// every argument came up null.
    fn create_with_constructor_mappings(
        &mut self,
        row: &sqlmapper_core::Row,
        shape: &Arc<ResultShape>,
        prefix: &str,
        bag: &ParamBag,
        state: &mut MaterializeState,
    ) -> Result<Option<ObjectHandle>> {
        let descriptor = self.config.types.get(&shape.type_name)?;
        let constructor = shape.constructor.clone();
        let mut value_args: Vec<(String, Value)> = Vec::new();
        let mut slot_args: Vec<(String, Slot)> = Vec::new();
        let mut found = false;

        for mapping in &constructor {
            let name = self.constructor_arg_name(mapping);
            if let Some(statement_id) = &mapping.nested_query {
                let slot =
                    self.constructor_query_value(row, mapping, statement_id.clone(), prefix)?;
                if !matches!(slot, Slot::Value(Value::Null)) {
                    found = true;
                }
                slot_args.push((name, slot));
            } else if let Some(shape_id) = &mapping.nested_shape {
                let nested = self.config.shape(shape_id)?;
                let nested = self.resolve_discriminated(row, nested, prefix, state)?;
                match self.row_value_simple(row, &nested, prefix, bag, state)? {
                    Some(rv) => {
                        found = true;
                        slot_args.push((name, row_to_slot(&rv)));
                    }
                    None => slot_args.push((name, Slot::Value(Value::Null))),
                }
            } else {
                let column = prepend(prefix, &mapping.column);
                let codec = state
                    .analysis
                    .codec_for(&self.config, mapping.target_type, &column);
                let value = codec.read(row, &column)?;
                if !value.is_null() {
                    found = true;
                }
                value_args.push((name, value));
            }
        }

        if !found {
            return Ok(None);
        }
        let object = self.factory.create_with_args(&descriptor, value_args)?;
        let handle = self.arena.alloc(object);
        for (name, slot) in slot_args {
            if let Some(object) = self.arena.get_mut(handle) {
                object.set(name, slot);
            }
        }
        Ok(Some(handle))
    }

    fn constructor_arg_name(&self, mapping: &ConstructorMapping) -> String {
        mapping
            .name
            .clone()
            .unwrap_or_else(|| mapping.column.to_lowercase())
    }

    /// Constructor sub-queries run immediately; laziness never applies to
    /// construction arguments.
    fn constructor_query_value(
        &mut self,
        row: &sqlmapper_core::Row,
        mapping: &ConstructorMapping,
        statement_id: String,
        prefix: &str,
    ) -> Result<Slot> {
        let Some(nested_bag) = nested_query_bag(row, &mapping.composites, &mapping.column, prefix)
        else {
            return Ok(Slot::Value(Value::Null));
        };
        let list = self.query(&statement_id, &nested_bag)?;
        Ok(extract_slot(&list, false).unwrap_or(Slot::Value(Value::Null)))
    }

    /// Match a declared constructor signature against the cursor columns
    /// positionally and build from decoded column values.
    fn create_by_constructor_signature(
        &mut self,
        descriptor: &TypeDescriptor,
        row: &sqlmapper_core::Row,
        state: &mut MaterializeState,
    ) -> Result<Option<ObjectHandle>> {
        let columns: Vec<_> = state.analysis.columns().to_vec();
        for signature in &descriptor.constructors {
            if signature.args.len() != columns.len() {
                continue;
            }
            let usable = signature
                .args
                .iter()
                .zip(&columns)
                .all(|((_, target), column)| self.config.codecs.supports(*target, column.source_type));
            if !usable {
                continue;
            }
            let mut args = Vec::with_capacity(columns.len());
            let mut found = false;
            for ((name, target), column) in signature.args.iter().zip(&columns) {
                let codec = state.analysis.codec_for(&self.config, *target, &column.name);
                let value = codec.read(row, &column.name)?;
                if !value.is_null() {
                    found = true;
                }
                args.push((name.clone(), value));
            }
            if !found {
                return Ok(None);
            }
            let object = self.factory.create_with_args(descriptor, args)?;
            return Ok(Some(self.arena.alloc(object)));
        }
        Ok(None)
    }

    // ---- automapping ----

    fn automap_plan(
        &mut self,
        shape: &Arc<ResultShape>,
        prefix: &str,
        state: &mut MaterializeState,
    ) -> Result<Vec<AutoMapping>> {
        let cache_key = format!("{}:{}", shape.id, prefix.to_uppercase());
        if let Some(plan) = state.automap.get(&cache_key) {
            return Ok(plan.clone());
        }
        let descriptor = if target_for_class(&shape.type_name).is_some() {
            None
        } else {
            Some(self.config.types.get(&shape.type_name)?)
        };
        let underscore = self.config.settings.map_underscore_to_camel_case;
        let upper_prefix = prefix.to_uppercase();
        let unmapped: Vec<String> = state.analysis.unmapped_columns(shape, prefix).to_vec();

        let mut plan = Vec::new();
        for column in unmapped {
            let stripped = if upper_prefix.is_empty() {
                column.clone()
            } else if column.to_uppercase().starts_with(&upper_prefix) {
                column[upper_prefix.len()..].to_string()
            } else {
                continue;
            };
            let Some(descriptor) = &descriptor else {
                continue;
            };
            if descriptor.open {
                let target = state
                    .analysis
                    .column_meta(&column)
                    .map_or(TargetType::Raw, |c| c.source_type.natural_target());
                plan.push(AutoMapping {
                    column,
                    property: stripped,
                    target,
                });
                continue;
            }
            let Some(property) = descriptor.find_property(&stripped, underscore) else {
                continue;
            };
            let source = state
                .analysis
                .column_meta(&column)
                .map(|c| c.source_type);
            let supported =
                source.is_some_and(|s| self.config.codecs.supports(property.target_type, s));
            if supported || property.target_type == TargetType::Raw {
                plan.push(AutoMapping {
                    column,
                    property: property.name.clone(),
                    target: property.target_type,
                });
            }
        }
        state.automap.insert(cache_key, plan.clone());
        Ok(plan)
    }

    fn apply_automatic_mappings(
        &mut self,
        row: &sqlmapper_core::Row,
        shape: &Arc<ResultShape>,
        prefix: &str,
        handle: ObjectHandle,
        state: &mut MaterializeState,
    ) -> Result<bool> {
        let plan = self.automap_plan(shape, prefix, state)?;
        let mut found = false;
        for auto in &plan {
            let codec = state.analysis.codec_for(&self.config, auto.target, &auto.column);
            let value = codec.read(row, &auto.column)?;
            let is_null = value.is_null();
            if !is_null {
                found = true;
            }
            if !is_null || self.config.settings.call_setters_on_nulls {
                if let Some(object) = self.arena.get_mut(handle) {
                    object.set(auto.property.clone(), Slot::Value(value));
                }
            }
        }
        Ok(found)
    }

    // ---- declared property mappings ----

    fn apply_property_mappings(
        &mut self,
        row: &sqlmapper_core::Row,
        shape: &Arc<ResultShape>,
        prefix: &str,
        handle: ObjectHandle,
        bag: &ParamBag,
        state: &mut MaterializeState,
    ) -> Result<bool> {
        let descriptor = self.config.types.get(&shape.type_name).ok();
        let mapped: HashSet<String> = state
            .analysis
            .mapped_columns(shape, prefix)
            .iter()
            .map(|c| c.to_uppercase())
            .collect();
        let mappings = shape.mappings.clone();
        let mut found = false;

        for mapping in &mappings {
            if mapping.is_nested_result() {
                continue;
            }
            let column = prepend(prefix, &mapping.column);
            let applies = !mapping.composites.is_empty()
                || (!mapping.column.is_empty() && mapped.contains(&column.to_uppercase()));
            if !applies {
                continue;
            }
            let value = self
                .property_mapping_value(
                    row,
                    mapping,
                    descriptor.as_deref(),
                    handle,
                    &column,
                    prefix,
                    bag,
                    state,
                )
                .map_err(|e| e.for_property(&mapping.property))?;
            match value {
                MappedValue::Deferred => found = true,
                MappedValue::Pending(load_id) => {
                    found = true;
                    if let Some(object) = self.arena.get_mut(handle) {
                        object.set(mapping.property.clone(), Slot::Pending(load_id));
                    }
                }
                MappedValue::Slot(slot) => {
                    let is_null = matches!(slot, Slot::Value(Value::Null));
                    if !is_null {
                        found = true;
                    }
                    if !is_null || self.config.settings.call_setters_on_nulls {
                        if let Some(object) = self.arena.get_mut(handle) {
                            object.set(mapping.property.clone(), slot);
                        }
                    }
                }
            }
        }
        Ok(found)
    }

    #[allow(clippy::too_many_arguments)]
    fn property_mapping_value(
        &mut self,
        row: &sqlmapper_core::Row,
        mapping: &PropertyMapping,
        descriptor: Option<&TypeDescriptor>,
        handle: ObjectHandle,
        column: &str,
        prefix: &str,
        _bag: &ParamBag,
        state: &mut MaterializeState,
    ) -> Result<MappedValue> {
        if let Some(statement_id) = mapping.nested_query.clone() {
            return self.nested_query_mapping_value(
                row,
                mapping,
                descriptor,
                handle,
                &statement_id,
                prefix,
            );
        }
        let codec = state
            .analysis
            .codec_for(&self.config, mapping.target_type, column);
        Ok(MappedValue::Slot(Slot::Value(codec.read(row, column)?)))
    }

    /// A property backed by a separate statement: defer when its key is
    /// already known to the session cache, park a lazy ticket when the
    /// mapping asks for it, run inline otherwise.
    fn nested_query_mapping_value(
        &mut self,
        row: &sqlmapper_core::Row,
        mapping: &PropertyMapping,
        descriptor: Option<&TypeDescriptor>,
        handle: ObjectHandle,
        statement_id: &str,
        prefix: &str,
    ) -> Result<MappedValue> {
        let statement = self.config.statement(statement_id)?;
        let Some(nested_bag) = nested_query_bag(row, &mapping.composites, &mapping.column, prefix)
        else {
            return Ok(MappedValue::Slot(Slot::Value(Value::Null)));
        };
        let collection = self.is_collection_mapping(descriptor, mapping)?;
        let bound = statement.bound_sql(&nested_bag);
        let key = build_cache_key(
            &self.config,
            &statement,
            &nested_bag,
            RowBounds::DEFAULT,
            &bound,
        );
        if !matches!(self.local_cache.lookup(&key), CacheLookup::Miss) {
            self.defer_load(key, handle, mapping.property.clone(), collection);
            return Ok(MappedValue::Deferred);
        }
        if mapping.lazy {
            let load_id = self.register_lazy(LazyLoad {
                statement_id: statement_id.to_string(),
                bag: nested_bag,
                collection,
            });
            return Ok(MappedValue::Pending(load_id));
        }
        let list = self.query(statement_id, &nested_bag)?;
        Ok(MappedValue::Slot(
            extract_slot(&list, collection).unwrap_or(Slot::Value(Value::Null)),
        ))
    }

    fn is_collection_mapping(
        &self,
        descriptor: Option<&TypeDescriptor>,
        mapping: &PropertyMapping,
    ) -> Result<bool> {
        if let Some(collection) = mapping.collection {
            return Ok(collection);
        }
        if let Some(property) = descriptor.and_then(|d| d.property_named(&mapping.property)) {
            return Ok(property.collection);
        }
        if descriptor.is_some_and(|d| d.open) {
            return Err(Error::config(format!(
                "cannot infer collection typing for property '{}' on an open type; \
                 declare the mapping's collection flag",
                mapping.property
            )));
        }
        Ok(false)
    }

    // ---- nested result shapes ----

    pub(crate) fn row_value_nested(
        &mut self,
        row: &sqlmapper_core::Row,
        shape: &Arc<ResultShape>,
        combined_key: Option<CacheKey>,
        prefix: &str,
        partial: Option<RowValue>,
        bag: &ParamBag,
        state: &mut MaterializeState,
    ) -> Result<Option<RowValue>> {
        if let Some(RowValue::Object(handle)) = partial {
            state.ancestors.insert(shape.id.clone(), handle);
            self.apply_nested_result_mappings(
                row,
                shape,
                prefix,
                handle,
                combined_key.as_ref(),
                false,
                bag,
                state,
            )?;
            state.ancestors.remove(&shape.id);
            return Ok(Some(RowValue::Object(handle)));
        }

        let Some((created, used_ctor)) = self.create_result_object(row, shape, prefix, bag, state)?
        else {
            if let Some(key) = combined_key {
                state.nested_results.insert(key, None);
            }
            return Ok(None);
        };
        let row_value = match created {
            Created::Value(v) => Some(RowValue::Value(v)),
            Created::Object(handle) => {
                let mut found = used_ctor;
                if self.config.should_auto_map(shape, true) {
                    found |= self.apply_automatic_mappings(row, shape, prefix, handle, state)?;
                }
                found |= self.apply_property_mappings(row, shape, prefix, handle, bag, state)?;
                state.ancestors.insert(shape.id.clone(), handle);
                found |= self.apply_nested_result_mappings(
                    row,
                    shape,
                    prefix,
                    handle,
                    combined_key.as_ref(),
                    true,
                    bag,
                    state,
                )?;
                state.ancestors.remove(&shape.id);
                if found || self.config.settings.return_instance_for_empty_row {
                    Some(RowValue::Object(handle))
                } else {
                    None
                }
            }
        };
        if let Some(key) = combined_key {
            state.nested_results.insert(key, row_value.clone());
        }
        Ok(row_value)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_nested_result_mappings(
        &mut self,
        row: &sqlmapper_core::Row,
        parent_shape: &Arc<ResultShape>,
        parent_prefix: &str,
        parent_handle: ObjectHandle,
        parent_key: Option<&CacheKey>,
        new_object: bool,
        bag: &ParamBag,
        state: &mut MaterializeState,
    ) -> Result<bool> {
        let parent_descriptor = self.config.types.get(&parent_shape.type_name).ok();
        let mappings = parent_shape.mappings.clone();
        let mut found = false;

        for mapping in mappings.iter().filter(|m| m.is_nested_result()) {
            let prefix = child_prefix(parent_prefix, mapping);
            let nested_id = mapping.nested_shape.as_deref().unwrap_or_default();
            let nested = self.config.shape(nested_id)?;
            let nested = self.resolve_discriminated(row, nested, &prefix, state)?;

            // A nested shape already being materialized further up this
            // same row links back to that in-progress object. Prefixed
            // joins opt out: their columns describe a distinct instance.
            if mapping.column_prefix.is_none() {
                if let Some(&ancestor) = state.ancestors.get(&nested.id) {
                    if new_object {
                        self.link_objects(
                            parent_handle,
                            mapping,
                            parent_descriptor.as_deref(),
                            &RowValue::Object(ancestor),
                        )?;
                    }
                    continue;
                }
            }

            let child_key = self.create_row_key(row, &nested, &prefix, state)?;
            let combined = match (&child_key, parent_key) {
                (Some(child), Some(parent)) => Some(child.combine(parent)),
                _ => None,
            };
            let partial_entry = combined
                .as_ref()
                .and_then(|k| state.nested_results.get(k).cloned());
            let known = matches!(partial_entry, Some(Some(_)));
            let partial = partial_entry.flatten();

            if self.is_collection_mapping(parent_descriptor.as_deref(), mapping)? {
                self.instantiate_collection(parent_handle, &mapping.property);
            }
            if self.any_not_null_column_has_value(row, mapping, &prefix, state) {
                let value = self
                    .row_value_nested(row, &nested, combined, &prefix, partial, bag, state)
                    .map_err(|e| e.for_property(&mapping.property))?;
                if let Some(value) = value {
                    if !known {
                        self.link_objects(
                            parent_handle,
                            mapping,
                            parent_descriptor.as_deref(),
                            &value,
                        )?;
                        found = true;
                    }
                }
            }
        }
        Ok(found)
    }

    fn instantiate_collection(&mut self, handle: ObjectHandle, property: &str) {
        if let Some(object) = self.arena.get_mut(handle) {
            if object.get(property).is_none() {
                object.set(property.to_string(), Slot::List(Vec::new()));
            }
        }
    }

    fn link_objects(
        &mut self,
        parent: ObjectHandle,
        mapping: &PropertyMapping,
        parent_descriptor: Option<&TypeDescriptor>,
        value: &RowValue,
    ) -> Result<()> {
        let collection = self.is_collection_mapping(parent_descriptor, mapping)?;
        if let Some(object) = self.arena.get_mut(parent) {
            if collection {
                object.push_item(&mapping.property, row_to_item(value));
            } else {
                object.set(mapping.property.clone(), row_to_slot(value));
            }
        }
        Ok(())
    }

    fn any_not_null_column_has_value(
        &self,
        row: &sqlmapper_core::Row,
        mapping: &PropertyMapping,
        prefix: &str,
        state: &MaterializeState,
    ) -> bool {
        if !mapping.not_null_columns.is_empty() {
            return mapping.not_null_columns.iter().any(|column| {
                row.get_by_name(&prepend(prefix, column))
                    .is_some_and(|v| !v.is_null())
            });
        }
        if !prefix.is_empty() {
            let upper = prefix.to_uppercase();
            return state
                .analysis
                .columns()
                .iter()
                .any(|c| c.name.to_uppercase().starts_with(&upper));
        }
        true
    }

    // ---- row identity ----

    /// Build the composite key identifying this row for this shape. `None`
    /// when fewer than two contributions accrued; such rows never merge.
    pub(crate) fn create_row_key(
        &mut self,
        row: &sqlmapper_core::Row,
        shape: &Arc<ResultShape>,
        prefix: &str,
        state: &mut MaterializeState,
    ) -> Result<Option<CacheKey>> {
        let mut key = CacheKey::new();
        key.update(&Value::Text(shape.id.clone()));
        if shape.mappings.is_empty() {
            let open = self
                .config
                .types
                .get(&shape.type_name)
                .map(|d| d.open)
                .unwrap_or(false);
            if open {
                row_key_for_map(row, &mut key);
            } else {
                self.row_key_for_unmapped(row, shape, prefix, &mut key, state)?;
            }
        } else {
            self.row_key_for_mapped(row, shape, prefix, &mut key, state)?;
        }
        Ok(if key.update_count() < 2 { None } else { Some(key) })
    }

    fn row_key_for_mapped(
        &mut self,
        row: &sqlmapper_core::Row,
        shape: &Arc<ResultShape>,
        prefix: &str,
        key: &mut CacheKey,
        state: &mut MaterializeState,
    ) -> Result<()> {
        let mappings: Vec<PropertyMapping> =
            shape.id_mappings().into_iter().cloned().collect();
        for mapping in &mappings {
            if mapping.is_nested_result() {
                let nested_id = mapping.nested_shape.as_deref().unwrap_or_default();
                let nested = self.config.shape(nested_id)?;
                let nested_prefix = child_prefix(prefix, mapping);
                self.row_key_for_mapped(row, &nested, &nested_prefix, key, state)?;
            } else if mapping.nested_query.is_none() && !mapping.column.is_empty() {
                // A nested query's join column names the sub-statement's
                // parameter, not part of this row's identity.
                let column = prepend(prefix, &mapping.column);
                let codec = state
                    .analysis
                    .codec_for(&self.config, mapping.target_type, &column);
                if !row.contains_column(&column) {
                    continue;
                }
                let value = codec.read(row, &column)?;
                if !value.is_null() || self.config.settings.return_instance_for_empty_row {
                    key.update(&Value::Text(column));
                    key.update(&value);
                }
            }
        }
        Ok(())
    }

    fn row_key_for_unmapped(
        &mut self,
        row: &sqlmapper_core::Row,
        shape: &Arc<ResultShape>,
        prefix: &str,
        key: &mut CacheKey,
        state: &mut MaterializeState,
    ) -> Result<()> {
        let Ok(descriptor) = self.config.types.get(&shape.type_name) else {
            return Ok(());
        };
        let underscore = self.config.settings.map_underscore_to_camel_case;
        let upper_prefix = prefix.to_uppercase();
        let unmapped: Vec<String> = state.analysis.unmapped_columns(shape, prefix).to_vec();
        for column in unmapped {
            let stripped = if upper_prefix.is_empty() {
                column.clone()
            } else if column.to_uppercase().starts_with(&upper_prefix) {
                column[upper_prefix.len()..].to_string()
            } else {
                continue;
            };
            if descriptor.find_property(&stripped, underscore).is_none() {
                continue;
            }
            if let Some(value) = row.get_by_name(&column) {
                if !value.is_null() {
                    key.update(&Value::Text(column.clone()));
                    key.update(&Value::Text(value.to_string()));
                }
            }
        }
        Ok(())
    }
}

fn row_key_for_map(row: &sqlmapper_core::Row, key: &mut CacheKey) {
    let pairs: Vec<(String, String)> = row
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(name, v)| (name.to_string(), v.to_string()))
        .collect();
    for (name, value) in pairs {
        key.update(&Value::Text(name));
        key.update(&Value::Text(value));
    }
}

/// Build the parameter bag for a nested sub-query. Composite mappings read
/// each named column; a composite that is entirely null suppresses the
/// query. Single-column mappings expose the value under both `value` and
/// the column's own name.
fn nested_query_bag(
    row: &sqlmapper_core::Row,
    composites: &[(String, String)],
    column: &str,
    prefix: &str,
) -> Option<ParamBag> {
    if composites.is_empty() {
        let value = row.get_by_name(&prepend(prefix, column)).cloned()?;
        if value.is_null() {
            return None;
        }
        let mut bag = ParamBag::new();
        bag.set("value", value.clone());
        bag.set(column, value);
        return Some(bag);
    }
    let mut bag = ParamBag::new();
    let mut any = false;
    for (property, col) in composites {
        let value = row
            .get_by_name(&prepend(prefix, col))
            .cloned()
            .unwrap_or(Value::Null);
        if !value.is_null() {
            any = true;
        }
        bag.set(property.clone(), value);
    }
    if any { Some(bag) } else { None }
}
