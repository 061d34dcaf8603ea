//! Column analysis over one result cursor.
//!
//! Memoizes, per result shape and column prefix, which cursor columns the
//! shape claims and which are left for automapping, and memoizes resolved
//! codecs per `(column, target)` so repeated rows pay the fallback chain
//! once.

use sqlmapper_core::{
    Codec, ColumnMeta, Configuration, ResultShape, TargetType,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub struct ColumnAnalysis {
    columns: Vec<ColumnMeta>,
    /// Keyed by "shape_id:PREFIX".
    mapped: HashMap<String, Vec<String>>,
    unmapped: HashMap<String, Vec<String>>,
    codecs: HashMap<(String, TargetType), Arc<dyn Codec>>,
}

impl ColumnAnalysis {
    pub fn new(columns: Vec<ColumnMeta>) -> Self {
        Self {
            columns,
            mapped: HashMap::new(),
            unmapped: HashMap::new(),
            codecs: HashMap::new(),
        }
    }

    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    pub fn column_meta(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_meta(name).is_some()
    }

    fn cache_key(shape: &ResultShape, prefix: &str) -> String {
        format!("{}:{}", shape.id, prefix.to_uppercase())
    }

    fn load(&mut self, shape: &ResultShape, prefix: &str) {
        let key = Self::cache_key(shape, prefix);
        if self.mapped.contains_key(&key) {
            return;
        }
        let claimed: HashSet<String> = shape.mapped_columns(prefix).into_iter().collect();
        let mut mapped = Vec::new();
        let mut unmapped = Vec::new();
        for column in &self.columns {
            if claimed.contains(&column.name.to_uppercase()) {
                mapped.push(column.name.clone());
            } else {
                unmapped.push(column.name.clone());
            }
        }
        self.mapped.insert(key.clone(), mapped);
        self.unmapped.insert(key, unmapped);
    }

    /// Cursor columns this shape claims (actual case), prefix applied.
    pub fn mapped_columns(&mut self, shape: &ResultShape, prefix: &str) -> &[String] {
        self.load(shape, prefix);
        &self.mapped[&Self::cache_key(shape, prefix)]
    }

    /// Cursor columns left over for automapping.
    pub fn unmapped_columns(&mut self, shape: &ResultShape, prefix: &str) -> &[String] {
        self.load(shape, prefix);
        &self.unmapped[&Self::cache_key(shape, prefix)]
    }

    pub fn is_mapped(&mut self, shape: &ResultShape, prefix: &str, column: &str) -> bool {
        let upper = column.to_uppercase();
        self.mapped_columns(shape, prefix)
            .iter()
            .any(|c| c.to_uppercase() == upper)
    }

    /// Resolve (and memoize) the codec reading `column` into `target`.
    pub fn codec_for(
        &mut self,
        config: &Configuration,
        target: TargetType,
        column: &str,
    ) -> Arc<dyn Codec> {
        let key = (column.to_uppercase(), target);
        if let Some(codec) = self.codecs.get(&key) {
            return Arc::clone(codec);
        }
        let codec = match self.column_meta(column) {
            Some(meta) => config.codecs.resolve(target, meta),
            None => config.codecs.passthrough(),
        };
        self.codecs.insert(key, Arc::clone(&codec));
        codec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlmapper_core::{PropertyMapping, SourceType};

    fn analysis() -> ColumnAnalysis {
        ColumnAnalysis::new(vec![
            ColumnMeta::new("id", SourceType::BigInt),
            ColumnMeta::new("user_name", SourceType::Varchar),
            ColumnMeta::new("post_id", SourceType::BigInt),
        ])
    }

    #[test]
    fn splits_mapped_and_unmapped() {
        let shape = ResultShape::new("user", "User")
            .mapping(PropertyMapping::id("id", "id"))
            .mapping(PropertyMapping::column("name", "user_name"));
        let mut a = analysis();
        assert_eq!(a.mapped_columns(&shape, ""), ["id", "user_name"]);
        assert_eq!(a.unmapped_columns(&shape, ""), ["post_id"]);
    }

    #[test]
    fn prefix_changes_the_claim() {
        let shape = ResultShape::new("post", "Post").mapping(PropertyMapping::id("id", "id"));
        let mut a = analysis();
        assert_eq!(a.mapped_columns(&shape, "post_"), ["post_id"]);
        assert!(a.is_mapped(&shape, "post_", "POST_ID"));
        assert!(!a.is_mapped(&shape, "post_", "id"));
    }

    #[test]
    fn codec_memoization_survives_case() {
        let config = Configuration::default();
        let mut a = analysis();
        let c1 = a.codec_for(&config, TargetType::Int64, "ID");
        let c2 = a.codec_for(&config, TargetType::Int64, "id");
        assert!(Arc::ptr_eq(&c1, &c2));
    }
}
