//! Composite cache keys built from ordered contributions.

use sqlmapper_core::{Value, value_hash};
use std::fmt;
use std::hash::{Hash, Hasher};

const SEED: u64 = 17;
const MULTIPLIER: u64 = 37;

/// One folded contribution: its hash and its string form. The string form
/// keeps equality exact when hashes collide and makes keys loggable.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Contribution {
    hash: u64,
    repr: String,
}

/// A composite key identifying one logical query execution.
///
/// Contributions are order-sensitive: the same values folded in a different
/// order produce a different key. Two keys are equal only when their folded
/// hash, checksum, count, and every positional contribution agree.
#[derive(Debug, Clone)]
pub struct CacheKey {
    hashcode: u64,
    checksum: u64,
    contributions: Vec<Contribution>,
}

impl CacheKey {
    pub fn new() -> Self {
        Self {
            hashcode: SEED,
            checksum: 0,
            contributions: Vec::new(),
        }
    }

    /// Fold one value into the key.
    pub fn update(&mut self, value: &Value) {
        self.fold(value_hash(value), value.to_string());
    }

    /// Fold a pre-hashed contribution, used when combining keys.
    fn fold(&mut self, base_hash: u64, repr: String) {
        let count = self.contributions.len() as u64 + 1;
        self.checksum = self.checksum.wrapping_add(base_hash);
        let positional = base_hash.wrapping_mul(count);
        self.hashcode = self
            .hashcode
            .wrapping_mul(MULTIPLIER)
            .wrapping_add(positional);
        self.contributions.push(Contribution {
            hash: base_hash,
            repr,
        });
    }

    pub fn update_all(&mut self, values: impl IntoIterator<Item = Value>) {
        for value in values {
            self.update(&value);
        }
    }

    /// Number of contributions folded in so far.
    pub fn update_count(&self) -> usize {
        self.contributions.len()
    }

    /// A row key is usable for identity only when it carries the shape id
    /// plus at least one column contribution.
    pub fn is_usable(&self) -> bool {
        self.contributions.len() > 1
    }

    /// Clone this key and fold the parent key in as one contribution, tying
    /// a child row's identity to its parent row.
    pub fn combine(&self, parent: &CacheKey) -> CacheKey {
        let mut combined = self.clone();
        combined.fold(parent.hashcode, parent.to_string());
        combined
    }
}

impl Default for CacheKey {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hashcode == other.hashcode
            && self.checksum == other.checksum
            && self.contributions == other.contributions
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hashcode.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hashcode, self.checksum)?;
        for c in &self.contributions {
            write!(f, ":{}", c.repr)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_of(values: &[Value]) -> CacheKey {
        let mut key = CacheKey::new();
        for v in values {
            key.update(v);
        }
        key
    }

    #[test]
    fn same_contributions_same_key() {
        let a = key_of(&[Value::Text("findUser".into()), Value::BigInt(1)]);
        let b = key_of(&[Value::Text("findUser".into()), Value::BigInt(1)]);
        assert_eq!(a, b);
        let mut hasher_a = std::collections::hash_map::DefaultHasher::new();
        let mut hasher_b = std::collections::hash_map::DefaultHasher::new();
        a.hash(&mut hasher_a);
        b.hash(&mut hasher_b);
        assert_eq!(hasher_a.finish(), hasher_b.finish());
    }

    #[test]
    fn order_matters() {
        let a = key_of(&[Value::Int(1), Value::Int(2)]);
        let b = key_of(&[Value::Int(2), Value::Int(1)]);
        assert_ne!(a, b);
    }

    #[test]
    fn value_type_matters() {
        let a = key_of(&[Value::Int(1)]);
        let b = key_of(&[Value::BigInt(1)]);
        assert_ne!(a, b);
    }

    #[test]
    fn usability_threshold() {
        let mut key = CacheKey::new();
        assert!(!key.is_usable());
        key.update(&Value::Text("shape".into()));
        assert!(!key.is_usable());
        key.update(&Value::BigInt(7));
        assert!(key.is_usable());
    }

    #[test]
    fn combine_ties_child_to_parent() {
        let child = key_of(&[Value::Text("post".into()), Value::Int(10)]);
        let parent_a = key_of(&[Value::Text("author".into()), Value::Int(1)]);
        let parent_b = key_of(&[Value::Text("author".into()), Value::Int(2)]);
        let combined_a = child.combine(&parent_a);
        let combined_b = child.combine(&parent_b);
        assert_ne!(combined_a, combined_b);
        assert_eq!(combined_a, child.combine(&parent_a));
        assert_ne!(combined_a, child);
    }

    #[test]
    fn display_lists_contributions() {
        let key = key_of(&[Value::Text("findUser".into()), Value::BigInt(42)]);
        let text = key.to_string();
        assert!(text.ends_with(":findUser:42"));
    }
}
