//! Materialized objects, the session arena that owns them, and the type
//! descriptors that say what properties an object carries.
//!
//! Objects are plain slot maps owned by an [`ObjectArena`]; everything else
//! refers to them through [`ObjectHandle`] indices. Handles make parent and
//! child links cheap to copy, let the same object appear in several places
//! (shared children, circular references), and let deferred loads mutate an
//! object after the list holding it has been frozen and cached.

use crate::error::{Error, Result};
use crate::types::TargetType;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Index of an object inside its session's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectHandle(pub usize);

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Ticket for a lazy load registered with the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadId(pub u64);

/// One element of a collection slot.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotItem {
    Value(Value),
    Object(ObjectHandle),
}

/// The content of one object property.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Value(Value),
    Object(ObjectHandle),
    List(Vec<SlotItem>),
    /// A lazy load not yet triggered. Reading through the session resolves
    /// it in place.
    Pending(LoadId),
}

impl Slot {
    pub fn is_pending(&self) -> bool {
        matches!(self, Slot::Pending(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Slot::Value(Value::Null))
    }
}

/// A materialized object: a typed bag of slots.
#[derive(Debug, Clone)]
pub struct DataObject {
    pub type_name: String,
    slots: BTreeMap<String, Slot>,
    /// Open objects accept properties that are not declared on the type.
    pub open: bool,
}

impl DataObject {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            slots: BTreeMap::new(),
            open: false,
        }
    }

    pub fn open(type_name: impl Into<String>) -> Self {
        let mut obj = Self::new(type_name);
        obj.open = true;
        obj
    }

    pub fn get(&self, property: &str) -> Option<&Slot> {
        self.slots.get(property)
    }

    pub fn set(&mut self, property: impl Into<String>, slot: Slot) {
        self.slots.insert(property.into(), slot);
    }

    /// Append one item to a collection slot, creating the list on first use.
    pub fn push_item(&mut self, property: &str, item: SlotItem) {
        match self.slots.get_mut(property) {
            Some(Slot::List(items)) => items.push(item),
            _ => {
                self.slots.insert(property.to_string(), Slot::List(vec![item]));
            }
        }
    }

    pub fn properties(&self) -> impl Iterator<Item = (&str, &Slot)> {
        self.slots.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Find the load ticket parked in a slot, if any.
    pub fn pending(&self, property: &str) -> Option<LoadId> {
        match self.slots.get(property) {
            Some(Slot::Pending(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn pending_loads(&self) -> impl Iterator<Item = (&str, LoadId)> {
        self.slots.iter().filter_map(|(k, v)| match v {
            Slot::Pending(id) => Some((k.as_str(), *id)),
            _ => None,
        })
    }
}

/// Owns every object a session materializes.
#[derive(Debug, Default)]
pub struct ObjectArena {
    objects: Vec<DataObject>,
}

impl ObjectArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, object: DataObject) -> ObjectHandle {
        let handle = ObjectHandle(self.objects.len());
        self.objects.push(object);
        handle
    }

    pub fn get(&self, handle: ObjectHandle) -> Option<&DataObject> {
        self.objects.get(handle.0)
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut DataObject> {
        self.objects.get_mut(handle.0)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Render an object tree as JSON, following handles. Cycles render as
    /// `{"$cycle": <type name>}` at the point of re-entry.
    pub fn object_json(&self, handle: ObjectHandle) -> serde_json::Value {
        let mut visiting = HashSet::new();
        self.json_inner(handle, &mut visiting)
    }

    fn json_inner(
        &self,
        handle: ObjectHandle,
        visiting: &mut HashSet<ObjectHandle>,
    ) -> serde_json::Value {
        let Some(object) = self.get(handle) else {
            return serde_json::Value::Null;
        };
        if !visiting.insert(handle) {
            let mut marker = serde_json::Map::new();
            marker.insert(
                "$cycle".to_string(),
                serde_json::Value::String(object.type_name.clone()),
            );
            return serde_json::Value::Object(marker);
        }
        let mut map = serde_json::Map::new();
        for (name, slot) in object.properties() {
            let rendered = match slot {
                Slot::Value(v) => v.to_json(),
                Slot::Object(h) => self.json_inner(*h, visiting),
                Slot::List(items) => serde_json::Value::Array(
                    items
                        .iter()
                        .map(|item| match item {
                            SlotItem::Value(v) => v.to_json(),
                            SlotItem::Object(h) => self.json_inner(*h, visiting),
                        })
                        .collect(),
                ),
                Slot::Pending(_) => serde_json::Value::String("<pending>".to_string()),
            };
            map.insert(name.to_string(), rendered);
        }
        visiting.remove(&handle);
        serde_json::Value::Object(map)
    }

    /// Structural equality of two object trees, cycle-safe.
    pub fn objects_equal(&self, a: ObjectHandle, b: ObjectHandle) -> bool {
        let mut seen = HashSet::new();
        self.equal_inner(a, b, &mut seen)
    }

    fn equal_inner(
        &self,
        a: ObjectHandle,
        b: ObjectHandle,
        seen: &mut HashSet<(ObjectHandle, ObjectHandle)>,
    ) -> bool {
        if a == b {
            return true;
        }
        if !seen.insert((a, b)) {
            // Already comparing this pair further up the stack.
            return true;
        }
        let (Some(oa), Some(ob)) = (self.get(a), self.get(b)) else {
            return false;
        };
        if oa.type_name != ob.type_name || oa.len() != ob.len() {
            return false;
        }
        oa.properties().zip(ob.properties()).all(|((ka, sa), (kb, sb))| {
            ka == kb && self.slots_equal(sa, sb, seen)
        })
    }

    fn slots_equal(
        &self,
        a: &Slot,
        b: &Slot,
        seen: &mut HashSet<(ObjectHandle, ObjectHandle)>,
    ) -> bool {
        match (a, b) {
            (Slot::Value(va), Slot::Value(vb)) => va == vb,
            (Slot::Object(ha), Slot::Object(hb)) => self.equal_inner(*ha, *hb, seen),
            (Slot::List(la), Slot::List(lb)) => {
                la.len() == lb.len()
                    && la.iter().zip(lb.iter()).all(|(ia, ib)| match (ia, ib) {
                        (SlotItem::Value(va), SlotItem::Value(vb)) => va == vb,
                        (SlotItem::Object(ha), SlotItem::Object(hb)) => {
                            self.equal_inner(*ha, *hb, seen)
                        }
                        _ => false,
                    })
            }
            (Slot::Pending(pa), Slot::Pending(pb)) => pa == pb,
            _ => false,
        }
    }
}

/// One declared property of a registered type.
#[derive(Debug, Clone)]
pub struct PropertyDescriptor {
    pub name: String,
    pub target_type: TargetType,
    /// Collection properties accumulate items instead of being assigned.
    pub collection: bool,
}

impl PropertyDescriptor {
    pub fn new(name: impl Into<String>, target_type: TargetType) -> Self {
        Self {
            name: name.into(),
            target_type,
            collection: false,
        }
    }

    pub fn collection(mut self, collection: bool) -> Self {
        self.collection = collection;
        self
    }
}

/// One constructor signature a type can be built through.
#[derive(Debug, Clone)]
pub struct ConstructorSig {
    /// Argument name and target type, in declaration order.
    pub args: Vec<(String, TargetType)>,
}

impl ConstructorSig {
    pub fn new(args: Vec<(String, TargetType)>) -> Self {
        Self { args }
    }
}

/// Describes one materializable type: its properties and how it can be
/// instantiated.
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    pub name: String,
    pub properties: Vec<PropertyDescriptor>,
    pub has_default_constructor: bool,
    pub constructors: Vec<ConstructorSig>,
    /// Open types are map-shaped and accept any property name.
    pub open: bool,
    /// Collection types hold items rather than named properties.
    pub collection: bool,
}

impl TypeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
            has_default_constructor: true,
            constructors: Vec::new(),
            open: false,
            collection: false,
        }
    }

    /// A map-shaped type: every property name is accepted.
    pub fn open_map(name: impl Into<String>) -> Self {
        let mut ty = Self::new(name);
        ty.open = true;
        ty
    }

    pub fn property(mut self, property: PropertyDescriptor) -> Self {
        self.properties.push(property);
        self
    }

    pub fn default_constructor(mut self, has: bool) -> Self {
        self.has_default_constructor = has;
        self
    }

    pub fn constructor(mut self, sig: ConstructorSig) -> Self {
        self.constructors.push(sig);
        self
    }

    pub fn collection_type(mut self) -> Self {
        self.collection = true;
        self
    }

    /// Find the property a column name refers to. Matching is
    /// case-insensitive; with `underscore_to_camel` set, underscores in the
    /// column name are ignored so `user_name` matches `userName`.
    pub fn find_property(&self, column: &str, underscore_to_camel: bool) -> Option<&PropertyDescriptor> {
        let needle = if underscore_to_camel {
            column.replace('_', "").to_uppercase()
        } else {
            column.to_uppercase()
        };
        self.properties
            .iter()
            .find(|p| p.name.to_uppercase() == needle)
    }

    pub fn property_named(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// Registry of materializable types, keyed by name.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: HashMap<String, Arc<TypeDescriptor>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: TypeDescriptor) {
        self.types
            .insert(descriptor.name.clone(), Arc::new(descriptor));
    }

    pub fn get(&self, name: &str) -> Result<Arc<TypeDescriptor>> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| Error::config(format!("unknown type '{name}'")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }
}

/// Creates empty or constructor-initialized objects for the materializer.
pub trait ObjectFactory: Send + Sync {
    /// Create an empty instance through the default constructor.
    fn create(&self, descriptor: &TypeDescriptor) -> Result<DataObject>;

    /// Create an instance through a constructor, seeding the named slots.
    fn create_with_args(
        &self,
        descriptor: &TypeDescriptor,
        args: Vec<(String, Value)>,
    ) -> Result<DataObject>;

    /// Is this type a collection container?
    fn is_collection(&self, descriptor: &TypeDescriptor) -> bool {
        descriptor.collection
    }
}

/// The standard factory: slot maps all the way down.
#[derive(Debug, Default)]
pub struct DefaultObjectFactory;

impl ObjectFactory for DefaultObjectFactory {
    fn create(&self, descriptor: &TypeDescriptor) -> Result<DataObject> {
        if !descriptor.has_default_constructor && !descriptor.open {
            return Err(Error::config(format!(
                "type '{}' has no default constructor and no matching argument set was supplied",
                descriptor.name
            )));
        }
        Ok(if descriptor.open {
            DataObject::open(&descriptor.name)
        } else {
            DataObject::new(&descriptor.name)
        })
    }

    fn create_with_args(
        &self,
        descriptor: &TypeDescriptor,
        args: Vec<(String, Value)>,
    ) -> Result<DataObject> {
        let mut object = if descriptor.open {
            DataObject::open(&descriptor.name)
        } else {
            DataObject::new(&descriptor.name)
        };
        for (name, value) in args {
            object.set(name, Slot::Value(value));
        }
        Ok(object)
    }
}
