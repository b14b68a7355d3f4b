//! Typed, heterogeneous attribute storage attached to every vertex, edge, and cluster.
//!
//! A [`PropertyBag`] holds at most one value per declared *kind* — a zero-sized marker
//! type implementing [`PropertyKind`], which fixes the stored value's type via an
//! associated type. There is no up-front list of kinds to declare: a bag starts empty
//! and each kind default-constructs lazily the first time it's read, so the "mandatory
//! `index`/`changed` kind, injected if absent" rule in the specification falls out for
//! free — `IndexKind` and `ChangedKind` are ordinary kinds that happen to be reached for
//! internally, sharing the exact same storage and accessor path as caller-declared ones.
//!
//! [`ObjectBag`] is the analogous store for opaque, reference-counted payloads: one
//! optional `Rc<dyn Any>` slot per declared [`ObjectKind`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// A declared property kind: a zero-sized marker type fixing a value type.
///
/// Implementors are typically unit structs, e.g. `struct Length;`. The marker type
/// itself is never instantiated by callers — it only ever appears as a type parameter.
///
/// `Value: Clone` is required so [`PropertyBag`] itself can be cheaply cloned — needed
/// by [`copy_into`](crate::cluster::Cluster::copy_into), which reproduces every
/// vertex's, edge's, and cluster's property bag in the destination tree.
pub trait PropertyKind: 'static {
    /// The value type stored for this kind.
    type Value: Default + Clone + 'static;
}

/// Type-erased storage cell that additionally knows how to clone itself — the blanket
/// impl below is what lets [`PropertyBag`] stay a plain `TypeId`-keyed map while still
/// supporting `Clone` without each caller-declared kind naming `dyn Any` itself.
trait StoredValue: Any {
    fn clone_value(&self) -> Box<dyn StoredValue>;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Clone + 'static> StoredValue for T {
    fn clone_value(&self) -> Box<dyn StoredValue> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A declared object (payload) kind: a zero-sized marker type fixing a payload type.
pub trait ObjectKind: 'static {
    /// The payload type stored for this kind, always held behind `Rc`.
    type Value: 'static;
}

/// Mandatory vertex/edge property kind: a dense `0..n` index, rebuilt by
/// [`init_index_maps`](crate::cluster::Cluster::init_index_maps).
pub struct IndexKind;

impl PropertyKind for IndexKind {
    type Value = usize;
}

/// Mandatory cluster property kind: whether this cluster has been mutated outside copy
/// mode since the flag was last reset.
pub struct ChangedKind;

impl PropertyKind for ChangedKind {
    type Value = bool;
}

/// Heterogeneous, typed attribute bag: one slot per declared [`PropertyKind`].
#[derive(Default)]
pub struct PropertyBag {
    slots: HashMap<TypeId, Box<dyn StoredValue>>,
}

impl PropertyBag {
    /// A fresh, empty bag. Every kind default-constructs on first access.
    pub fn new() -> Self {
        PropertyBag {
            slots: HashMap::new(),
        }
    }

    /// Read this kind's value, default-constructing it on first access.
    pub fn get<K: PropertyKind>(&mut self) -> &K::Value {
        self.slots
            .entry(TypeId::of::<K>())
            .or_insert_with(|| Box::new(K::Value::default()))
            .as_any()
            .downcast_ref::<K::Value>()
            .expect("PropertyBag: kind type mismatch on downcast")
    }

    /// Read this kind's value without creating it; `None` if never set or read before.
    pub fn peek<K: PropertyKind>(&self) -> Option<&K::Value> {
        self.slots.get(&TypeId::of::<K>()).map(|boxed| {
            boxed
                .as_any()
                .downcast_ref::<K::Value>()
                .expect("kind type mismatch")
        })
    }

    /// Overwrite this kind's value.
    pub fn set<K: PropertyKind>(&mut self, value: K::Value) {
        self.slots.insert(TypeId::of::<K>(), Box::new(value));
    }
}

impl Clone for PropertyBag {
    fn clone(&self) -> Self {
        PropertyBag {
            slots: self
                .slots
                .iter()
                .map(|(&k, v)| (k, v.clone_value()))
                .collect(),
        }
    }
}

impl fmt::Debug for PropertyBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyBag")
            .field("slots", &self.slots.len())
            .finish()
    }
}

/// Heterogeneous, typed payload bag: one optional shared handle per declared
/// [`ObjectKind`].
#[derive(Default)]
pub struct ObjectBag {
    slots: HashMap<TypeId, Rc<dyn Any>>,
}

impl ObjectBag {
    /// A fresh, empty bag. Every kind starts absent.
    pub fn new() -> Self {
        ObjectBag {
            slots: HashMap::new(),
        }
    }

    /// The payload installed for this kind, if any.
    pub fn get<K: ObjectKind>(&self) -> Option<Rc<K::Value>> {
        self.slots.get(&TypeId::of::<K>()).map(|rc| {
            Rc::downcast::<K::Value>(Rc::clone(rc)).expect("ObjectBag: kind type mismatch")
        })
    }

    /// Install (or replace) the payload for this kind.
    pub fn set<K: ObjectKind>(&mut self, value: Rc<K::Value>) {
        self.slots.insert(TypeId::of::<K>(), value as Rc<dyn Any>);
    }

    /// Remove and return the payload for this kind, if any.
    pub fn take<K: ObjectKind>(&mut self) -> Option<Rc<K::Value>> {
        self.slots.remove(&TypeId::of::<K>()).map(|rc| {
            Rc::downcast::<K::Value>(rc).expect("ObjectBag: kind type mismatch")
        })
    }

    /// Whether any payload kind has ever been installed.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterate the raw `(kind, payload)` pairs, type-erased.
    ///
    /// Used only by [`copy_into`](crate::cluster::Cluster::copy_into), which must pass
    /// every stored payload through a caller-supplied functor without knowing any
    /// declared kind's concrete type.
    pub(crate) fn iter_raw(&self) -> impl Iterator<Item = (TypeId, &Rc<dyn Any>)> {
        self.slots.iter().map(|(&k, v)| (k, v))
    }

    /// Install a raw `(kind, payload)` pair, type-erased. See [`iter_raw`](Self::iter_raw).
    pub(crate) fn insert_raw(&mut self, kind: TypeId, value: Rc<dyn Any>) {
        self.slots.insert(kind, value);
    }
}

impl fmt::Debug for ObjectBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBag")
            .field("slots", &self.slots.len())
            .finish()
    }
}
