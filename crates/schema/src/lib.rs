//! Kestrel schema: the type registry ("scheme") mapping kind identifiers to
//! statically known k8s-openapi types, and the object representation shared
//! by the rest of the workspace.
//!
//! Objects are either `Typed` (a registered kind, decoded into its
//! k8s-openapi struct) or `Raw` (any other kind, e.g. custom resources, kept
//! as a `DynamicObject`).

#![forbid(unsafe_code)]

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kestrel_core::{Gvk, Gvr};
use kube::core::DynamicObject;
use rustc_hash::FxHashMap;

mod convert;
mod kinds;

pub use kinds::TypedObject;

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("decoding {gvk}: {source}")]
    Decode {
        gvk: Gvk,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding dynamic object: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemeError {
    #[error("no kind identifier resolvable for object {name:?}")]
    Unresolvable { name: String },
}

/// Registry entry for one statically known kind.
#[derive(Debug, Clone)]
pub struct SchemeEntry {
    pub gvk: Gvk,
    pub plural: String,
    pub namespaced: bool,
    decode: fn(serde_json::Value) -> Result<TypedObject, serde_json::Error>,
}

impl SchemeEntry {
    pub fn gvr(&self) -> Gvr { Gvr::new(self.gvk.group.clone(), self.gvk.version.clone(), self.plural.clone()) }

    pub fn decode(&self, value: serde_json::Value) -> Result<TypedObject, serde_json::Error> { (self.decode)(value) }
}

/// Type registry keyed by GVK.
#[derive(Debug, Clone, Default)]
pub struct Scheme {
    entries: FxHashMap<Gvk, SchemeEntry>,
}

impl Scheme {
    pub fn new() -> Self { Self::default() }

    /// Scheme with every built-in kind registered.
    pub fn with_builtins() -> Self {
        let mut scheme = Self::new();
        for entry in kinds::builtin_entries() {
            scheme.entries.insert(entry.gvk.clone(), entry);
        }
        scheme
    }

    /// Register the built-in kinds of one API group (`""` is the core group).
    /// Returns the number of kinds added.
    pub fn add_group(&mut self, group: &str) -> usize {
        let mut added = 0;
        for entry in kinds::builtin_entries().into_iter().filter(|e| e.gvk.group == group) {
            if self.entries.insert(entry.gvk.clone(), entry).is_none() {
                added += 1;
            }
        }
        added
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn lookup(&self, gvk: &Gvk) -> Option<&SchemeEntry> { self.entries.get(gvk) }

    pub fn contains(&self, gvk: &Gvk) -> bool { self.entries.contains_key(gvk) }

    /// Find the entry serving a collection endpoint.
    pub fn lookup_resource(&self, gvr: &Gvr) -> Option<&SchemeEntry> {
        self.entries.values().find(|e| {
            e.gvk.group == gvr.group && e.gvk.version == gvr.version && e.plural == gvr.resource
        })
    }

    /// All registered kinds, sorted.
    pub fn known_kinds(&self) -> Vec<&Gvk> {
        let mut out: Vec<_> = self.entries.keys().collect();
        out.sort();
        out
    }
}

/// A cluster object in either representation.
#[derive(Debug, Clone)]
pub enum ClusterObject {
    Typed(TypedObject),
    Raw(DynamicObject),
}

impl ClusterObject {
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Self::Typed(t) => t.meta(),
            Self::Raw(d) => &d.metadata,
        }
    }

    pub fn uid(&self) -> Option<&str> { self.meta().uid.as_deref() }

    pub fn name(&self) -> &str { self.meta().name.as_deref().unwrap_or("") }

    pub fn namespace(&self) -> Option<&str> { self.meta().namespace.as_deref() }

    pub fn resource_version(&self) -> Option<&str> { self.meta().resource_version.as_deref() }

    /// Stamped kind identifier. `None` only for raw objects that were never stamped.
    pub fn gvk(&self) -> Option<Gvk> {
        match self {
            Self::Typed(t) => Some(t.gvk()),
            Self::Raw(d) => d
                .types
                .as_ref()
                .and_then(|t| Gvk::from_api_version(&t.api_version, &t.kind).ok())
                .filter(|g| !g.kind.is_empty()),
        }
    }

    pub fn is_typed(&self) -> bool { matches!(self, Self::Typed(_)) }

    pub fn as_typed(&self) -> Option<&TypedObject> {
        match self {
            Self::Typed(t) => Some(t),
            Self::Raw(_) => None,
        }
    }

    /// Identity used by caches: the UID, or `namespace/name` when the server omitted it.
    pub fn key(&self) -> String {
        match self.uid() {
            Some(uid) => uid.to_string(),
            None => match self.namespace() {
                Some(ns) => format!("{}/{}", ns, self.name()),
                None => self.name().to_string(),
            },
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::Typed(t) => t.to_value(),
            Self::Raw(d) => serde_json::to_value(d),
        }
    }
}

impl From<TypedObject> for ClusterObject {
    fn from(t: TypedObject) -> Self { Self::Typed(t) }
}

impl From<DynamicObject> for ClusterObject {
    fn from(d: DynamicObject) -> Self { Self::Raw(d) }
}

/// Element types an observable collection can hold.
///
/// Implemented for every registered k8s-openapi type (matching only its own
/// variant), for `DynamicObject` (any object), and for `ClusterObject`.
pub trait Collectable: Clone + Send + Sync + 'static {
    fn from_object(obj: &ClusterObject) -> Option<Self>;

    fn uid(&self) -> Option<&str>;
}

impl Collectable for ClusterObject {
    fn from_object(obj: &ClusterObject) -> Option<Self> { Some(obj.clone()) }

    fn uid(&self) -> Option<&str> { ClusterObject::uid(self) }
}

impl Collectable for DynamicObject {
    fn from_object(obj: &ClusterObject) -> Option<Self> {
        match obj {
            ClusterObject::Raw(d) => Some(d.clone()),
            ClusterObject::Typed(t) => t.to_value().ok().and_then(|v| serde_json::from_value(v).ok()),
        }
    }

    fn uid(&self) -> Option<&str> { self.metadata.uid.as_deref() }
}
