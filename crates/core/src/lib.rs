//! Lantern core types: resource identity, objects, change events and the transport seam.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod error;
pub mod mock;
mod transport;

pub use error::{Error, ErrorKind, Result};
pub use transport::{EventSource, Transport, UpstreamWatch, WatchFeed, WatchStopper};

pub mod prelude {
    pub use super::{
        ChangeEvent, Error, ErrorKind, EventKind, EventSource, ListOptions, Object, ObjectKey, ResourceId,
        ResourceMeta, Result, Transport, UpstreamWatch,
    };
}

/// Verb a resource must permit for the informer to keep it in memory.
pub const WATCH_VERB: &str = "watch";

/// `(group, version, resource)` triple naming a kind of object on the server.
///
/// Ordered by its key form (`version/resource` for the core group,
/// `group/version/resource` otherwise).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl ResourceId {
    pub fn new(group: impl Into<String>, version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), resource: resource.into() }
    }

    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.resource)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.resource)
        }
    }

    /// `group/version` as used in an object's `apiVersion`.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for ResourceId {
    type Err = Error;

    fn from_str(key: &str) -> Result<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(Error::InvalidResource(key.to_string()));
        }
        match parts.as_slice() {
            [version, resource] => Ok(Self::new("", *version, *resource)),
            [group, version, resource] => Ok(Self::new(*group, *version, *resource)),
            _ => Err(Error::InvalidResource(key.to_string())),
        }
    }
}

impl PartialOrd for ResourceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourceId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Discovery metadata for one served resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub id: ResourceId,
    pub kind: String,
    pub verbs: SmallVec<[String; 8]>,
    pub namespaced: bool,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl ResourceMeta {
    pub fn new<V: Into<String>>(
        id: ResourceId,
        kind: impl Into<String>,
        verbs: impl IntoIterator<Item = V>,
        namespaced: bool,
    ) -> Self {
        Self {
            id,
            kind: kind.into(),
            verbs: verbs.into_iter().map(Into::into).collect(),
            namespaced,
            categories: Vec::new(),
        }
    }

    pub fn supports(&self, verb: &str) -> bool {
        self.verbs.iter().any(|v| v == verb)
    }

    pub fn is_watchable(&self) -> bool { self.supports(WATCH_VERB) }
}

/// Look up a catalog entry by `(group, version, kind)`.
pub fn find_by_kind<'a>(catalog: &'a [ResourceMeta], group: &str, version: &str, kind: &str) -> Option<&'a ResourceMeta> {
    catalog.iter().find(|m| m.id.group == group && m.id.version == version && m.kind == kind)
}

pub fn namespace_scoped(catalog: &[ResourceMeta]) -> Vec<&ResourceMeta> {
    catalog.iter().filter(|m| m.namespaced).collect()
}

pub fn cluster_scoped(catalog: &[ResourceMeta]) -> Vec<&ResourceMeta> {
    catalog.iter().filter(|m| !m.namespaced).collect()
}

/// Primary key of an object within one resource. Cluster-scoped objects have an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Opaque structured document. Only `metadata.{name,namespace,resourceVersion}` are ever read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Object {
    raw: serde_json::Value,
}

impl Object {
    pub fn new(raw: serde_json::Value) -> Self { Self { raw } }

    /// Wrap a raw server document, dropping `metadata.managedFields` when the
    /// `strip-managed-fields` feature is on.
    pub fn from_server(mut raw: serde_json::Value) -> Self {
        strip_managed_fields(&mut raw);
        Self { raw }
    }

    pub fn raw(&self) -> &serde_json::Value { &self.raw }

    pub fn into_raw(self) -> serde_json::Value { self.raw }

    fn meta_str(&self, field: &str) -> Option<&str> {
        self.raw.get("metadata").and_then(|m| m.get(field)).and_then(|v| v.as_str())
    }

    /// `metadata.name`, absent when missing or empty.
    pub fn name(&self) -> Option<&str> {
        self.meta_str("name").filter(|n| !n.is_empty())
    }

    /// `metadata.namespace`, empty for cluster-scoped objects.
    pub fn namespace(&self) -> &str {
        self.meta_str("namespace").unwrap_or("")
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.meta_str("resourceVersion")
    }

    /// Store key, or `None` for objects without a name.
    pub fn key(&self) -> Option<ObjectKey> {
        self.name().map(|name| ObjectKey::new(self.namespace(), name))
    }
}

#[cfg(feature = "strip-managed-fields")]
fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

#[cfg(not(feature = "strip-managed-fields"))]
fn strip_managed_fields(_v: &mut serde_json::Value) {}

impl From<serde_json::Value> for Object {
    fn from(raw: serde_json::Value) -> Self { Self::new(raw) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
    Bookmark,
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
            Self::Bookmark => "BOOKMARK",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// One change to one object of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: EventKind,
    pub resource: ResourceId,
    pub object: Object,
}

impl ChangeEvent {
    pub fn new(kind: EventKind, resource: ResourceId, object: Object) -> Self {
        Self { kind, resource, object }
    }
}

/// Options accepted by list and watch. Only `namespace` is evaluated in memory;
/// the other fields are passed through to the server untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListOptions {
    /// Namespace scope; empty means all namespaces.
    pub namespace: String,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    /// Resource version a server-side watch starts from.
    pub resource_version: Option<String>,
    pub timeout_secs: Option<u32>,
}

impl ListOptions {
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), ..Self::default() }
    }

    pub fn matches(&self, object: &Object) -> bool {
        self.namespace.is_empty() || self.namespace == object.namespace()
    }
}
