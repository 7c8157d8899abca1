//! Kestrel core types: resource identifiers and the discovered-resource model.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("invalid gvk key: {0} (expect v1/Kind or group/v1/Kind)")]
    InvalidGvkKey(String),
    #[error("invalid gvr key: {0} (expect v1/resources or group/v1/resources)")]
    InvalidGvrKey(String),
    #[error("invalid apiVersion: {0:?}")]
    InvalidApiVersion(String),
}

/// Split an apiVersion (`apps/v1`, `v1`) into `(group, version)`.
pub fn split_api_version(api_version: &str) -> Result<(String, String), CoreError> {
    let parts: Vec<_> = api_version.split('/').collect();
    match parts.as_slice() {
        [version] if !version.is_empty() => Ok((String::new(), (*version).to_string())),
        [group, version] if !group.is_empty() && !version.is_empty() => {
            Ok(((*group).to_string(), (*version).to_string()))
        }
        _ => Err(CoreError::InvalidApiVersion(api_version.to_string())),
    }
}

fn join_api_version(group: &str, version: &str) -> String {
    if group.is_empty() { version.to_string() } else { format!("{}/{}", group, version) }
}

// `v1/Kind` or `group/v1/Kind`
fn split_key(key: &str) -> Option<(String, String, String)> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, last] if !version.is_empty() && !last.is_empty() => {
            Some((String::new(), (*version).to_string(), (*last).to_string()))
        }
        [group, version, last] if !group.is_empty() && !version.is_empty() && !last.is_empty() => {
            Some(((*group).to_string(), (*version).to_string(), (*last).to_string()))
        }
        _ => None,
    }
}

/// Schema identifier of a strongly-typed object: group, version and kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Build from an object's `apiVersion` and `kind` fields.
    pub fn from_api_version(api_version: &str, kind: &str) -> Result<Self, CoreError> {
        let (group, version) = split_api_version(api_version)?;
        Ok(Self { group, version, kind: kind.to_string() })
    }

    pub fn api_version(&self) -> String { join_api_version(&self.group, &self.version) }

    /// Key form used in logs and on the command line: `v1/Pod`, `apps/v1/Deployment`.
    pub fn key(&self) -> String { format!("{}/{}", self.api_version(), self.kind) }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.key()) }
}

impl FromStr for Gvk {
    type Err = CoreError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let (group, version, kind) = split_key(key).ok_or_else(|| CoreError::InvalidGvkKey(key.to_string()))?;
        Ok(Self { group, version, kind })
    }
}

/// Collection endpoint identifier: group, version and plural resource name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvr {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl Gvr {
    pub fn new(group: impl Into<String>, version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), resource: resource.into() }
    }

    pub fn api_version(&self) -> String { join_api_version(&self.group, &self.version) }
}

impl fmt::Display for Gvr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.resource)
    }
}

impl FromStr for Gvr {
    type Err = CoreError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let (group, version, resource) = split_key(key).ok_or_else(|| CoreError::InvalidGvrKey(key.to_string()))?;
        Ok(Self { group, version, resource })
    }
}

/// A served resource kind as reported by discovery (incl. CRDs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResourceInfo {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural resource name, e.g. `deployments`.
    pub plural: String,
    pub namespaced: bool,
    pub verbs: SmallVec<[String; 8]>,
}

impl ApiResourceInfo {
    pub fn supports(&self, verb: &str) -> bool { self.verbs.iter().any(|v| v == verb) }

    /// Both `get` and `list` are served; the catalog only keeps these.
    pub fn is_listable(&self) -> bool { self.supports("get") && self.supports("list") }

    pub fn api_version(&self) -> String { join_api_version(&self.group, &self.version) }

    pub fn gvk(&self) -> Gvk { Gvk::new(self.group.clone(), self.version.clone(), self.kind.clone()) }

    pub fn gvr(&self) -> Gvr { Gvr::new(self.group.clone(), self.version.clone(), self.plural.clone()) }
}

/// Reference to a single object, as found in `involvedObject`/`ownerReferences` style fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    pub fn gvk(&self) -> Result<Gvk, CoreError> { Gvk::from_api_version(&self.api_version, &self.kind) }
}

pub mod prelude {
    pub use super::{ApiResourceInfo, CoreError, Gvk, Gvr, ObjectRef};
}
