//! ApplicationSet core types: parameter sets, the generator tree, the
//! Application/ApplicationSet data model and the error taxonomy shared by
//! every other crate in the workspace.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

mod error;
mod params;
mod types;

pub use error::{Error, Result};
pub use params::{render_value, ParameterSet};
pub use types::*;

/// API group/version shared by Application and ApplicationSet.
pub const API_VERSION: &str = "argoproj.io/v1alpha1";
pub const API_GROUP: &str = "argoproj.io";
pub const APPLICATION_KIND: &str = "Application";
pub const APPLICATIONSET_KIND: &str = "ApplicationSet";

/// Finalizer placed on every generated Application so the sync engine can
/// clean up managed resources before the Application disappears.
pub const RESOURCES_FINALIZER: &str = "resources-finalizer.argocd.argoproj.io";

/// Label identifying cluster registration secrets.
pub const SECRET_TYPE_LABEL: &str = "argocd.argoproj.io/secret-type";
pub const SECRET_TYPE_CLUSTER: &str = "cluster";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// Namespace/name address of a namespaced object.
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
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Watch notification for an object the controller cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectEvent {
    pub kind: DeltaKind,
    pub key: ObjectKey,
    /// Raw object as served by the API
    pub raw: serde_json::Value,
}

/// A registered destination cluster as seen through its secret.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ClusterInfo {
    pub name: String,
    pub server: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Read-only view of all registered clusters for one evaluation pass.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClusterSnapshot {
    pub epoch: u64,
    /// Sorted by cluster name.
    pub clusters: Vec<ClusterInfo>,
}

impl ClusterSnapshot {
    pub fn new(epoch: u64, mut clusters: Vec<ClusterInfo>) -> Self {
        clusters.sort_by(|a, b| a.name.cmp(&b.name).then(a.server.cmp(&b.server)));
        Self { epoch, clusters }
    }

    pub fn by_name(&self, name: &str) -> Option<&ClusterInfo> {
        self.clusters.iter().find(|c| c.name == name)
    }
}

pub mod prelude {
    pub use super::{
        Application, ApplicationSet, ClusterInfo, ClusterSnapshot, Condition, DeltaKind, Error,
        GeneratorNode, GeneratorSpec, ObjectEvent, ObjectKey, ParameterSet, Result,
    };
}

/// 64-bit FNV-1a, stable across runs and platforms.
pub fn stable_hash(input: &str) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in input.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}
