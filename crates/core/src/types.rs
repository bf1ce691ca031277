//! ApplicationSet / Application data model.
//!
//! Field names follow the `argoproj.io/v1alpha1` wire format so objects can
//! be read straight from YAML or from the API server.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{ObjectKey, API_VERSION, APPLICATIONSET_KIND};

// ---- generator tree ----

/// One generator plus the optional selector filtering its output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGeneratorNode", into = "RawGeneratorNode")]
pub struct GeneratorNode {
    pub spec: GeneratorSpec,
    pub selector: Option<LabelSelector>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorSpec {
    List(ListGenerator),
    Git(GitGenerator),
    Clusters(ClusterGenerator),
    ClusterDecisionResource(DuckTypeGenerator),
    Matrix(MatrixGenerator),
    Merge(MergeGenerator),
}

impl GeneratorSpec {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::List(_) => "list",
            Self::Git(_) => "git",
            Self::Clusters(_) => "clusters",
            Self::ClusterDecisionResource(_) => "clusterDecisionResource",
            Self::Matrix(_) => "matrix",
            Self::Merge(_) => "merge",
        }
    }

    pub fn children(&self) -> &[GeneratorNode] {
        match self {
            Self::Matrix(m) => &m.generators,
            Self::Merge(m) => &m.generators,
            _ => &[],
        }
    }

    /// Nesting depth; a terminal generator has depth 1.
    pub fn depth(&self) -> usize {
        1 + self.children().iter().map(|c| c.spec.depth()).max().unwrap_or(0)
    }

    /// True when this tree reads a duck-typed decision resource anywhere.
    pub fn uses_decision_resource(&self) -> bool {
        matches!(self, Self::ClusterDecisionResource(_)) || self.children().iter().any(|c| c.spec.uses_decision_resource())
    }

    /// True when this tree reads the cluster registry anywhere.
    pub fn uses_clusters(&self) -> bool {
        matches!(self, Self::Clusters(_) | Self::ClusterDecisionResource(_))
            || self.children().iter().any(|c| c.spec.uses_clusters())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListGenerator {
    #[serde(default)]
    pub elements: Vec<Json>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitGenerator {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default = "default_revision")]
    pub revision: String,
    #[serde(default)]
    pub directories: Vec<GitDirectoryItem>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeue_after_seconds: Option<u64>,
}

fn default_revision() -> String {
    "HEAD".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitDirectoryItem {
    pub path: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exclude: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGenerator {
    #[serde(default)]
    pub selector: LabelSelector,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, String>,
}

/// Duck-typed decision resource located through a config map schema.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuckTypeGenerator {
    pub config_map_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeue_after_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MatrixGenerator {
    pub generators: Vec<GeneratorNode>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeGenerator {
    pub merge_keys: Vec<String>,
    pub generators: Vec<GeneratorNode>,
}

/// Wire shape of a generator: exactly one kind field set, plus a selector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGeneratorNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    list: Option<ListGenerator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    git: Option<GitGenerator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    clusters: Option<ClusterGenerator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cluster_decision_resource: Option<DuckTypeGenerator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    matrix: Option<MatrixGenerator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    merge: Option<MergeGenerator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    selector: Option<LabelSelector>,
}

impl TryFrom<RawGeneratorNode> for GeneratorNode {
    type Error = String;

    fn try_from(raw: RawGeneratorNode) -> Result<Self, Self::Error> {
        let mut kinds: Vec<GeneratorSpec> = Vec::new();
        if let Some(g) = raw.list {
            kinds.push(GeneratorSpec::List(g));
        }
        if let Some(g) = raw.git {
            kinds.push(GeneratorSpec::Git(g));
        }
        if let Some(g) = raw.clusters {
            kinds.push(GeneratorSpec::Clusters(g));
        }
        if let Some(g) = raw.cluster_decision_resource {
            kinds.push(GeneratorSpec::ClusterDecisionResource(g));
        }
        if let Some(g) = raw.matrix {
            kinds.push(GeneratorSpec::Matrix(g));
        }
        if let Some(g) = raw.merge {
            kinds.push(GeneratorSpec::Merge(g));
        }
        match kinds.len() {
            1 => Ok(GeneratorNode { spec: kinds.remove(0), selector: raw.selector }),
            0 => Err("generator declares no kind (list, git, clusters, clusterDecisionResource, matrix, merge)".into()),
            n => Err(format!("generator declares {n} kinds; exactly one is allowed")),
        }
    }
}

impl From<GeneratorNode> for RawGeneratorNode {
    fn from(node: GeneratorNode) -> Self {
        let mut raw = RawGeneratorNode { selector: node.selector, ..Default::default() };
        match node.spec {
            GeneratorSpec::List(g) => raw.list = Some(g),
            GeneratorSpec::Git(g) => raw.git = Some(g),
            GeneratorSpec::Clusters(g) => raw.clusters = Some(g),
            GeneratorSpec::ClusterDecisionResource(g) => raw.cluster_decision_resource = Some(g),
            GeneratorSpec::Matrix(g) => raw.matrix = Some(g),
            GeneratorSpec::Merge(g) => raw.merge = Some(g),
        }
        raw
    }
}

// ---- application ----

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSource {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApplicationDestination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    #[serde(default)]
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ApplicationSource>,
    #[serde(default)]
    pub destination: ApplicationDestination,
    /// Passed through to the sync engine untouched (after placeholder substitution).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<Json>,
    /// Fields not modelled above (`sources`, `ignoreDifferences`, `info`, ...),
    /// kept verbatim so replaces do not drop them.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Json>,
}

/// A managed child resource. `status` and `operation` belong to the sync
/// engine and are never produced by templates.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Application {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ApplicationSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Json>,
}

impl Application {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("")
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace(), self.name())
    }

    /// ApplicationSet owner reference, if any.
    pub fn appset_owner(&self) -> Option<&OwnerReference> {
        self.metadata
            .owner_references
            .as_ref()
            .and_then(|refs| refs.iter().find(|r| r.kind == APPLICATIONSET_KIND && r.api_version.starts_with(crate::API_GROUP)))
    }

    /// Owned by `appset`: uid match when both sides carry one, else name match.
    pub fn is_owned_by(&self, appset: &ApplicationSet) -> bool {
        match self.appset_owner() {
            Some(r) => match appset.metadata.uid.as_deref() {
                Some(uid) if !uid.is_empty() && !r.uid.is_empty() => r.uid == uid,
                _ => r.name == appset.name(),
            },
            None => false,
        }
    }
}

// ---- application set ----

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalizers: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApplicationTemplate {
    #[serde(default)]
    pub metadata: TemplateMeta,
    #[serde(default)]
    pub spec: ApplicationSpec,
}

/// Which mutation classes the reconciler may perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplicationsSyncPolicy {
    CreateOnly,
    CreateUpdate,
    CreateDelete,
    #[default]
    Sync,
}

impl ApplicationsSyncPolicy {
    pub fn allows_update(self) -> bool {
        matches!(self, Self::CreateUpdate | Self::Sync)
    }

    pub fn allows_delete(self) -> bool {
        matches!(self, Self::CreateDelete | Self::Sync)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSetSyncPolicy {
    #[serde(default)]
    pub preserve_resources_on_deletion: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applications_sync: Option<ApplicationsSyncPolicy>,
}

/// Application metadata keys that other actors set and updates must keep.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PreservedFields {
    #[serde(default)]
    pub annotations: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetSpec {
    #[serde(default)]
    pub generators: Vec<GeneratorNode>,
    #[serde(default)]
    pub template: ApplicationTemplate,
    #[serde(default)]
    pub apply_nested_selectors: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<AppSetSyncPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserved_fields: Option<PreservedFields>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    ErrorOccurred,
    ParametersGenerated,
    ResourcesUpToDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub message: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn new(type_: ConditionType, status: ConditionStatus, reason: &str, message: impl Into<String>) -> Self {
        Self { type_, status, message: message.into(), reason: reason.to_string(), last_transition_time: None }
    }
}

/// Replace conditions by type. The transition time only moves when the
/// status flips.
pub fn merge_conditions(current: &[Condition], updates: Vec<Condition>, now: &str) -> Vec<Condition> {
    let mut out: Vec<Condition> = current.to_vec();
    for mut c in updates {
        match out.iter_mut().find(|x| x.type_ == c.type_) {
            Some(existing) => {
                c.last_transition_time = if existing.status == c.status {
                    existing.last_transition_time.clone()
                } else {
                    Some(now.to_string())
                };
                *existing = c;
            }
            None => {
                c.last_transition_time = Some(now.to_string());
                out.push(c);
            }
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApplicationSetStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApplicationSet {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ApplicationSetSpec,
    #[serde(default)]
    pub status: ApplicationSetStatus,
}

impl ApplicationSet {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("")
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace(), self.name())
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn sync_policy(&self) -> ApplicationsSyncPolicy {
        self.spec.sync_policy.as_ref().and_then(|p| p.applications_sync).unwrap_or_default()
    }

    pub fn preserves_resources_on_deletion(&self) -> bool {
        self.spec.sync_policy.as_ref().map(|p| p.preserve_resources_on_deletion).unwrap_or(false)
    }

    /// Controller owner reference placed on every generated Application.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: API_VERSION.to_string(),
            kind: APPLICATIONSET_KIND.to_string(),
            name: self.name().to_string(),
            uid: self.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    pub fn uses_decision_resource(&self) -> bool {
        self.spec.generators.iter().any(|g| g.spec.uses_decision_resource())
    }

    pub fn uses_clusters(&self) -> bool {
        self.spec.generators.iter().any(|g| g.spec.uses_clusters())
    }
}
