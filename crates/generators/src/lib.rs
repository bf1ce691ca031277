//! ApplicationSet generators: terminal sources (list, git, clusters,
//! duck-typed decision resources), the selector filter, matrix/merge
//! combinators and the recursive tree evaluator.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use appset_core::{ClusterSnapshot, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::{Deserialize, Serialize};

pub mod cluster;
pub mod duck;
pub mod evaluate;
pub mod git;
pub mod list;
pub mod matrix;
pub mod memory;
pub mod merge;
pub mod selector;

pub use duck::{DecisionSchema, DecisionSource, StatusListSource};
pub use evaluate::{evaluate, validate, Evaluation};

/// Requeue interval for generators that poll (git, decision resources)
/// when the generator sets no `requeueAfterSeconds`.
pub const DEFAULT_POLL_REQUEUE: Duration = Duration::from_secs(180);

/// Lists directories of a repository at a revision.
#[async_trait::async_trait]
pub trait RepoService: Send + Sync {
    /// Every directory path (relative, `/`-separated) reachable at `revision`.
    async fn list_directories(&self, repo_url: &str, revision: &str) -> Result<Vec<String>>;
}

/// Locates a duck-typed decision resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceQuery {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: Option<String>,
    pub label_selector: Option<LabelSelector>,
}

/// Reads config maps and arbitrary namespaced resources for duck typing.
#[async_trait::async_trait]
pub trait DecisionReader: Send + Sync {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>>;

    /// Raw objects (`apiVersion`, `metadata`, `status`, ..) matching `query`.
    async fn list_resources(&self, query: &ResourceQuery) -> Result<Vec<serde_json::Value>>;
}

/// Everything a single evaluation pass reads from the outside world.
#[derive(Clone)]
pub struct GeneratorContext {
    /// Namespace of the ApplicationSet being evaluated.
    pub namespace: String,
    pub clusters: Arc<ClusterSnapshot>,
    pub repos: Arc<dyn RepoService>,
    pub decisions: Arc<dyn DecisionReader>,
}

#[derive(Debug, Clone)]
pub struct EvalOptions {
    pub generator_timeout: Duration,
    pub max_depth: usize,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self { generator_timeout: Duration::from_secs(60), max_depth: 8 }
    }
}

/// DNS-1123 friendly form of a name: lowercase, characters outside
/// `[a-z0-9-.]` replaced by `-`, leading/trailing `-`/`.` trimmed.
pub fn normalize_name(name: &str) -> String {
    let mapped: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.' { c } else { '-' })
        .collect();
    let trimmed = mapped.trim_matches(|c| c == '-' || c == '.');
    trimmed.chars().take(253).collect()
}

/// `values` map attached by a generator, stored as a nested object so that
/// `{{values.key}}` resolves the same way for every generator kind.
pub(crate) fn values_object(values: &BTreeMap<String, String>) -> serde_json::Value {
    serde_json::Value::Object(values.iter().map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone()))).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_replaces_and_trims() {
        assert_eq!(normalize_name("Helm_Guestbook"), "helm-guestbook");
        assert_eq!(normalize_name("-in.cluster-"), "in.cluster");
        assert_eq!(normalize_name("kustomize-guestbook"), "kustomize-guestbook");
    }
}
