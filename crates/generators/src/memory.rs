//! In-memory collaborators for tests and offline rendering.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use appset_core::{Error, Result};
use serde_json::Value as Json;

use crate::{selector, DecisionReader, RepoService, ResourceQuery};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fixed directory listings keyed by `(repo_url, revision)`.
#[derive(Default)]
pub struct MemoryRepoService {
    repos: Mutex<BTreeMap<(String, String), Vec<String>>>,
    delay: Mutex<Option<Duration>>,
}

impl MemoryRepoService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, repo_url: &str, revision: &str, dirs: &[&str]) {
        lock(&self.repos).insert((repo_url.to_string(), revision.to_string()), dirs.iter().map(|s| s.to_string()).collect());
    }

    pub fn remove(&self, repo_url: &str, revision: &str) {
        lock(&self.repos).remove(&(repo_url.to_string(), revision.to_string()));
    }

    /// Every listing sleeps this long first.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }
}

#[async_trait::async_trait]
impl RepoService for MemoryRepoService {
    async fn list_directories(&self, repo_url: &str, revision: &str) -> Result<Vec<String>> {
        let delay = *lock(&self.delay);
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        lock(&self.repos)
            .get(&(repo_url.to_string(), revision.to_string()))
            .cloned()
            .ok_or_else(|| Error::source_unavailable("git", format!("repository {repo_url}@{revision} not reachable")))
    }
}

/// Config maps plus raw resources served to the decision generator.
#[derive(Default)]
pub struct MemoryDecisionReader {
    config_maps: Mutex<BTreeMap<(String, String), BTreeMap<String, String>>>,
    resources: Mutex<Vec<Json>>,
}

impl MemoryDecisionReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_config_map(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        let data = data.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        lock(&self.config_maps).insert((namespace.to_string(), name.to_string()), data);
    }

    /// Insert or replace a resource by apiVersion/kind/namespace/name.
    pub fn put_resource(&self, obj: Json) {
        let mut resources = lock(&self.resources);
        let id = identity(&obj);
        resources.retain(|o| identity(o) != id);
        resources.push(obj);
    }

    /// Replace `status.<key>` on an existing resource.
    pub fn set_status_list(&self, namespace: &str, name: &str, key: &str, entries: Json) -> bool {
        let mut resources = lock(&self.resources);
        for obj in resources.iter_mut() {
            if meta_str(obj, "namespace") == Some(namespace) && meta_str(obj, "name") == Some(name) {
                obj["status"][key] = entries;
                return true;
            }
        }
        false
    }
}

fn meta_str<'a>(obj: &'a Json, field: &str) -> Option<&'a str> {
    obj.get("metadata").and_then(|m| m.get(field)).and_then(Json::as_str)
}

fn identity(obj: &Json) -> (String, String, String, String) {
    let s = |v: Option<&str>| v.unwrap_or_default().to_string();
    (
        s(obj.get("apiVersion").and_then(Json::as_str)),
        s(obj.get("kind").and_then(Json::as_str)),
        s(meta_str(obj, "namespace")),
        s(meta_str(obj, "name")),
    )
}

fn labels_of(obj: &Json) -> BTreeMap<String, String> {
    obj.get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(Json::as_object)
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string()))).collect())
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl DecisionReader for MemoryDecisionReader {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>> {
        lock(&self.config_maps)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::source_unavailable("configmap", format!("{namespace}/{name} not found")))
    }

    async fn list_resources(&self, query: &ResourceQuery) -> Result<Vec<Json>> {
        let resources = lock(&self.resources).clone();
        let mut out = Vec::new();
        for obj in resources {
            let (api_version, kind, ns, name) = identity(&obj);
            if api_version != query.api_version || kind != query.kind || ns != query.namespace {
                continue;
            }
            if query.name.as_deref().is_some_and(|n| n != name) {
                continue;
            }
            if let Some(sel) = &query.label_selector {
                if !selector::matches(sel, &labels_of(&obj))? {
                    continue;
                }
            }
            out.push(obj);
        }
        Ok(out)
    }
}
