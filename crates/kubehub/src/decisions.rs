use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use appset_core::{Error, Result};
use appset_generators::{selector, DecisionReader, ResourceQuery};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use tracing::debug;

use crate::{find_api_resource, gvk_from_api_version, map_kube_err, strip_managed_fields};

/// Config maps via the core API; decision resources via discovery and the
/// dynamic API. Resolved resources are cached per apiVersion/kind.
pub struct KubeDecisionReader {
    client: Client,
    resolved: Mutex<HashMap<(String, String), ApiResource>>,
}

impl KubeDecisionReader {
    pub fn new(client: Client) -> Self {
        Self { client, resolved: Mutex::new(HashMap::new()) }
    }

    async fn resource(&self, api_version: &str, kind: &str) -> Result<ApiResource> {
        let cache_key = (api_version.to_string(), kind.to_string());
        if let Some(ar) = self.resolved.lock().ok().and_then(|m| m.get(&cache_key).cloned()) {
            return Ok(ar);
        }
        let gvk = gvk_from_api_version(api_version, kind);
        let (ar, _namespaced) = find_api_resource(self.client.clone(), &gvk)
            .await
            .map_err(|e| Error::source_unavailable("discovery", format!("{e:#}")))?;
        if let Ok(mut m) = self.resolved.lock() {
            m.insert(cache_key, ar.clone());
        }
        Ok(ar)
    }
}

#[async_trait::async_trait]
impl DecisionReader for KubeDecisionReader {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let key = format!("{namespace}/{name}");
        match api.get_opt(name).await.map_err(|e| map_kube_err("configmap", &key, e))? {
            Some(cm) => Ok(cm.data.unwrap_or_default()),
            None => Err(Error::source_unavailable("configmap", format!("{key} not found"))),
        }
    }

    async fn list_resources(&self, query: &ResourceQuery) -> Result<Vec<serde_json::Value>> {
        let ar = self.resource(&query.api_version, &query.kind).await?;
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), &query.namespace, &ar);
        let source = format!("{}/{}", query.api_version, query.kind);
        let objects = match (&query.name, &query.label_selector) {
            (Some(name), _) => api.get_opt(name).await.map_err(|e| map_kube_err(&source, name, e))?.into_iter().collect(),
            (None, Some(sel)) => {
                let lp = ListParams::default().labels(&selector::to_query(sel));
                api.list(&lp).await.map_err(|e| map_kube_err(&source, &query.namespace, e))?.items
            }
            (None, None) => Vec::new(),
        };
        debug!(kind = %query.kind, ns = %query.namespace, count = objects.len(), "decisions: resources read");
        let mut out = Vec::with_capacity(objects.len());
        for obj in objects {
            let mut raw = serde_json::to_value(obj).map_err(|e| Error::Internal(format!("encode {source}: {e}")))?;
            strip_managed_fields(&mut raw);
            out.push(raw);
        }
        Ok(out)
    }
}
