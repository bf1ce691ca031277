use std::time::Instant;

use appset_core::{
    Application, ApplicationSet, Condition, Error, ObjectKey, Result, API_VERSION, APPLICATIONSET_KIND, APPLICATION_KIND,
};
use appset_reconcile::{ApplicationSetStore, ApplicationStore};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::DynamicObject,
    Client,
};
use metrics::histogram;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use crate::{application_resource, applicationset_resource, map_kube_err, strip_managed_fields};

fn from_dynamic<T: DeserializeOwned>(obj: DynamicObject) -> Result<T> {
    let mut raw = serde_json::to_value(obj).map_err(|e| Error::Internal(format!("encode object: {e}")))?;
    strip_managed_fields(&mut raw);
    serde_json::from_value(raw).map_err(|e| Error::Internal(format!("decode object: {e}")))
}

fn to_dynamic<T: Serialize>(obj: &T, kind: &str) -> Result<DynamicObject> {
    let mut raw = serde_json::to_value(obj).map_err(|e| Error::Internal(format!("encode object: {e}")))?;
    raw["apiVersion"] = serde_json::Value::String(API_VERSION.to_string());
    raw["kind"] = serde_json::Value::String(kind.to_string());
    serde_json::from_value(raw).map_err(|e| Error::Internal(format!("build dynamic object: {e}")))
}

/// Applications through the API server.
#[derive(Clone)]
pub struct KubeApplicationStore {
    client: Client,
}

impl KubeApplicationStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &application_resource())
    }
}

#[async_trait::async_trait]
impl ApplicationStore for KubeApplicationStore {
    async fn list_owned_candidates(&self, namespace: &str) -> Result<Vec<Application>> {
        let t0 = Instant::now();
        let list = self
            .api(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_err("kube", namespace, e))?;
        let apps = list.items.into_iter().map(from_dynamic::<Application>).collect::<Result<Vec<_>>>()?;
        histogram!("appset_kube_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(ns = %namespace, count = apps.len(), took_ms = %t0.elapsed().as_millis(), "kube: listed applications");
        Ok(apps)
    }

    async fn list_all(&self) -> Result<Vec<Application>> {
        let t0 = Instant::now();
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &application_resource());
        let list = api.list(&ListParams::default()).await.map_err(|e| map_kube_err("kube", APPLICATION_KIND, e))?;
        let apps = list.items.into_iter().map(from_dynamic::<Application>).collect::<Result<Vec<_>>>()?;
        histogram!("appset_kube_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(count = apps.len(), took_ms = %t0.elapsed().as_millis(), "kube: listed applications in all namespaces");
        Ok(apps)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Application>> {
        let key = ObjectKey::new(namespace, name).to_string();
        match self.api(namespace).get_opt(name).await.map_err(|e| map_kube_err("kube", &key, e))? {
            Some(obj) => from_dynamic(obj).map(Some),
            None => Ok(None),
        }
    }

    async fn create(&self, app: &Application) -> Result<Application> {
        let key = app.key().to_string();
        let obj = to_dynamic(app, APPLICATION_KIND)?;
        let created = self
            .api(app.namespace())
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_kube_err("kube", &key, e))?;
        info!(app = %key, "kube: application created");
        from_dynamic(created)
    }

    async fn update(&self, app: &Application) -> Result<Application> {
        let key = app.key().to_string();
        let obj = to_dynamic(app, APPLICATION_KIND)?;
        let updated = self
            .api(app.namespace())
            .replace(app.name(), &PostParams::default(), &obj)
            .await
            .map_err(|e| map_kube_err("kube", &key, e))?;
        info!(app = %key, "kube: application updated");
        from_dynamic(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let key = ObjectKey::new(namespace, name).to_string();
        self.api(namespace)
            .delete(name, &DeleteParams::foreground())
            .await
            .map_err(|e| map_kube_err("kube", &key, e))?;
        info!(app = %key, "kube: application delete requested");
        Ok(())
    }
}

/// ApplicationSets through the API server; conditions go to `/status`.
#[derive(Clone)]
pub struct KubeAppSetStore {
    client: Client,
    /// Watched namespaces; empty means all.
    namespaces: Vec<String>,
}

impl KubeAppSetStore {
    pub fn new(client: Client, namespaces: Vec<String>) -> Self {
        Self { client, namespaces }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &applicationset_resource())
    }
}

#[async_trait::async_trait]
impl ApplicationSetStore for KubeAppSetStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ApplicationSet>> {
        match self.api(&key.namespace).get_opt(&key.name).await.map_err(|e| map_kube_err("kube", &key.to_string(), e))? {
            Some(obj) => from_dynamic(obj).map(Some),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<ApplicationSet>> {
        let lp = ListParams::default();
        let mut items = Vec::new();
        if self.namespaces.is_empty() {
            let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &applicationset_resource());
            items.extend(api.list(&lp).await.map_err(|e| map_kube_err("kube", APPLICATIONSET_KIND, e))?.items);
        } else {
            for ns in &self.namespaces {
                items.extend(self.api(ns).list(&lp).await.map_err(|e| map_kube_err("kube", ns, e))?.items);
            }
        }
        items.into_iter().map(from_dynamic::<ApplicationSet>).collect()
    }

    async fn write_conditions(&self, key: &ObjectKey, conditions: &[Condition]) -> Result<()> {
        let patch = serde_json::json!({ "status": { "conditions": conditions } });
        self.api(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_err("kube", &key.to_string(), e))?;
        debug!(appset = %key, count = conditions.len(), "kube: status conditions written");
        Ok(())
    }
}
