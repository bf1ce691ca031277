//! kube-rs backed collaborators: Application / ApplicationSet stores, the
//! cluster secret watcher, the duck-typed decision reader, the libgit2
//! directory lister and generic list+watch wiring.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use appset_core::{DeltaKind, Error, ObjectEvent, ObjectKey, API_GROUP, APPLICATIONSET_KIND, APPLICATION_KIND};

mod apps;
mod clusters;
mod decisions;
mod git;

pub use apps::{KubeAppSetStore, KubeApplicationStore};
pub use clusters::{parse_cluster_secret, watch_cluster_secrets};
pub use decisions::KubeDecisionReader;
pub use git::GitRepoService;

pub async fn client() -> Result<Client> {
    Client::try_default().await.context("building kube client from the default config")
}

pub fn application_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(API_GROUP, "v1alpha1", APPLICATION_KIND))
}

pub fn applicationset_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(API_GROUP, "v1alpha1", APPLICATIONSET_KIND))
}

/// `group/version/Kind` or `version/Kind` for the core group.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Split an `apiVersion` (`group/version` or `version`) and pair it with `kind`.
pub fn gvk_from_api_version(api_version: &str, kind: &str) -> GroupVersionKind {
    match api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, kind),
        None => GroupVersionKind::gvk("", api_version, kind),
    }
}

/// Resolve a GVK against the served resources (CRDs included).
pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Map a kube error at the trait boundary: 409 is a write conflict, 404 a
/// missing object, anything else an unavailable source.
pub(crate) fn map_kube_err(source: &str, key: &str, e: kube::Error) -> Error {
    match &e {
        kube::Error::Api(resp) if resp.code == 409 => Error::ReconcileConflict(key.to_string()),
        kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(key.to_string()),
        _ => Error::source_unavailable(source, e),
    }
}

pub(crate) fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

fn event_from(obj: &DynamicObject, kind: DeltaKind) -> Result<ObjectEvent> {
    let name = obj.metadata.name.clone().ok_or_else(|| anyhow!("object missing metadata.name"))?;
    let namespace = obj.metadata.namespace.clone().unwrap_or_default();
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Ok(ObjectEvent { kind, key: ObjectKey::new(namespace, name), raw })
}

/// List+watch `ar` (all namespaces when `namespace` is `None`) and forward
/// every change as an [`ObjectEvent`]. Returns when the stream or the
/// receiver ends.
pub async fn start_watcher(client: Client, ar: &ApiResource, namespace: Option<&str>, tx: mpsc::Sender<ObjectEvent>) -> Result<()> {
    let api: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(client, ns, ar),
        None => Api::all_with(client, ar),
    };
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(kind = %ar.kind, ns = ?namespace, "watcher started");
    while let Some(ev) = stream.try_next().await? {
        let batch = match ev {
            Event::Applied(o) => vec![event_from(&o, DeltaKind::Applied)?],
            Event::Deleted(o) => vec![event_from(&o, DeltaKind::Deleted)?],
            Event::Restarted(list) => {
                debug!(kind = %ar.kind, count = list.len(), "watch restart");
                list.iter().map(|o| event_from(o, DeltaKind::Applied)).collect::<Result<Vec<_>>>()?
            }
        };
        for e in batch {
            if tx.send(e).await.is_err() {
                debug!(kind = %ar.kind, "watch receiver dropped");
                return Ok(());
            }
        }
    }
    warn!(kind = %ar.kind, "watcher stream ended");
    Ok(())
}

/// Like [`start_watcher`] for a GVK that must be discovered first
/// (duck-typed decision resources).
pub async fn start_discovered_watcher(client: Client, gvk_key: &str, namespace: Option<&str>, tx: mpsc::Sender<ObjectEvent>) -> Result<()> {
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
    let ns = if namespaced { namespace } else { None };
    start_watcher(client, &ar, ns, tx).await
}
