//! Cluster registration secrets → cluster registry deltas.

use std::collections::HashSet;

use anyhow::Result;
use appset_core::{ClusterInfo, DeltaKind, SECRET_TYPE_CLUSTER, SECRET_TYPE_LABEL};
use appset_store::ClusterDelta;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    Client, ResourceExt,
};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

fn secret_field(secret: &Secret, key: &str) -> Option<String> {
    if let Some(v) = secret.string_data.as_ref().and_then(|d| d.get(key)) {
        return Some(v.clone());
    }
    let bytes = secret.data.as_ref()?.get(key)?;
    String::from_utf8(bytes.0.clone()).ok()
}

/// Cluster described by a registration secret; `None` when `name` or
/// `server` is missing.
pub fn parse_cluster_secret(secret: &Secret) -> Option<ClusterInfo> {
    let name = secret_field(secret, "name").filter(|s| !s.is_empty())?;
    let server = secret_field(secret, "server").filter(|s| !s.is_empty())?;
    Some(ClusterInfo {
        name,
        server,
        labels: secret.labels().clone(),
        annotations: secret.annotations().clone(),
    })
}

fn secret_key(secret: &Secret) -> String {
    format!("{}/{}", secret.namespace().unwrap_or_default(), secret.name_any())
}

fn applied(secret: &Secret) -> ClusterDelta {
    let cluster = parse_cluster_secret(secret);
    if cluster.is_none() {
        warn!(secret = %secret_key(secret), "clusters: secret lacks name/server; ignored");
    }
    ClusterDelta { kind: DeltaKind::Applied, secret: secret_key(secret), cluster }
}

/// Watch cluster secrets in `namespace` and forward deltas. A watch restart
/// also emits deletions for secrets that disappeared meanwhile.
pub async fn watch_cluster_secrets(client: Client, namespace: &str, tx: mpsc::Sender<ClusterDelta>) -> Result<()> {
    let api: Api<Secret> = Api::namespaced(client, namespace);
    let cfg = watcher::Config::default().labels(&format!("{SECRET_TYPE_LABEL}={SECRET_TYPE_CLUSTER}"));
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!(ns = %namespace, "clusters: secret watcher started");
    let mut known: HashSet<String> = HashSet::new();
    while let Some(ev) = stream.try_next().await? {
        let deltas = match ev {
            Event::Applied(s) => {
                known.insert(secret_key(&s));
                vec![applied(&s)]
            }
            Event::Deleted(s) => {
                known.remove(&secret_key(&s));
                vec![ClusterDelta { kind: DeltaKind::Deleted, secret: secret_key(&s), cluster: None }]
            }
            Event::Restarted(list) => {
                debug!(count = list.len(), "clusters: watch restart");
                let fresh: HashSet<String> = list.iter().map(secret_key).collect();
                let mut out: Vec<ClusterDelta> = known
                    .difference(&fresh)
                    .map(|gone| ClusterDelta { kind: DeltaKind::Deleted, secret: gone.clone(), cluster: None })
                    .collect();
                out.extend(list.iter().map(applied));
                known = fresh;
                out
            }
        };
        counter!("appset_cluster_secret_events_total", deltas.len() as u64);
        for d in deltas {
            if tx.send(d).await.is_err() {
                return Ok(());
            }
        }
    }
    warn!("clusters: secret watcher stream ended");
    Ok(())
}
