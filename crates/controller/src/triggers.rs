//! Watch events and cluster snapshot swaps turned into queue triggers.

use std::collections::HashMap;
use std::sync::Arc;

use appset_core::{stable_hash, DeltaKind, ObjectEvent, ObjectKey, APPLICATIONSET_KIND};
use serde_json::{json, Value as Json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::Controller;

/// What a stream of [`ObjectEvent`]s is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// The ApplicationSets themselves.
    ApplicationSet,
    /// Generated Applications; drift re-triggers the owning set.
    Application,
    /// Duck-typed decision resources; every set reading one is re-run.
    DecisionResource,
}

/// ApplicationSet owner reference of a raw Application as `(name, uid)`.
pub(crate) fn owner_ref(raw: &Json) -> Option<(&str, Option<&str>)> {
    let refs = raw.get("metadata")?.get("ownerReferences")?.as_array()?;
    let r = refs.iter().find(|r| r.get("kind").and_then(Json::as_str) == Some(APPLICATIONSET_KIND))?;
    let name = r.get("name")?.as_str()?;
    Some((name, r.get("uid").and_then(Json::as_str)))
}

/// Hash of the Application fields the controller writes. Status and
/// operation updates from the sync engine leave it unchanged.
fn templated_fingerprint(raw: &Json) -> u64 {
    let meta = raw.get("metadata");
    let field = |k: &str| meta.and_then(|m| m.get(k)).cloned().unwrap_or(Json::Null);
    let view = json!({
        "spec": raw.get("spec").cloned().unwrap_or(Json::Null),
        "labels": field("labels"),
        "annotations": field("annotations"),
        "finalizers": field("finalizers"),
        "ownerReferences": field("ownerReferences"),
    });
    stable_hash(&view.to_string())
}

/// Last templated fingerprint per Application; decides which events are
/// worth re-running the owner for.
#[derive(Default)]
pub(crate) struct AppChangeFilter {
    seen: HashMap<ObjectKey, u64>,
}

impl AppChangeFilter {
    /// True for deletions, first sightings and changes to templated fields.
    pub(crate) fn observe(&mut self, ev: &ObjectEvent) -> bool {
        match ev.kind {
            DeltaKind::Deleted => {
                self.seen.remove(&ev.key);
                true
            }
            DeltaKind::Applied => {
                let print = templated_fingerprint(&ev.raw);
                self.seen.insert(ev.key.clone(), print) != Some(print)
            }
        }
    }
}

/// Forward events from `rx` into the controller queue until the channel
/// closes. Bursts of decision resource events collapse into one trigger;
/// Application events only count when a templated field changed.
pub fn spawn_event_trigger(ctl: Arc<Controller>, source: TriggerSource, mut rx: mpsc::Receiver<ObjectEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut apps = AppChangeFilter::default();
        while let Some(ev) = rx.recv().await {
            match source {
                TriggerSource::ApplicationSet => ctl.trigger(ev.key),
                TriggerSource::Application => {
                    if !apps.observe(&ev) {
                        continue;
                    }
                    match owner_ref(&ev.raw) {
                        Some((name, uid)) => ctl.trigger(ctl.owner_of(&ev.key.namespace, name, uid)),
                        None if ev.kind == DeltaKind::Deleted => debug!(app = %ev.key, "triggers: unowned application deleted"),
                        None => {}
                    }
                }
                TriggerSource::DecisionResource => {
                    let mut burst = 1usize;
                    while rx.try_recv().is_ok() {
                        burst += 1;
                    }
                    match ctl.trigger_decision_users().await {
                        Ok(n) => debug!(events = burst, applicationsets = n, "triggers: decision resources changed"),
                        Err(e) => warn!(error = %e, "triggers: listing applicationsets failed"),
                    }
                }
            }
        }
        info!(source = ?source, "triggers: event stream closed");
    })
}

/// Re-run every ApplicationSet whenever the cluster registry publishes a
/// new snapshot.
pub fn spawn_cluster_trigger(ctl: Arc<Controller>) -> JoinHandle<()> {
    let mut rx = ctl.deps.clusters.subscribe_epoch();
    rx.borrow_and_update();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let epoch = *rx.borrow_and_update();
            match ctl.trigger_all().await {
                Ok(n) => debug!(epoch, applicationsets = n, "triggers: cluster snapshot changed"),
                Err(e) => warn!(epoch, error = %e, "triggers: listing applicationsets failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(raw: Json) -> ObjectEvent {
        ObjectEvent { kind: DeltaKind::Applied, key: ObjectKey::new("argocd", "guestbook"), raw }
    }

    #[test]
    fn owner_ref_reads_applicationset_reference() {
        let ev = event(json!({
            "metadata": {
                "name": "guestbook",
                "ownerReferences": [
                    { "apiVersion": "v1", "kind": "ConfigMap", "name": "other", "uid": "1" },
                    { "apiVersion": "argoproj.io/v1alpha1", "kind": "ApplicationSet", "name": "guestbook-set", "uid": "2" }
                ]
            }
        }));
        assert_eq!(owner_ref(&ev.raw), Some(("guestbook-set", Some("2"))));
        assert_eq!(owner_ref(&json!({ "metadata": { "name": "x" } })), None);
    }

    #[test]
    fn only_templated_changes_pass_the_filter() {
        let app = |status: &str, label: &str| {
            json!({
                "metadata": { "name": "guestbook", "labels": { "team": label }, "resourceVersion": status },
                "spec": { "project": "default" },
                "status": { "sync": { "status": status } }
            })
        };
        let mut filter = AppChangeFilter::default();
        assert!(filter.observe(&event(app("OutOfSync", "a"))));
        assert!(!filter.observe(&event(app("Synced", "a"))));
        assert!(!filter.observe(&event(app("Unknown", "a"))));
        assert!(filter.observe(&event(app("Unknown", "b"))));

        let mut gone = event(app("Unknown", "b"));
        gone.kind = DeltaKind::Deleted;
        assert!(filter.observe(&gone));
        assert!(filter.observe(&event(app("Unknown", "b"))));
    }
}
