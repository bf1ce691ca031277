use std::collections::{BTreeMap, HashMap};

use appset_core::{Application, ApplicationSet, ObjectKey};
use tracing::warn;

/// Annotations other actors set on Applications that updates always keep.
pub const DEFAULT_PRESERVED_ANNOTATIONS: &[&str] = &["argocd.argoproj.io/refresh", "notified.notifications.argoproj.io"];

#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    /// Rendered from the template.
    pub desired: Application,
    /// Live object with the templated fields replaced; what gets written.
    pub merged: Application,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub create: Vec<Application>,
    pub update: Vec<Update>,
    pub delete: Vec<ObjectKey>,
    pub unchanged: usize,
    /// Desired names already taken by an Application this set does not own.
    pub foreign: Vec<ObjectKey>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "create={} update={} delete={} unchanged={} foreign={}",
            self.create.len(),
            self.update.len(),
            self.delete.len(),
            self.unchanged,
            self.foreign.len()
        )
    }
}

/// Diff `desired` against `actual` for `owner`. The owner's sync policy
/// gates updates and deletes; unowned Applications are never deleted.
pub fn plan(desired: Vec<Application>, actual: Vec<Application>, owner: &ApplicationSet) -> Plan {
    let policy = owner.sync_policy();
    let mut live: HashMap<ObjectKey, Application> = actual.into_iter().map(|a| (a.key(), a)).collect();
    let mut out = Plan::default();

    for want in desired {
        let key = want.key();
        match live.remove(&key) {
            None => out.create.push(want),
            Some(cur) => {
                if cur.appset_owner().is_some() && !cur.is_owned_by(owner) {
                    warn!(app = %key, appset = %owner.key(), "reconcile: application owned by another applicationset");
                    out.foreign.push(key);
                    continue;
                }
                let merged = merge_templated(&cur, &want, owner);
                if same_object(&merged, &cur) {
                    out.unchanged += 1;
                } else if policy.allows_update() {
                    out.update.push(Update { desired: want, merged });
                } else {
                    out.unchanged += 1;
                }
            }
        }
    }

    if policy.allows_delete() {
        let mut orphans: Vec<ObjectKey> = live.into_values().filter(|a| a.is_owned_by(owner)).map(|a| a.key()).collect();
        orphans.sort();
        out.delete = orphans;
    }
    out
}

/// Apply the templated fields of `desired` onto `live`, keeping what other
/// controllers own: status, operation, uid, resourceVersion, foreign owner
/// references, extra finalizers, preserved labels/annotations and spec
/// fields the template does not set.
pub fn merge_templated(live: &Application, desired: &Application, owner: &ApplicationSet) -> Application {
    let mut out = live.clone();
    out.spec = desired.spec.clone();
    for (k, v) in &live.spec.extra {
        out.spec.extra.entry(k.clone()).or_insert_with(|| v.clone());
    }

    let preserved = owner.spec.preserved_fields.clone().unwrap_or_default();
    let mut keep_annotations: Vec<&str> = DEFAULT_PRESERVED_ANNOTATIONS.to_vec();
    keep_annotations.extend(preserved.annotations.iter().map(String::as_str));
    let keep_labels: Vec<&str> = preserved.labels.iter().map(String::as_str).collect();

    out.metadata.labels = carry(desired.metadata.labels.as_ref(), live.metadata.labels.as_ref(), &keep_labels);
    out.metadata.annotations = carry(desired.metadata.annotations.as_ref(), live.metadata.annotations.as_ref(), &keep_annotations);

    let mut finalizers = desired.metadata.finalizers.clone().unwrap_or_default();
    for f in live.metadata.finalizers.iter().flatten() {
        if !finalizers.contains(f) {
            finalizers.push(f.clone());
        }
    }
    out.metadata.finalizers = (!finalizers.is_empty()).then_some(finalizers);

    let ours = owner.owner_reference();
    let mut refs: Vec<_> = live
        .metadata
        .owner_references
        .iter()
        .flatten()
        .filter(|r| !(r.kind == ours.kind && r.name == ours.name))
        .cloned()
        .collect();
    refs.push(ours);
    out.metadata.owner_references = Some(refs);
    out
}

fn carry(
    desired: Option<&BTreeMap<String, String>>,
    live: Option<&BTreeMap<String, String>>,
    keep: &[&str],
) -> Option<BTreeMap<String, String>> {
    let mut out = desired.cloned().unwrap_or_default();
    if let Some(live) = live {
        for k in keep {
            if let Some(v) = live.get(*k) {
                out.entry((*k).to_string()).or_insert_with(|| v.clone());
            }
        }
    }
    (!out.is_empty()).then_some(out)
}

fn same_object(a: &Application, b: &Application) -> bool {
    normalize(a) == normalize(b)
}

fn normalize(app: &Application) -> Application {
    let mut app = app.clone();
    let m = &mut app.metadata;
    if m.labels.as_ref().is_some_and(BTreeMap::is_empty) {
        m.labels = None;
    }
    if m.annotations.as_ref().is_some_and(BTreeMap::is_empty) {
        m.annotations = None;
    }
    if m.finalizers.as_ref().is_some_and(Vec::is_empty) {
        m.finalizers = None;
    }
    app
}
