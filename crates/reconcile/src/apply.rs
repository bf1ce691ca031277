use std::time::Instant;

use appset_core::{Application, ApplicationSet, Error, ObjectKey, Result};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::plan::{merge_templated, Plan, Update};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::ApplicationStore;

/// What [`apply`] actually changed, plus the writes that failed for good.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub created: Vec<ObjectKey>,
    pub updated: Vec<ObjectKey>,
    pub deleted: Vec<ObjectKey>,
    pub errors: Vec<(ObjectKey, Error)>,
}

impl ApplyOutcome {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn mutations(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

/// Execute `plan`. Transient write failures are retried with backoff;
/// conflicts re-read the live object and retry at once.
pub async fn apply(plan: &Plan, store: &dyn ApplicationStore, owner: &ApplicationSet, retry: &RetryConfig) -> ApplyOutcome {
    let t0 = Instant::now();
    let mut out = ApplyOutcome::default();

    for app in &plan.create {
        let key = app.key();
        match retry_with_backoff(retry, "create application", move || create_one(store, app, owner)).await {
            Ok(Created::New) => {
                counter!("appset_apps_created_total", 1u64);
                debug!(app = %key, "reconcile: created");
                out.created.push(key);
            }
            Ok(Created::Adopted) => {
                counter!("appset_apps_updated_total", 1u64);
                debug!(app = %key, "reconcile: adopted existing application");
                out.updated.push(key);
            }
            Err(e) => out.errors.push((key, e)),
        }
    }

    for upd in &plan.update {
        let key = upd.merged.key();
        let mut first = true;
        let res = retry_with_backoff(retry, "update application", move || {
            let reread = !std::mem::replace(&mut first, false);
            update_one(store, upd, owner, reread)
        })
        .await;
        match res {
            Ok(_) => {
                counter!("appset_apps_updated_total", 1u64);
                debug!(app = %key, "reconcile: updated");
                out.updated.push(key);
            }
            Err(e) => out.errors.push((key, e)),
        }
    }

    for key in &plan.delete {
        let res = retry_with_backoff(retry, "delete application", move || async move {
            match store.delete(&key.namespace, &key.name).await {
                Err(Error::NotFound(_)) => Ok(()),
                other => other,
            }
        })
        .await;
        match res {
            Ok(()) => {
                counter!("appset_apps_deleted_total", 1u64);
                debug!(app = %key, "reconcile: deleted");
                out.deleted.push(key.clone());
            }
            Err(e) => out.errors.push((key.clone(), e)),
        }
    }

    if !out.errors.is_empty() {
        counter!("appset_apply_errors_total", out.errors.len() as u64);
        warn!(appset = %owner.key(), errors = out.errors.len(), "reconcile: some writes failed");
    }
    histogram!("appset_apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    info!(
        appset = %owner.key(),
        created = out.created.len(),
        updated = out.updated.len(),
        deleted = out.deleted.len(),
        took_ms = %t0.elapsed().as_millis(),
        "reconcile: applied"
    );
    out
}

enum Created {
    New,
    /// Someone else created it first; the live object was updated instead.
    Adopted,
}

/// One create attempt. When the name is already taken the live object is
/// read back and, unless another ApplicationSet owns it, updated in place.
async fn create_one(store: &dyn ApplicationStore, app: &Application, owner: &ApplicationSet) -> Result<Created> {
    let msg = match store.create(app).await {
        Ok(_) => return Ok(Created::New),
        Err(Error::ReconcileConflict(msg)) => msg,
        Err(e) => return Err(e),
    };
    let key = app.key();
    debug!(app = %key, conflict = %msg, "reconcile: create conflict, reading live object");
    // Gone again between create and get: the next attempt creates it.
    let Some(live) = store.get(&key.namespace, &key.name).await? else {
        return Err(Error::ReconcileConflict(msg));
    };
    if live.appset_owner().is_some() && !live.is_owned_by(owner) {
        warn!(app = %key, appset = %owner.key(), "reconcile: application owned by another applicationset");
        return Err(Error::DuplicateApplicationName(key.to_string()));
    }
    store.update(&merge_templated(&live, app, owner)).await?;
    Ok(Created::Adopted)
}

/// One update attempt. A conflict triggers an immediate re-read and
/// re-merge; `reread` starts from the live object right away.
async fn update_one(store: &dyn ApplicationStore, upd: &Update, owner: &ApplicationSet, reread: bool) -> Result<()> {
    if !reread {
        match store.update(&upd.merged).await {
            Err(Error::ReconcileConflict(msg)) => debug!(conflict = %msg, "reconcile: update conflict, re-reading"),
            other => return other.map(|_| ()),
        }
    }
    let key = upd.merged.key();
    let live = store
        .get(&key.namespace, &key.name)
        .await?
        .ok_or_else(|| Error::NotFound(key.to_string()))?;
    store.update(&merge_templated(&live, &upd.desired, owner)).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::plan::plan;
    use appset_core::RESOURCES_FINALIZER;
    use std::time::Duration;

    fn owner() -> ApplicationSet {
        let mut set = ApplicationSet::default();
        set.metadata.name = Some("set".into());
        set.metadata.namespace = Some("argocd".into());
        set.metadata.uid = Some("uid-set".into());
        set
    }

    fn app(name: &str, dest: &str, o: &ApplicationSet) -> Application {
        let mut a = Application::default();
        a.metadata.name = Some(name.into());
        a.metadata.namespace = Some("argocd".into());
        a.metadata.finalizers = Some(vec![RESOURCES_FINALIZER.into()]);
        a.metadata.owner_references = Some(vec![o.owner_reference()]);
        a.spec.destination.namespace = Some(dest.into());
        a
    }

    #[tokio::test]
    async fn applies_plan_then_converges() {
        let o = owner();
        let store = MemoryStore::new();
        store.insert(app("old", "x", &o));
        store.insert(app("keep", "before", &o));

        let desired = vec![app("keep", "after", &o), app("new", "x", &o)];
        let p = plan(desired.clone(), store.list_owned_candidates("argocd").await.unwrap(), &o);
        let out = apply(&p, &store, &o, &RetryConfig::fast(3)).await;
        assert!(out.is_clean());
        assert_eq!(out.mutations(), 3);
        assert_eq!(store.names("argocd"), vec!["keep", "new"]);

        let again = plan(desired, store.list_owned_candidates("argocd").await.unwrap(), &o);
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn update_conflict_rereads_live_object() {
        let o = owner();
        let store = MemoryStore::new();
        store.insert(app("a", "before", &o));
        let p = plan(vec![app("a", "after", &o)], store.list_owned_candidates("argocd").await.unwrap(), &o);
        store.inject_conflicts(1);
        let out = apply(&p, &store, &o, &RetryConfig::fast(3)).await;
        assert!(out.is_clean(), "{:?}", out.errors);
        let live = store.get("argocd", "a").await.unwrap().unwrap();
        assert_eq!(live.spec.destination.namespace.as_deref(), Some("after"));
        assert_eq!(store.calls().updates, 2);
    }

    fn slow_retry() -> RetryConfig {
        RetryConfig { initial_delay: Duration::from_secs(30), max_delay: Duration::from_secs(60), ..RetryConfig::with_max_attempts(4) }
    }

    #[tokio::test]
    async fn update_conflicts_are_retried_without_waiting() {
        let o = owner();
        let store = MemoryStore::new();
        store.insert(app("a", "before", &o));
        let p = plan(vec![app("a", "after", &o)], store.list_owned_candidates("argocd").await.unwrap(), &o);
        store.inject_conflicts(2);
        let out = tokio::time::timeout(Duration::from_secs(5), apply(&p, &store, &o, &slow_retry())).await.unwrap();
        assert!(out.is_clean(), "{:?}", out.errors);
        assert_eq!(out.updated, vec![ObjectKey::new("argocd", "a")]);
        assert_eq!(store.calls().updates, 3);
    }

    #[tokio::test]
    async fn create_conflict_adopts_the_existing_application() {
        let o = owner();
        let store = MemoryStore::new();
        let p = plan(vec![app("a", "wanted", &o)], vec![], &o);
        let mut raced = app("a", "stale", &o);
        raced.metadata.owner_references = None;
        raced.status = Some(serde_json::json!({ "health": "Healthy" }));
        store.insert(raced);

        let out = tokio::time::timeout(Duration::from_secs(5), apply(&p, &store, &o, &slow_retry())).await.unwrap();
        assert!(out.is_clean(), "{:?}", out.errors);
        assert!(out.created.is_empty());
        assert_eq!(out.updated, vec![ObjectKey::new("argocd", "a")]);
        let live = store.get("argocd", "a").await.unwrap().unwrap();
        assert!(live.is_owned_by(&o));
        assert_eq!(live.spec.destination.namespace.as_deref(), Some("wanted"));
        assert!(live.status.is_some());
        assert_eq!((store.calls().creates, store.calls().updates), (1, 1));
    }

    #[tokio::test]
    async fn create_conflict_with_foreign_owner_is_reported() {
        let o = owner();
        let mut other = owner();
        other.metadata.name = Some("other".into());
        other.metadata.uid = Some("uid-other".into());
        let store = MemoryStore::new();
        store.insert(app("a", "theirs", &other));
        let p = plan(vec![app("a", "ours", &o)], vec![], &o);

        let out = apply(&p, &store, &o, &RetryConfig::fast(3)).await;
        assert!(matches!(out.errors.as_slice(), [(_, Error::DuplicateApplicationName(_))]), "{:?}", out.errors);
        assert_eq!(store.calls().creates, 1);
        let live = store.get("argocd", "a").await.unwrap().unwrap();
        assert_eq!(live.spec.destination.namespace.as_deref(), Some("theirs"));
    }

    #[tokio::test]
    async fn persistent_failures_are_reported() {
        let o = owner();
        let store = MemoryStore::new();
        store.inject_failures(10);
        let p = plan(vec![app("a", "x", &o)], vec![], &o);
        let out = apply(&p, &store, &o, &RetryConfig::fast(2)).await;
        assert_eq!(out.errors.len(), 1);
        assert!(out.created.is_empty());
    }
}
