//! In-memory object stores with call accounting and fault injection.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use appset_core::{Application, ApplicationSet, Condition, Error, ObjectKey, Result};

use crate::{ApplicationSetStore, ApplicationStore};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mutating calls seen by a [`MemoryStore`], failed ones included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Calls {
    pub creates: u64,
    pub updates: u64,
    pub deletes: u64,
}

impl Calls {
    pub fn total(&self) -> u64 {
        self.creates + self.updates + self.deletes
    }
}

#[derive(Default)]
struct State {
    apps: BTreeMap<ObjectKey, Application>,
    next_version: u64,
    calls: Calls,
    pending_conflicts: u32,
    pending_failures: u32,
}

impl State {
    fn stamp(&mut self, app: &mut Application) {
        self.next_version += 1;
        app.metadata.resource_version = Some(self.next_version.to_string());
        if app.metadata.uid.is_none() {
            app.metadata.uid = Some(format!("app-uid-{}", self.next_version));
        }
    }

    fn injected_failure(&mut self) -> Option<Error> {
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Some(Error::Internal("injected store failure".into()));
        }
        None
    }
}

/// Application store backed by a map, with resourceVersion checks.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an Application, bypassing call accounting.
    pub fn insert(&self, mut app: Application) -> Application {
        let mut st = lock(&self.state);
        st.stamp(&mut app);
        st.apps.insert(app.key(), app.clone());
        app
    }

    /// Sorted names of the Applications in `namespace`.
    pub fn names(&self, namespace: &str) -> Vec<String> {
        lock(&self.state).apps.keys().filter(|k| k.namespace == namespace).map(|k| k.name.clone()).collect()
    }

    pub fn all(&self) -> Vec<Application> {
        lock(&self.state).apps.values().cloned().collect()
    }

    pub fn calls(&self) -> Calls {
        lock(&self.state).calls
    }

    /// The next `n` updates fail with a conflict, as if another writer won.
    pub fn inject_conflicts(&self, n: u32) {
        lock(&self.state).pending_conflicts = n;
    }

    /// The next `n` mutating calls fail with a retryable error.
    pub fn inject_failures(&self, n: u32) {
        lock(&self.state).pending_failures = n;
    }

    /// Set a live field the way the sync engine would, bumping the version.
    pub fn touch(&self, namespace: &str, name: &str, f: impl FnOnce(&mut Application)) -> bool {
        let mut st = lock(&self.state);
        let key = ObjectKey::new(namespace, name);
        let Some(mut app) = st.apps.get(&key).cloned() else {
            return false;
        };
        f(&mut app);
        st.stamp(&mut app);
        st.apps.insert(key, app);
        true
    }
}

#[async_trait::async_trait]
impl ApplicationStore for MemoryStore {
    async fn list_owned_candidates(&self, namespace: &str) -> Result<Vec<Application>> {
        Ok(lock(&self.state).apps.values().filter(|a| a.namespace() == namespace).cloned().collect())
    }

    async fn list_all(&self) -> Result<Vec<Application>> {
        Ok(self.all())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Application>> {
        Ok(lock(&self.state).apps.get(&ObjectKey::new(namespace, name)).cloned())
    }

    async fn create(&self, app: &Application) -> Result<Application> {
        let mut st = lock(&self.state);
        st.calls.creates += 1;
        if let Some(e) = st.injected_failure() {
            return Err(e);
        }
        let key = app.key();
        if st.apps.contains_key(&key) {
            return Err(Error::ReconcileConflict(format!("{key} already exists")));
        }
        let mut stored = app.clone();
        stored.metadata.uid = None;
        st.stamp(&mut stored);
        st.apps.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update(&self, app: &Application) -> Result<Application> {
        let mut st = lock(&self.state);
        st.calls.updates += 1;
        if let Some(e) = st.injected_failure() {
            return Err(e);
        }
        let key = app.key();
        let Some(current) = st.apps.get(&key).cloned() else {
            return Err(Error::NotFound(key.to_string()));
        };
        if st.pending_conflicts > 0 {
            st.pending_conflicts -= 1;
            let mut bumped = current;
            st.stamp(&mut bumped);
            st.apps.insert(key.clone(), bumped);
            return Err(Error::ReconcileConflict(key.to_string()));
        }
        if app.metadata.resource_version.is_some() && app.metadata.resource_version != current.metadata.resource_version {
            return Err(Error::ReconcileConflict(key.to_string()));
        }
        let mut stored = app.clone();
        stored.metadata.uid = current.metadata.uid.clone();
        st.stamp(&mut stored);
        st.apps.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let mut st = lock(&self.state);
        st.calls.deletes += 1;
        if let Some(e) = st.injected_failure() {
            return Err(e);
        }
        let key = ObjectKey::new(namespace, name);
        match st.apps.remove(&key) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(key.to_string())),
        }
    }
}

/// ApplicationSets held in memory; conditions land in `status`.
#[derive(Default)]
pub struct MemoryAppSets {
    sets: Mutex<BTreeMap<ObjectKey, ApplicationSet>>,
    next_generation: Mutex<i64>,
}

impl MemoryAppSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace, bumping `metadata.generation` like the API server.
    pub fn put(&self, mut set: ApplicationSet) -> ApplicationSet {
        let mut gen = lock(&self.next_generation);
        *gen += 1;
        set.metadata.generation = Some(*gen);
        if set.metadata.uid.is_none() {
            set.metadata.uid = Some(format!("appset-uid-{}", set.name()));
        }
        let mut sets = lock(&self.sets);
        if let Some(prev) = sets.get(&set.key()) {
            set.status = prev.status.clone();
        }
        sets.insert(set.key(), set.clone());
        set
    }

    pub fn remove(&self, key: &ObjectKey) -> Option<ApplicationSet> {
        lock(&self.sets).remove(key)
    }

    pub fn conditions(&self, key: &ObjectKey) -> Vec<Condition> {
        lock(&self.sets).get(key).map(|s| s.status.conditions.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ApplicationSetStore for MemoryAppSets {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ApplicationSet>> {
        Ok(lock(&self.sets).get(key).cloned())
    }

    async fn list(&self) -> Result<Vec<ApplicationSet>> {
        Ok(lock(&self.sets).values().cloned().collect())
    }

    async fn write_conditions(&self, key: &ObjectKey, conditions: &[Condition]) -> Result<()> {
        match lock(&self.sets).get_mut(key) {
            Some(set) => {
                set.status.conditions = conditions.to_vec();
                Ok(())
            }
            None => Err(Error::NotFound(key.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(name: &str) -> Application {
        let mut a = Application::default();
        a.metadata.name = Some(name.into());
        a.metadata.namespace = Some("ns".into());
        a
    }

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let store = MemoryStore::new();
        let created = store.create(&app("a")).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert!(store.touch("ns", "a", |a| a.status = Some(serde_json::json!({ "health": "Healthy" }))));
        let err = store.update(&created).await.unwrap_err();
        assert!(matches!(err, Error::ReconcileConflict(_)));
        assert!(matches!(store.create(&app("a")).await, Err(Error::ReconcileConflict(_))));
        assert_eq!(store.calls(), Calls { creates: 2, updates: 1, deletes: 0 });
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(store.delete("ns", "nope").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn appset_generation_bumps_and_status_survives_put() {
        let sets = MemoryAppSets::new();
        let mut s = ApplicationSet::default();
        s.metadata.name = Some("s".into());
        s.metadata.namespace = Some("ns".into());
        let first = sets.put(s.clone());
        let cond = Condition::new(appset_core::ConditionType::ErrorOccurred, appset_core::ConditionStatus::False, "ok", "ok");
        sets.write_conditions(&first.key(), &[cond]).await.unwrap();
        let second = sets.put(s);
        assert!(second.metadata.generation > first.metadata.generation);
        assert_eq!(sets.conditions(&first.key()).len(), 1);
    }
}
