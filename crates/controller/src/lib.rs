//! ApplicationSet control loop.
//!
//! Triggers land in a coalescing per-key [`WorkQueue`]; workers take one
//! ApplicationSet at a time, expand its generators against a fresh cluster
//! snapshot, render the desired Applications, reconcile them against the
//! live ones and record the result as status conditions.

#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use appset_core::{
    merge_conditions, Application, ApplicationSet, Condition, ConditionStatus, ConditionType, Error, ObjectKey, Result,
};
use appset_generators::{evaluate, DecisionReader, EvalOptions, GeneratorContext, RepoService};
use appset_reconcile::{apply, plan, ApplicationSetStore, ApplicationStore, ApplyOutcome, Plan, RetryConfig};
use appset_store::{ClusterRegistry, Lease, WorkQueue};
use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

mod config;
mod triggers;

pub use config::ControllerConfig;
pub use triggers::{spawn_cluster_trigger, spawn_event_trigger, TriggerSource};

/// External collaborators of the control loop.
#[derive(Clone)]
pub struct Collaborators {
    pub appsets: Arc<dyn ApplicationSetStore>,
    pub apps: Arc<dyn ApplicationStore>,
    pub repos: Arc<dyn RepoService>,
    pub decisions: Arc<dyn DecisionReader>,
    pub clusters: ClusterRegistry,
}

/// How a single reconcile pass ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Synced { created: usize, updated: usize, deleted: usize, unchanged: usize, failed: usize },
    /// Generation or rendering failed; Applications were left untouched.
    Failed(Error),
    /// A newer trigger arrived while the pass ran; nothing was written.
    Superseded,
    /// The ApplicationSet is gone or deleting; its Applications were deleted.
    Removed { deleted: usize },
    /// Gone or deleting with `preserveResourcesOnDeletion`.
    Preserved,
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Synced { failed: 0, .. } => "synced",
            Self::Synced { .. } => "write_errors",
            Self::Failed(_) => "failed",
            Self::Superseded => "superseded",
            Self::Removed { .. } => "removed",
            Self::Preserved => "preserved",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub key: ObjectKey,
    pub outcome: Outcome,
    pub requeue_after: Option<Duration>,
}

/// What the controller last saw of an ApplicationSet, used once it is gone
/// and to resolve owner references by uid.
#[derive(Debug, Clone, Default)]
struct Retention {
    uid: Option<String>,
    preserve: bool,
    /// Namespaces holding Applications the set managed on its last pass.
    namespaces: BTreeSet<String>,
}

pub struct Controller {
    config: ControllerConfig,
    deps: Collaborators,
    eval: EvalOptions,
    retry: RetryConfig,
    queue: Arc<WorkQueue<ObjectKey>>,
    retention: Mutex<HashMap<ObjectKey, Retention>>,
}

impl Controller {
    pub fn new(config: ControllerConfig, deps: Collaborators) -> Self {
        let eval = config.eval_options();
        let retry = config.retry_config();
        Self { config, deps, eval, retry, queue: Arc::new(WorkQueue::new()), retention: Mutex::new(HashMap::new()) }
    }

    /// Replace the write retry policy (tests use short backoffs).
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ObjectKey>> {
        &self.queue
    }

    fn watches(&self, namespace: &str) -> bool {
        self.config.namespaces.is_empty() || self.config.namespaces.iter().any(|n| n == namespace)
    }

    fn retention(&self) -> MutexGuard<'_, HashMap<ObjectKey, Retention>> {
        self.retention.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue one ApplicationSet.
    pub fn trigger(&self, key: ObjectKey) {
        if !self.watches(&key.namespace) {
            return;
        }
        counter!("appset_triggers_total", 1u64);
        self.queue.add(key);
    }

    /// Enqueue every ApplicationSet; returns how many.
    pub async fn trigger_all(&self) -> Result<usize> {
        self.trigger_matching(|_| true).await
    }

    /// Enqueue the ApplicationSets that read a duck-typed decision resource.
    pub async fn trigger_decision_users(&self) -> Result<usize> {
        self.trigger_matching(ApplicationSet::uses_decision_resource).await
    }

    async fn trigger_matching(&self, pred: impl Fn(&ApplicationSet) -> bool) -> Result<usize> {
        let sets = self.deps.appsets.list().await?;
        let mut n = 0;
        for set in sets.iter().filter(|s| pred(s)) {
            self.trigger(set.key());
            n += 1;
        }
        debug!(count = n, "controller: triggered applicationsets");
        Ok(n)
    }

    /// Run one pass for `key` outside the queue. The pass is never treated
    /// as superseded.
    pub async fn reconcile_now(&self, key: &ObjectKey) -> Report {
        self.reconcile(key, None).await
    }

    fn superseded(&self, lease: Option<&Lease<ObjectKey>>) -> bool {
        lease.is_some_and(|l| !self.queue.is_current(l))
    }

    async fn reconcile(&self, key: &ObjectKey, lease: Option<&Lease<ObjectKey>>) -> Report {
        let t0 = Instant::now();
        let report = match self.deps.appsets.get(key).await {
            Err(e) => {
                warn!(appset = %key, error = %e, "controller: reading applicationset failed");
                let requeue_after = e.is_retryable().then_some(self.config.error_requeue);
                Report { key: key.clone(), outcome: Outcome::Failed(e), requeue_after }
            }
            Ok(None) => self.finalize_missing(key).await,
            Ok(Some(set)) if set.is_deleting() => {
                self.remember(&set);
                self.remove_owned(&set).await
            }
            Ok(Some(set)) => self.sync(set, lease).await,
        };
        let label = report.outcome.label();
        counter!("appset_reconcile_total", 1u64, "result" => label);
        histogram!("appset_reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(appset = %key, result = label, took_ms = %t0.elapsed().as_millis(), "controller: pass finished");
        report
    }

    fn remember(&self, set: &ApplicationSet) {
        let mut retention = self.retention();
        let entry = retention.entry(set.key()).or_default();
        entry.uid = set.metadata.uid.clone();
        entry.preserve = set.preserves_resources_on_deletion();
    }

    fn remember_namespaces(&self, key: &ObjectKey, namespaces: BTreeSet<String>) {
        if let Some(entry) = self.retention().get_mut(key) {
            entry.namespaces = namespaces;
        }
    }

    /// ApplicationSet behind an Application owner reference. Sets seen by
    /// this controller are found by uid; otherwise the owner is assumed to
    /// live in the Application's namespace.
    pub fn owner_of(&self, app_namespace: &str, owner_name: &str, owner_uid: Option<&str>) -> ObjectKey {
        if let Some(uid) = owner_uid.filter(|u| !u.is_empty()) {
            let retention = self.retention();
            let found = retention.iter().find(|(k, r)| k.name == owner_name && r.uid.as_deref() == Some(uid));
            if let Some((key, _)) = found {
                return key.clone();
            }
        }
        ObjectKey::new(app_namespace, owner_name)
    }

    async fn finalize_missing(&self, key: &ObjectKey) -> Report {
        let retained = self.retention().get(key).cloned();
        let Some(retention) = retained else {
            debug!(appset = %key, "controller: applicationset unknown; owner references left to garbage collection");
            return Report { key: key.clone(), outcome: Outcome::Removed { deleted: 0 }, requeue_after: None };
        };
        let mut owner = ApplicationSet::default();
        owner.metadata.name = Some(key.name.clone());
        owner.metadata.namespace = Some(key.namespace.clone());
        owner.metadata.uid = retention.uid;
        if retention.preserve {
            owner.spec.sync_policy = Some(appset_core::AppSetSyncPolicy { preserve_resources_on_deletion: true, applications_sync: None });
        }
        let report = self.remove_owned(&owner).await;
        if report.requeue_after.is_none() {
            self.retention().remove(key);
        }
        report
    }

    /// Delete every Application owned by `owner` unless it preserves them.
    async fn remove_owned(&self, owner: &ApplicationSet) -> Report {
        let key = owner.key();
        if owner.preserves_resources_on_deletion() {
            info!(appset = %key, "controller: applicationset removed; preserving its applications");
            return Report { key, outcome: Outcome::Preserved, requeue_after: None };
        }
        let actual = match self.list_candidates(owner, &[]).await {
            Ok(apps) => apps,
            Err(e) => {
                warn!(appset = %key, error = %e, "controller: listing applications for cleanup failed");
                let requeue_after = Some(self.config.error_requeue);
                return Report { key, outcome: Outcome::Failed(e), requeue_after };
            }
        };
        let delete: Vec<ObjectKey> = actual.iter().filter(|a| a.is_owned_by(owner)).map(Application::key).collect();
        let cleanup = Plan { delete, ..Plan::default() };
        let out = apply(&cleanup, self.deps.apps.as_ref(), owner, &self.retry).await;
        info!(appset = %key, deleted = out.deleted.len(), failed = out.errors.len(), "controller: applicationset removed; applications deleted");
        let requeue_after = (!out.is_clean()).then_some(self.config.fallback_requeue);
        Report { key, outcome: Outcome::Removed { deleted: out.deleted.len() }, requeue_after }
    }

    async fn sync(&self, set: ApplicationSet, lease: Option<&Lease<ObjectKey>>) -> Report {
        let key = set.key();
        self.remember(&set);
        let ctx = GeneratorContext {
            namespace: set.namespace().to_string(),
            clusters: self.deps.clusters.current(),
            repos: Arc::clone(&self.deps.repos),
            decisions: Arc::clone(&self.deps.decisions),
        };
        let rendered = match evaluate(&set, &ctx, &self.eval).await {
            Ok(ev) => appset_template::render_all(&set, &ev.params).map(|apps| (apps, ev)),
            Err(e) => Err(e),
        };
        if self.superseded(lease) {
            debug!(appset = %key, "controller: superseded after generation; result discarded");
            return Report { key, outcome: Outcome::Superseded, requeue_after: None };
        }
        let (desired, evaluation) = match rendered {
            Ok(r) => r,
            Err(e) => {
                counter!("appset_reconcile_errors_total", 1u64, "stage" => "generate");
                warn!(appset = %key, error = %e, "controller: generation failed; applications left untouched");
                self.write_conditions(&set, failure_conditions(&e)).await;
                let requeue_after = e.is_retryable().then_some(self.config.error_requeue);
                return Report { key, outcome: Outcome::Failed(e), requeue_after };
            }
        };

        let actual = match self.list_candidates(&set, &desired).await {
            Ok(a) => a,
            Err(e) => {
                counter!("appset_reconcile_errors_total", 1u64, "stage" => "list");
                warn!(appset = %key, error = %e, "controller: listing applications failed");
                let requeue_after = e.is_retryable().then_some(self.config.error_requeue);
                return Report { key, outcome: Outcome::Failed(e), requeue_after };
            }
        };
        if self.superseded(lease) {
            debug!(appset = %key, "controller: superseded before apply; result discarded");
            return Report { key, outcome: Outcome::Superseded, requeue_after: None };
        }

        let mut managed: BTreeSet<String> = desired.iter().map(|a| a.namespace().to_string()).collect();
        managed.extend(actual.iter().filter(|a| a.is_owned_by(&set)).map(|a| a.namespace().to_string()));
        self.remember_namespaces(&key, managed);

        let plan = plan(desired, actual, &set);
        debug!(appset = %key, plan = %plan.summary(), "controller: planned");
        let out = apply(&plan, self.deps.apps.as_ref(), &set, &self.retry).await;
        self.write_conditions(&set, applied_conditions(evaluation.params.len(), &plan, &out)).await;

        if !out.is_clean() {
            counter!("appset_reconcile_errors_total", 1u64, "stage" => "apply");
        }
        if out.mutations() > 0 || !out.is_clean() {
            info!(
                appset = %key,
                created = out.created.len(),
                updated = out.updated.len(),
                deleted = out.deleted.len(),
                failed = out.errors.len(),
                "controller: applications reconciled"
            );
        }
        let requeue_after = if out.is_clean() { evaluation.requeue_after } else { Some(self.config.fallback_requeue) };
        let outcome = Outcome::Synced {
            created: out.created.len(),
            updated: out.updated.len(),
            deleted: out.deleted.len(),
            unchanged: plan.unchanged,
            failed: out.errors.len(),
        };
        Report { key, outcome, requeue_after }
    }

    /// Live Applications owned by `set` or holding a desired name. Without a
    /// namespace restriction every namespace is listed; otherwise the watched
    /// namespaces, the set's own, every desired one and every one the set
    /// managed on its last pass.
    async fn list_candidates(&self, set: &ApplicationSet, desired: &[Application]) -> Result<Vec<Application>> {
        let live = if self.config.namespaces.is_empty() {
            self.deps.apps.list_all().await?
        } else {
            let mut namespaces: BTreeSet<String> = self.config.namespaces.iter().cloned().collect();
            namespaces.insert(set.namespace().to_string());
            namespaces.extend(desired.iter().map(|a| a.namespace().to_string()));
            let remembered = self.retention().get(&set.key()).map(|r| r.namespaces.clone()).unwrap_or_default();
            namespaces.extend(remembered);
            let mut out = Vec::new();
            for ns in &namespaces {
                out.extend(self.deps.apps.list_owned_candidates(ns).await?);
            }
            out
        };
        let wanted: HashSet<ObjectKey> = desired.iter().map(Application::key).collect();
        Ok(live.into_iter().filter(|a| a.is_owned_by(set) || wanted.contains(&a.key())).collect())
    }

    async fn write_conditions(&self, set: &ApplicationSet, updates: Vec<Condition>) {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let merged = merge_conditions(&set.status.conditions, updates, &now);
        if merged == set.status.conditions {
            return;
        }
        if let Err(e) = self.deps.appsets.write_conditions(&set.key(), &merged).await {
            warn!(appset = %set.key(), error = %e, "controller: writing status conditions failed");
        }
    }

    /// Start `config.workers` workers draining the queue until shutdown.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|id| {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.work(id).await })
            })
            .collect()
    }

    async fn work(&self, worker: usize) {
        debug!(worker, "controller: worker started");
        while let Some(lease) = self.queue.next().await {
            let report = self.reconcile(&lease.key, Some(&lease)).await;
            self.queue.done(&lease.key);
            match (&report.outcome, report.requeue_after) {
                (_, Some(after)) => self.queue.add_after(lease.key, after),
                (Outcome::Removed { .. } | Outcome::Preserved, None) => self.queue.forget(&lease.key),
                _ => {}
            }
        }
        debug!(worker, "controller: worker stopped");
    }

    /// Process triggers until `shutdown` resolves, then drain the workers.
    pub async fn run(self: Arc<Self>, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
        let workers = self.spawn_workers();
        let cluster_trigger = spawn_cluster_trigger(Arc::clone(&self));
        let initial = self.trigger_all().await?;
        info!(applicationsets = initial, workers = workers.len(), "controller: running");
        shutdown.await;
        info!("controller: shutting down");
        cluster_trigger.abort();
        self.queue.shutdown();
        futures::future::join_all(workers).await;
        Ok(())
    }
}

fn failure_conditions(e: &Error) -> Vec<Condition> {
    vec![
        Condition::new(ConditionType::ErrorOccurred, ConditionStatus::True, e.reason(), e.to_string()),
        Condition::new(ConditionType::ParametersGenerated, ConditionStatus::False, e.reason(), e.to_string()),
        Condition::new(ConditionType::ResourcesUpToDate, ConditionStatus::False, "ApplicationSetError", e.to_string()),
    ]
}

fn applied_conditions(params: usize, plan: &Plan, out: &ApplyOutcome) -> Vec<Condition> {
    let generated = Condition::new(
        ConditionType::ParametersGenerated,
        ConditionStatus::True,
        "ParametersGenerated",
        format!("Successfully generated {params} parameter sets"),
    );
    if let Some((key, e)) = out.errors.first() {
        let msg = format!("{} application writes failed; first: {key}: {e}", out.errors.len());
        return vec![
            Condition::new(ConditionType::ErrorOccurred, ConditionStatus::True, e.reason(), msg.clone()),
            generated,
            Condition::new(ConditionType::ResourcesUpToDate, ConditionStatus::False, e.reason(), msg),
        ];
    }
    if !plan.foreign.is_empty() {
        let names: Vec<String> = plan.foreign.iter().map(ToString::to_string).collect();
        let msg = format!("applications owned by another applicationset: {}", names.join(", "));
        return vec![
            Condition::new(ConditionType::ErrorOccurred, ConditionStatus::True, "ApplicationValidationError", msg.clone()),
            generated,
            Condition::new(ConditionType::ResourcesUpToDate, ConditionStatus::False, "ApplicationValidationError", msg),
        ];
    }
    vec![
        Condition::new(ConditionType::ErrorOccurred, ConditionStatus::False, "ApplicationSetUpToDate", "All applications have been generated successfully"),
        generated,
        Condition::new(ConditionType::ResourcesUpToDate, ConditionStatus::True, "ApplicationSetUpToDate", "All applications have been generated successfully"),
    ]
}
