use std::sync::Arc;
use std::time::Duration;

use appset_controller::{Collaborators, Controller, ControllerConfig, Outcome};
use appset_core::{ApplicationSet, ClusterInfo, ClusterSnapshot, ConditionStatus, ConditionType, ObjectKey};
use appset_generators::memory::{MemoryDecisionReader, MemoryRepoService};
use appset_reconcile::memory::{MemoryAppSets, MemoryStore};
use appset_reconcile::{ApplicationSetStore, RetryConfig};
use appset_store::ClusterRegistry;
use serde_json::json;

const REPO: &str = "https://github.com/argoproj/argocd-example-apps.git";

struct Harness {
    appsets: Arc<MemoryAppSets>,
    apps: Arc<MemoryStore>,
    repos: Arc<MemoryRepoService>,
    decisions: Arc<MemoryDecisionReader>,
    clusters: ClusterRegistry,
    ctl: Controller,
}

fn cluster(name: &str, env: &str) -> ClusterInfo {
    ClusterInfo {
        name: name.into(),
        server: format!("https://{name}.example.com"),
        labels: [("env".to_string(), env.to_string())].into_iter().collect(),
        ..Default::default()
    }
}

fn harness() -> Harness {
    harness_with(ControllerConfig::default())
}

fn harness_with(config: ControllerConfig) -> Harness {
    let appsets = Arc::new(MemoryAppSets::new());
    let apps = Arc::new(MemoryStore::new());
    let repos = Arc::new(MemoryRepoService::new());
    let decisions = Arc::new(MemoryDecisionReader::new());
    let clusters = ClusterRegistry::fixed(vec![cluster("cluster1", "prod"), cluster("cluster2", "staging")]);
    repos.set(REPO, "HEAD", &["apps", "apps/guestbook", "apps/helm-guestbook", "apps/kustomize-guestbook", "docs"]);
    let deps = Collaborators {
        appsets: appsets.clone(),
        apps: apps.clone(),
        repos: repos.clone(),
        decisions: decisions.clone(),
        clusters: clusters.clone(),
    };
    let ctl = Controller::new(config, deps).with_retry(RetryConfig::fast(2));
    Harness { appsets, apps, repos, decisions, clusters, ctl }
}

fn appset(yaml: &str) -> ApplicationSet {
    serde_yaml::from_str(yaml).unwrap()
}

const MATRIX_LIST_GIT: &str = r#"
metadata: { name: guestbook, namespace: argocd }
spec:
  generators:
    - matrix:
        generators:
          - list:
              elements:
                - cluster: engineering-dev
                  url: https://1.2.3.4
                - cluster: engineering-prod
                  url: https://2.4.6.8
          - git:
              repoURL: https://github.com/argoproj/argocd-example-apps.git
              directories:
                - path: apps/*
  template:
    metadata:
      name: "{{cluster}}-{{path.basename}}"
      labels:
        cluster: "{{cluster}}"
    spec:
      project: default
      source:
        repoURL: https://github.com/argoproj/argocd-example-apps.git
        targetRevision: HEAD
        path: "{{path}}"
      destination:
        server: "{{url}}"
        namespace: "{{path.basename}}"
"#;

fn key() -> ObjectKey {
    ObjectKey::new("argocd", "guestbook")
}

fn condition(h: &Harness, type_: ConditionType) -> Option<ConditionStatus> {
    h.appsets.conditions(&key()).into_iter().find(|c| c.type_ == type_).map(|c| c.status)
}

#[tokio::test]
async fn matrix_of_list_and_git_creates_every_combination() {
    let h = harness();
    h.appsets.put(appset(MATRIX_LIST_GIT));
    let report = h.ctl.reconcile_now(&key()).await;
    assert!(matches!(report.outcome, Outcome::Synced { created: 6, failed: 0, .. }), "{:?}", report.outcome);
    assert_eq!(report.requeue_after, Some(Duration::from_secs(180)));

    let names = h.apps.names("argocd");
    assert_eq!(names.len(), 6);
    assert!(names.contains(&"engineering-dev-helm-guestbook".to_string()));
    assert!(names.contains(&"engineering-prod-kustomize-guestbook".to_string()));

    let app = h.apps.all().into_iter().find(|a| a.name() == "engineering-prod-guestbook").unwrap();
    assert_eq!(app.spec.destination.server.as_deref(), Some("https://2.4.6.8"));
    assert_eq!(app.spec.source.as_ref().and_then(|s| s.path.as_deref()), Some("apps/guestbook"));
    assert_eq!(app.metadata.finalizers.as_deref(), Some(&["resources-finalizer.argocd.argoproj.io".to_string()][..]));
    assert_eq!(app.metadata.owner_references.as_ref().map(|r| r[0].uid.as_str()), Some("appset-uid-guestbook"));

    assert_eq!(condition(&h, ConditionType::ResourcesUpToDate), Some(ConditionStatus::True));
    assert_eq!(condition(&h, ConditionType::ErrorOccurred), Some(ConditionStatus::False));
}

#[tokio::test]
async fn unchanged_inputs_issue_no_writes() {
    let h = harness();
    h.appsets.put(appset(MATRIX_LIST_GIT));
    h.ctl.reconcile_now(&key()).await;
    let before = h.apps.calls();
    let conditions = h.appsets.conditions(&key());

    let report = h.ctl.reconcile_now(&key()).await;
    assert!(matches!(report.outcome, Outcome::Synced { created: 0, updated: 0, deleted: 0, unchanged: 6, failed: 0 }));
    assert_eq!(h.apps.calls(), before);
    assert_eq!(h.appsets.conditions(&key()), conditions);
}

#[tokio::test]
async fn template_namespace_change_only_touches_destination() {
    let h = harness();
    h.appsets.put(appset(MATRIX_LIST_GIT));
    h.ctl.reconcile_now(&key()).await;
    let before: Vec<_> = h.apps.all();
    h.apps.touch("argocd", "engineering-dev-guestbook", |a| a.status = Some(json!({ "sync": { "status": "Synced" } })));

    h.appsets.put(appset(&MATRIX_LIST_GIT.replace("namespace: \"{{path.basename}}\"", "namespace: \"{{cluster}}\"")));
    let calls = h.apps.calls();
    let report = h.ctl.reconcile_now(&key()).await;
    assert!(matches!(report.outcome, Outcome::Synced { created: 0, updated: 6, deleted: 0, .. }), "{:?}", report.outcome);
    assert_eq!(h.apps.calls().creates, calls.creates);
    assert_eq!(h.apps.calls().deletes, calls.deletes);

    for app in h.apps.all() {
        let old = before.iter().find(|b| b.name() == app.name()).unwrap();
        assert_eq!(app.spec.source, old.spec.source);
        assert_eq!(app.spec.destination.server, old.spec.destination.server);
        assert_eq!(app.metadata.labels, old.metadata.labels);
        let cluster = app.metadata.labels.as_ref().and_then(|l| l.get("cluster")).cloned();
        assert_eq!(app.spec.destination.namespace, cluster);
    }
    let touched = h.apps.all().into_iter().find(|a| a.name() == "engineering-dev-guestbook").unwrap();
    assert_eq!(touched.status, Some(json!({ "sync": { "status": "Synced" } })));
}

#[tokio::test]
async fn deleting_the_applicationset_removes_its_applications() {
    let h = harness();
    h.appsets.put(appset(MATRIX_LIST_GIT));
    h.ctl.reconcile_now(&key()).await;
    let mut stranger = h.apps.all()[0].clone();
    stranger.metadata.name = Some("hand-made".into());
    stranger.metadata.owner_references = None;
    h.apps.insert(stranger);

    let mut deleting = h.appsets.get(&key()).await.unwrap().unwrap();
    deleting.metadata.deletion_timestamp = serde_json::from_value(json!("2026-01-01T00:00:00Z")).unwrap();
    h.appsets.put(deleting);
    let report = h.ctl.reconcile_now(&key()).await;
    assert_eq!(report.outcome, Outcome::Removed { deleted: 6 });
    assert_eq!(h.apps.names("argocd"), vec!["hand-made"]);

    h.appsets.remove(&key());
    let report = h.ctl.reconcile_now(&key()).await;
    assert_eq!(report.outcome, Outcome::Removed { deleted: 0 });
}

#[tokio::test]
async fn removed_applicationset_with_preserve_keeps_applications() {
    let h = harness();
    let yaml = MATRIX_LIST_GIT.replace("spec:\n  generators:", "spec:\n  syncPolicy:\n    preserveResourcesOnDeletion: true\n  generators:");
    h.appsets.put(appset(&yaml));
    h.ctl.reconcile_now(&key()).await;
    assert_eq!(h.apps.names("argocd").len(), 6);

    h.appsets.remove(&key());
    assert_eq!(h.ctl.reconcile_now(&key()).await.outcome, Outcome::Preserved);
    assert_eq!(h.apps.names("argocd").len(), 6);
}

#[tokio::test]
async fn removed_applicationset_deletes_what_it_owned() {
    let h = harness();
    h.appsets.put(appset(MATRIX_LIST_GIT));
    h.ctl.reconcile_now(&key()).await;
    h.appsets.remove(&key());
    assert_eq!(h.ctl.reconcile_now(&key()).await.outcome, Outcome::Removed { deleted: 6 });
    assert!(h.apps.names("argocd").is_empty());
}

fn list_into_namespace(app_ns: &str) -> ApplicationSet {
    appset(&format!(
        r#"
metadata: {{ name: guestbook, namespace: argocd }}
spec:
  generators:
    - list:
        elements: [{{ name: one }}]
  template:
    metadata: {{ name: "{{{{name}}}}", namespace: {app_ns} }}
    spec:
      project: default
      destination: {{ server: https://kubernetes.default.svc, namespace: "{{{{name}}}}" }}
"#
    ))
}

async fn applications_follow_template_namespace(h: Harness) {
    h.appsets.put(list_into_namespace("other"));
    let report = h.ctl.reconcile_now(&key()).await;
    assert!(matches!(report.outcome, Outcome::Synced { created: 1, .. }), "{:?}", report.outcome);
    assert_eq!(h.apps.names("other"), vec!["one"]);

    h.appsets.put(list_into_namespace("third"));
    let report = h.ctl.reconcile_now(&key()).await;
    assert!(matches!(report.outcome, Outcome::Synced { created: 1, deleted: 1, .. }), "{:?}", report.outcome);
    assert!(h.apps.names("other").is_empty());
    assert_eq!(h.apps.names("third"), vec!["one"]);

    h.appsets.remove(&key());
    assert_eq!(h.ctl.reconcile_now(&key()).await.outcome, Outcome::Removed { deleted: 1 });
    assert!(h.apps.all().is_empty());
}

#[tokio::test]
async fn applications_in_other_namespaces_are_tracked_across_moves_and_removal() {
    applications_follow_template_namespace(harness()).await;
}

#[tokio::test]
async fn namespace_restricted_controller_remembers_where_it_created_applications() {
    let config = ControllerConfig { namespaces: vec!["argocd".into()], ..ControllerConfig::default() };
    applications_follow_template_namespace(harness_with(config)).await;
}

#[tokio::test]
async fn owner_references_resolve_by_uid_across_namespaces() {
    let h = harness();
    h.appsets.put(list_into_namespace("other"));
    h.ctl.reconcile_now(&key()).await;
    let app = h.apps.all().into_iter().next().unwrap();
    let owner = app.appset_owner().unwrap();
    assert_eq!(h.ctl.owner_of(app.namespace(), &owner.name, Some(owner.uid.as_str())), key());
    assert_eq!(h.ctl.owner_of("other", "guestbook", Some("unknown-uid")), ObjectKey::new("other", "guestbook"));
}

const NESTED_SELECTOR: &str = r#"
metadata: { name: guestbook, namespace: argocd }
spec:
  applyNestedSelectors: false
  generators:
    - matrix:
        generators:
          - list:
              elements:
                - { cluster: a, env: prod }
                - { cluster: b, env: dev }
            selector:
              matchLabels: { env: prod }
          - list:
              elements:
                - { app: guestbook }
  template:
    metadata: { name: "{{cluster}}-{{app}}" }
    spec:
      project: default
      destination: { server: https://kubernetes.default.svc, namespace: "{{app}}" }
"#;

#[tokio::test]
async fn nested_selectors_apply_only_when_enabled() {
    let h = harness();
    h.appsets.put(appset(NESTED_SELECTOR));
    h.ctl.reconcile_now(&key()).await;
    assert_eq!(h.apps.names("argocd"), vec!["a-guestbook", "b-guestbook"]);

    h.appsets.put(appset(&NESTED_SELECTOR.replace("applyNestedSelectors: false", "applyNestedSelectors: true")));
    let report = h.ctl.reconcile_now(&key()).await;
    assert!(matches!(report.outcome, Outcome::Synced { deleted: 1, .. }), "{:?}", report.outcome);
    assert_eq!(h.apps.names("argocd"), vec!["a-guestbook"]);
}

const DUCK: &str = r#"
metadata: { name: guestbook, namespace: argocd }
spec:
  generators:
    - clusterDecisionResource:
        configMapRef: my-configmap
        name: quak
        requeueAfterSeconds: 30
  template:
    metadata: { name: "{{clusterName}}-guestbook" }
    spec:
      project: default
      source: { repoURL: https://github.com/argoproj/argocd-example-apps.git, path: guestbook, targetRevision: HEAD }
      destination: { server: "{{server}}", namespace: guestbook }
"#;

#[tokio::test]
async fn shrinking_decision_list_deletes_only_the_dropped_cluster() {
    let h = harness();
    h.decisions.set_config_map(
        "argocd",
        "my-configmap",
        &[("apiVersion", "mallard.io/v1"), ("kind", "ducks"), ("statusListKey", "decisions"), ("matchKey", "clusterName")],
    );
    h.decisions.put_resource(json!({
        "apiVersion": "mallard.io/v1",
        "kind": "ducks",
        "metadata": { "name": "quak", "namespace": "argocd" },
        "status": { "decisions": [ { "clusterName": "cluster1" }, { "clusterName": "cluster2" }, { "clusterName": "unknown" } ] }
    }));
    h.appsets.put(appset(DUCK));
    let report = h.ctl.reconcile_now(&key()).await;
    assert_eq!(report.requeue_after, Some(Duration::from_secs(30)));
    assert_eq!(h.apps.names("argocd"), vec!["cluster1-guestbook", "cluster2-guestbook"]);
    let app = h.apps.all().into_iter().find(|a| a.name() == "cluster2-guestbook").unwrap();
    assert_eq!(app.spec.destination.server.as_deref(), Some("https://cluster2.example.com"));

    assert!(h.decisions.set_status_list("argocd", "quak", "decisions", json!([{ "clusterName": "cluster1" }])));
    let before = h.apps.calls();
    h.ctl.reconcile_now(&key()).await;
    assert_eq!(h.apps.names("argocd"), vec!["cluster1-guestbook"]);
    let after = h.apps.calls();
    assert_eq!((after.deletes - before.deletes, after.creates - before.creates, after.updates - before.updates), (1, 0, 0));
}

const CLUSTERS: &str = r#"
metadata: { name: guestbook, namespace: argocd }
spec:
  generators:
    - clusters:
        selector:
          matchExpressions:
            - { key: env, operator: In, values: [prod, staging] }
  template:
    metadata: { name: "{{name}}-guestbook" }
    spec:
      project: default
      destination: { server: "{{server}}", namespace: guestbook }
"#;

#[tokio::test]
async fn dropped_cluster_loses_its_application() {
    let h = harness();
    h.appsets.put(appset(CLUSTERS));
    h.ctl.reconcile_now(&key()).await;
    assert_eq!(h.apps.names("argocd"), vec!["cluster1-guestbook", "cluster2-guestbook"]);

    h.clusters.publish(Arc::new(ClusterSnapshot::new(2, vec![cluster("cluster1", "prod"), cluster("cluster3", "dev")])));
    h.ctl.reconcile_now(&key()).await;
    assert_eq!(h.apps.names("argocd"), vec!["cluster1-guestbook"]);
}

const MERGE: &str = r#"
metadata: { name: guestbook, namespace: argocd }
spec:
  generators:
    - merge:
        mergeKeys: [name]
        generators:
          - list:
              elements:
                - { name: c1, size: small }
                - { name: c2, size: small }
                - { name: c3, size: small }
          - list:
              elements:
                - { name: c2, size: large }
                - { name: c9, size: huge }
  template:
    metadata: { name: "{{name}}-app" }
    spec:
      project: default
      source: { repoURL: https://github.com/argoproj/argocd-example-apps.git, path: "sizes/{{size}}" }
      destination: { server: https://kubernetes.default.svc, namespace: "{{name}}" }
"#;

#[tokio::test]
async fn merge_keeps_base_cardinality_and_applies_overrides() {
    let h = harness();
    h.appsets.put(appset(MERGE));
    h.ctl.reconcile_now(&key()).await;
    assert_eq!(h.apps.names("argocd"), vec!["c1-app", "c2-app", "c3-app"]);
    let path = |n: &str| {
        h.apps.all().into_iter().find(|a| a.name() == n).and_then(|a| a.spec.source).and_then(|s| s.path)
    };
    assert_eq!(path("c1-app").as_deref(), Some("sizes/small"));
    assert_eq!(path("c2-app").as_deref(), Some("sizes/large"));
}

#[tokio::test]
async fn unreachable_repo_leaves_applications_untouched() {
    let h = harness();
    h.appsets.put(appset(MATRIX_LIST_GIT));
    h.ctl.reconcile_now(&key()).await;
    let before = h.apps.calls();

    h.repos.remove(REPO, "HEAD");
    let report = h.ctl.reconcile_now(&key()).await;
    assert!(matches!(report.outcome, Outcome::Failed(appset_core::Error::SourceUnavailable { .. })));
    assert_eq!(report.requeue_after, Some(ControllerConfig::default().error_requeue));
    assert_eq!(h.apps.calls(), before);
    assert_eq!(h.apps.names("argocd").len(), 6);
    assert_eq!(condition(&h, ConditionType::ErrorOccurred), Some(ConditionStatus::True));
    assert_eq!(condition(&h, ConditionType::ParametersGenerated), Some(ConditionStatus::False));
}

#[tokio::test]
async fn unresolved_placeholder_is_not_retried() {
    let h = harness();
    h.appsets.put(appset(&MATRIX_LIST_GIT.replace("{{cluster}}-{{path.basename}}", "{{values.missing}}-{{path.basename}}")));
    let report = h.ctl.reconcile_now(&key()).await;
    assert!(matches!(report.outcome, Outcome::Failed(appset_core::Error::UnresolvedParameter { .. })));
    assert_eq!(report.requeue_after, None);
    assert!(h.apps.names("argocd").is_empty());
    let err = h.appsets.conditions(&key()).into_iter().find(|c| c.type_ == ConditionType::ErrorOccurred).unwrap();
    assert_eq!(err.reason, "RenderTemplateParamsError");
}

#[tokio::test]
async fn exhausted_writes_requeue_at_fallback_interval() {
    let h = harness();
    h.appsets.put(appset(MATRIX_LIST_GIT));
    h.apps.inject_failures(100);
    let report = h.ctl.reconcile_now(&key()).await;
    assert!(matches!(report.outcome, Outcome::Synced { created: 0, failed: 6, .. }), "{:?}", report.outcome);
    assert_eq!(report.requeue_after, Some(ControllerConfig::default().fallback_requeue));
    assert_eq!(condition(&h, ConditionType::ResourcesUpToDate), Some(ConditionStatus::False));
}
