use std::sync::Arc;

use appset_core::{ApplicationSet, ClusterInfo, ClusterSnapshot, Error};
use appset_generators::memory::{MemoryDecisionReader, MemoryRepoService};
use appset_generators::{evaluate, EvalOptions, GeneratorContext};

const REPO: &str = "https://github.com/argoproj/argocd-example-apps.git";

fn ctx() -> GeneratorContext {
    let repos = MemoryRepoService::new();
    repos.set(REPO, "HEAD", &["apps", "apps/guestbook", "apps/billing", "charts/redis"]);
    let clusters = vec![
        ClusterInfo { name: "cluster2".into(), server: "https://two".into(), ..Default::default() },
        ClusterInfo { name: "cluster1".into(), server: "https://one".into(), ..Default::default() },
    ];
    GeneratorContext {
        namespace: "argocd".into(),
        clusters: Arc::new(ClusterSnapshot::new(1, clusters)),
        repos: Arc::new(repos),
        decisions: Arc::new(MemoryDecisionReader::new()),
    }
}

fn appset(generators: &str) -> ApplicationSet {
    let yaml = format!(
        "metadata: {{ name: set, namespace: argocd }}\nspec:\n  template:\n    metadata: {{ name: x }}\n  generators:\n{generators}"
    );
    serde_yaml::from_str(&yaml).unwrap()
}

#[tokio::test]
async fn merge_nested_in_matrix() {
    let set = appset(
        r#"
    - matrix:
        generators:
          - merge:
              mergeKeys: [name]
              generators:
                - clusters: {}
                - list:
                    elements:
                      - { name: cluster1, tier: gold }
          - git:
              repoURL: https://github.com/argoproj/argocd-example-apps.git
              directories: [{ path: "apps/*" }]
"#,
    );
    let out = evaluate(&set, &ctx(), &EvalOptions::default()).await.unwrap();
    assert_eq!(out.params.len(), 4);
    let rows: Vec<(String, String, Option<String>)> = out
        .params
        .iter()
        .map(|p| (p.get_string("name").unwrap(), p.get_string("path.basename").unwrap(), p.get_string("tier")))
        .collect();
    assert_eq!(
        rows,
        vec![
            ("cluster1".into(), "billing".into(), Some("gold".into())),
            ("cluster1".into(), "guestbook".into(), Some("gold".into())),
            ("cluster2".into(), "billing".into(), None),
            ("cluster2".into(), "guestbook".into(), None),
        ]
    );
    assert!(out.requeue_after.is_some());

    let again = evaluate(&set, &ctx(), &EvalOptions::default()).await.unwrap();
    assert_eq!(again, out);
}

#[tokio::test]
async fn two_git_children_collide_on_path() {
    let set = appset(
        r#"
    - matrix:
        generators:
          - git:
              repoURL: https://github.com/argoproj/argocd-example-apps.git
              directories: [{ path: "apps/*" }]
          - git:
              repoURL: https://github.com/argoproj/argocd-example-apps.git
              directories: [{ path: "charts/*" }]
"#,
    );
    let err = evaluate(&set, &ctx(), &EvalOptions::default()).await.unwrap_err();
    assert!(matches!(err, Error::AmbiguousParameterKey(_)), "{err:?}");
}

#[tokio::test]
async fn empty_child_yields_empty_product() {
    let set = appset(
        r#"
    - matrix:
        generators:
          - list: { elements: [] }
          - clusters: {}
    - list:
        elements: [{ name: standalone }]
"#,
    );
    let out = evaluate(&set, &ctx(), &EvalOptions::default()).await.unwrap();
    assert_eq!(out.params.len(), 1);
    assert_eq!(out.params[0].get_string("name").as_deref(), Some("standalone"));
    assert_eq!(out.requeue_after, None);
}
