//! Cluster generator over the registered cluster snapshot.

use appset_core::{ClusterGenerator, ClusterInfo, ClusterSnapshot, ParameterSet, Result};

use crate::{normalize_name, selector, values_object};

pub fn generate(g: &ClusterGenerator, clusters: &ClusterSnapshot) -> Result<Vec<ParameterSet>> {
    let mut out = Vec::new();
    for c in &clusters.clusters {
        if selector::matches(&g.selector, &c.labels)? {
            let mut set = cluster_params(c);
            if !g.values.is_empty() {
                set = set.with("values", values_object(&g.values));
            }
            out.push(set);
        }
    }
    Ok(out)
}

/// Parameters describing one cluster; shared with the decision generator.
pub fn cluster_params(c: &ClusterInfo) -> ParameterSet {
    let mut set = ParameterSet::new()
        .with("name", c.name.as_str())
        .with("nameNormalized", normalize_name(&c.name))
        .with("server", c.server.as_str());
    for (k, v) in &c.labels {
        set = set.with(format!("metadata.labels.{k}"), v.as_str());
    }
    for (k, v) in &c.annotations {
        set = set.with(format!("metadata.annotations.{k}"), v.as_str());
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

    fn snapshot() -> ClusterSnapshot {
        let mk = |name: &str, env: &str| ClusterInfo {
            name: name.into(),
            server: format!("https://{name}.example.com"),
            labels: [("env".to_string(), env.to_string())].into_iter().collect(),
            annotations: Default::default(),
        };
        ClusterSnapshot::new(1, vec![mk("staging", "stage"), mk("prod-a", "prod"), mk("Prod_B", "prod")])
    }

    #[test]
    fn empty_selector_lists_all_sorted() {
        let out = generate(&ClusterGenerator::default(), &snapshot()).unwrap();
        let names: Vec<_> = out.iter().filter_map(|p| p.get_string("name")).collect();
        assert_eq!(names, vec!["Prod_B", "prod-a", "staging"]);
        assert_eq!(out[0].get_string("nameNormalized").as_deref(), Some("prod-b"));
        assert_eq!(out[0].get_string("metadata.labels.env").as_deref(), Some("prod"));
    }

    #[test]
    fn selector_filters_on_secret_labels() {
        let g = ClusterGenerator {
            selector: LabelSelector { match_labels: Some([("env".to_string(), "prod".to_string())].into_iter().collect()), ..Default::default() },
            values: [("tier".to_string(), "gold".to_string())].into_iter().collect(),
        };
        let out = generate(&g, &snapshot()).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|p| p.get_string("values.tier").as_deref() == Some("gold")));
        assert_eq!(out[1].get_string("server").as_deref(), Some("https://prod-a.example.com"));
    }
}
