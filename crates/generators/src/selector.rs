//! Label-selector filter over parameter sets.

use std::collections::BTreeMap;

use appset_core::{Error, ParameterSet, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

/// True when `labels` satisfies every `matchLabels` pair and every
/// `matchExpressions` requirement. An empty selector matches everything.
pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> Result<bool> {
    if let Some(ml) = &selector.match_labels {
        for (k, v) in ml {
            if labels.get(k) != Some(v) {
                return Ok(false);
            }
        }
    }
    if let Some(exprs) = &selector.match_expressions {
        for req in exprs {
            if !requirement_matches(req, labels)? {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

fn requirement_matches(req: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> Result<bool> {
    let values = req.values.as_deref().unwrap_or(&[]);
    let actual = labels.get(&req.key);
    match req.operator.as_str() {
        "In" | "NotIn" if values.is_empty() => {
            Err(Error::invalid(format!("selector operator {} on '{}' needs values", req.operator, req.key)))
        }
        "In" => Ok(actual.map(|a| values.contains(a)).unwrap_or(false)),
        "NotIn" => Ok(actual.map(|a| !values.contains(a)).unwrap_or(true)),
        "Exists" => Ok(actual.is_some()),
        "DoesNotExist" => Ok(actual.is_none()),
        other => Err(Error::invalid(format!("unknown selector operator '{other}'"))),
    }
}

/// Keep the sets whose flattened label view satisfies `selector`.
pub fn filter(sets: Vec<ParameterSet>, selector: &LabelSelector) -> Result<Vec<ParameterSet>> {
    let mut out = Vec::with_capacity(sets.len());
    for set in sets {
        if matches(selector, &set.label_view())? {
            out.push(set);
        }
    }
    Ok(out)
}

/// `k=v,k2 in (a,b)` rendering for logs and list calls.
pub fn to_query(selector: &LabelSelector) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(ml) = &selector.match_labels {
        parts.extend(ml.iter().map(|(k, v)| format!("{k}={v}")));
    }
    for req in selector.match_expressions.iter().flatten() {
        let vals = req.values.as_deref().unwrap_or(&[]).join(",");
        parts.push(match req.operator.as_str() {
            "In" => format!("{} in ({vals})", req.key),
            "NotIn" => format!("{} notin ({vals})", req.key),
            "Exists" => req.key.clone(),
            "DoesNotExist" => format!("!{}", req.key),
            op => format!("{} {op} ({vals})", req.key),
        });
    }
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sel(v: serde_json::Value) -> LabelSelector {
        serde_json::from_value(v).unwrap()
    }

    fn sets() -> Vec<ParameterSet> {
        ["cluster1", "cluster2"]
            .iter()
            .map(|n| ParameterSet::new().with("cluster", "c").with("values", json!({ "name": n })))
            .collect()
    }

    #[test]
    fn match_labels_uses_dotted_paths() {
        let out = filter(sets(), &sel(json!({ "matchLabels": { "values.name": "cluster1" } }))).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get_string("values.name").as_deref(), Some("cluster1"));
    }

    #[test]
    fn expressions_in_notin_exists() {
        let s = sel(json!({ "matchExpressions": [
            { "key": "values.name", "operator": "In", "values": ["cluster1", "cluster3"] },
            { "key": "cluster", "operator": "Exists" },
            { "key": "missing", "operator": "DoesNotExist" }
        ]}));
        assert_eq!(filter(sets(), &s).unwrap().len(), 1);

        let s = sel(json!({ "matchExpressions": [{ "key": "values.name", "operator": "NotIn", "values": ["cluster1"] }] }));
        let out = filter(sets(), &s).unwrap();
        assert_eq!(out[0].get_string("values.name").as_deref(), Some("cluster2"));
    }

    #[test]
    fn empty_selector_keeps_everything_in_order() {
        let out = filter(sets(), &LabelSelector::default()).unwrap();
        assert_eq!(out, sets());
    }

    #[test]
    fn bad_operator_is_invalid_spec() {
        let s = sel(json!({ "matchExpressions": [{ "key": "a", "operator": "Gt", "values": ["1"] }] }));
        assert!(matches!(filter(sets(), &s), Err(Error::InvalidSpec(_))));
    }

    #[test]
    fn query_string() {
        let s = sel(json!({ "matchLabels": { "env": "prod" }, "matchExpressions": [{ "key": "tier", "operator": "Exists" }] }));
        assert_eq!(to_query(&s), "env=prod,tier");
    }
}
