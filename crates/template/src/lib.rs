//! ApplicationSet template renderer: `{{ dotted.key }}` substitution over an
//! Application template, one Application per parameter set.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashSet};

use appset_core::{
    Application, ApplicationSet, ApplicationSpec, ApplicationTemplate, Error, ParameterSet, Result, RESOURCES_FINALIZER,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value as Json;
use tracing::debug;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";
const BASENAME: &str = ".basename";

/// Replace every `{{ key }}` in `input`. `field` names the template field
/// for error reporting. An unterminated `{{` is copied literally.
pub fn substitute(input: &str, params: &ParameterSet, field: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find(OPEN) {
        let after = &rest[start + OPEN.len()..];
        let Some(end) = after.find(CLOSE) else {
            break;
        };
        out.push_str(&rest[..start]);
        let key = after[..end].trim();
        out.push_str(&resolve(key, params).ok_or_else(|| Error::UnresolvedParameter {
            placeholder: key.to_string(),
            field: field.to_string(),
        })?);
        rest = &after[end + CLOSE.len()..];
    }
    out.push_str(rest);
    Ok(out)
}

fn resolve(key: &str, params: &ParameterSet) -> Option<String> {
    if key.is_empty() {
        return None;
    }
    if let Some(v) = params.get_string(key) {
        return Some(v);
    }
    let base = key.strip_suffix(BASENAME)?;
    let full = params.get_string(base)?;
    Some(full.trim_end_matches('/').rsplit('/').next().unwrap_or_default().to_string())
}

fn substitute_map(map: &BTreeMap<String, String>, params: &ParameterSet, field: &str) -> Result<BTreeMap<String, String>> {
    map.iter()
        .map(|(k, v)| {
            let key = substitute(k, params, field)?;
            let value = substitute(v, params, &format!("{field}.{k}"))?;
            Ok((key, value))
        })
        .collect()
}

fn substitute_json(value: &mut Json, params: &ParameterSet, field: &str) -> Result<()> {
    match value {
        Json::String(s) => *s = substitute(s, params, field)?,
        Json::Array(items) => {
            for (i, item) in items.iter_mut().enumerate() {
                substitute_json(item, params, &format!("{field}[{i}]"))?;
            }
        }
        Json::Object(map) => {
            for (k, v) in map.iter_mut() {
                substitute_json(v, params, &format!("{field}.{k}"))?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn render_spec(spec: &ApplicationSpec, params: &ParameterSet) -> Result<ApplicationSpec> {
    let mut value = serde_json::to_value(spec).map_err(|e| Error::Internal(format!("encode template spec: {e}")))?;
    substitute_json(&mut value, params, "spec")?;
    serde_json::from_value(value).map_err(|e| Error::invalid(format!("rendered spec is not a valid application spec: {e}")))
}

/// Render one Application owned by `owner` from `template` and `params`.
pub fn render(template: &ApplicationTemplate, params: &ParameterSet, owner: &ApplicationSet) -> Result<Application> {
    let meta = &template.metadata;
    let name = substitute(&meta.name, params, "metadata.name")?;
    if name.trim().is_empty() {
        return Err(Error::invalid("rendered application name is empty"));
    }
    let namespace = match &meta.namespace {
        Some(ns) if !ns.is_empty() => substitute(ns, params, "metadata.namespace")?,
        _ => owner.namespace().to_string(),
    };
    let mut finalizers = Vec::new();
    for (i, f) in meta.finalizers.iter().flatten().enumerate() {
        finalizers.push(substitute(f, params, &format!("metadata.finalizers[{i}]"))?);
    }
    if !finalizers.iter().any(|f| f == RESOURCES_FINALIZER) {
        finalizers.push(RESOURCES_FINALIZER.to_string());
    }
    let labels = substitute_map(&meta.labels, params, "metadata.labels")?;
    let annotations = substitute_map(&meta.annotations, params, "metadata.annotations")?;

    Ok(Application {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            labels: (!labels.is_empty()).then_some(labels),
            annotations: (!annotations.is_empty()).then_some(annotations),
            finalizers: Some(finalizers),
            owner_references: Some(vec![owner.owner_reference()]),
            ..Default::default()
        },
        spec: render_spec(&template.spec, params)?,
        operation: None,
        status: None,
    })
}

/// Render every parameter set; rendered names must be unique.
pub fn render_all(owner: &ApplicationSet, params: &[ParameterSet]) -> Result<Vec<Application>> {
    let mut seen = HashSet::with_capacity(params.len());
    let mut apps = Vec::with_capacity(params.len());
    for set in params {
        let app = render(&owner.spec.template, set, owner)?;
        if !seen.insert(app.key()) {
            return Err(Error::DuplicateApplicationName(app.key().to_string()));
        }
        apps.push(app);
    }
    debug!(appset = %owner.key(), apps = apps.len(), "template: rendered");
    Ok(apps)
}
