//! Parameter sets produced by generators and consumed by the template renderer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::error::{Error, Result};

/// Immutable mapping of parameter keys to JSON values.
///
/// Keys are either flat dotted names (`path.basename`) or hold nested
/// objects (`values: {name: ..}`); [`ParameterSet::get_path`] resolves both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet {
    entries: BTreeMap<String, Json>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_object(obj: &Map<String, Json>) -> Self {
        Self { entries: obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect() }
    }

    /// Returns a new set with `key` set to `value`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Json>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Json)> {
        self.entries.iter()
    }

    pub fn get(&self, key: &str) -> Option<&Json> {
        self.entries.get(key)
    }

    /// Resolve a dotted key: exact key first, then the longest flat prefix
    /// holding an object, walking the remaining segments.
    pub fn get_path(&self, path: &str) -> Option<&Json> {
        if let Some(v) = self.entries.get(path) {
            return Some(v);
        }
        let segs: Vec<&str> = path.split('.').collect();
        for split in (1..segs.len()).rev() {
            let head = segs[..split].join(".");
            if let Some(root) = self.entries.get(&head) {
                if let Some(v) = walk(root, &segs[split..]) {
                    return Some(v);
                }
            }
        }
        None
    }

    /// Scalar rendering of [`ParameterSet::get_path`].
    pub fn get_string(&self, path: &str) -> Option<String> {
        self.get_path(path).map(render_value)
    }

    /// Flattened `dotted.key -> string` view used by label selectors.
    /// Arrays are not addressable and are skipped.
    pub fn label_view(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (k, v) in &self.entries {
            flatten_into(k, v, &mut out);
        }
        out
    }

    /// Union of two sets where any shared leaf is an error. Nested objects
    /// under the same key are merged recursively.
    pub fn merge_strict(&self, other: &ParameterSet) -> Result<ParameterSet> {
        let mut entries = self.entries.clone();
        for (k, v) in &other.entries {
            match entries.get_mut(k) {
                None => {
                    entries.insert(k.clone(), v.clone());
                }
                Some(existing) => merge_strict_value(existing, v, k)?,
            }
        }
        Ok(Self { entries })
    }

    /// Union of two sets where `other` wins on shared leaves.
    pub fn merge_override(&self, other: &ParameterSet) -> ParameterSet {
        let mut entries = self.entries.clone();
        for (k, v) in &other.entries {
            match entries.get_mut(k) {
                Some(existing) => merge_override_value(existing, v),
                None => {
                    entries.insert(k.clone(), v.clone());
                }
            }
        }
        Self { entries }
    }
}

impl FromIterator<(String, Json)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (String, Json)>>(iter: I) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

/// Render a parameter value as template text.
pub fn render_value(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        Json::Bool(b) => b.to_string(),
        Json::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn walk<'a>(mut cur: &'a Json, segs: &[&str]) -> Option<&'a Json> {
    for seg in segs {
        cur = cur.as_object()?.get(*seg)?;
    }
    Some(cur)
}

fn flatten_into(prefix: &str, v: &Json, out: &mut BTreeMap<String, String>) {
    match v {
        Json::Object(map) => {
            for (k, child) in map {
                flatten_into(&format!("{prefix}.{k}"), child, out);
            }
        }
        Json::Array(_) => {}
        scalar => {
            out.insert(prefix.to_string(), render_value(scalar));
        }
    }
}

fn merge_strict_value(existing: &mut Json, incoming: &Json, path: &str) -> Result<()> {
    match (existing, incoming) {
        (Json::Object(dst), Json::Object(src)) => {
            for (k, v) in src {
                let child = format!("{path}.{k}");
                match dst.get_mut(k) {
                    None => {
                        dst.insert(k.clone(), v.clone());
                    }
                    Some(cur) => merge_strict_value(cur, v, &child)?,
                }
            }
            Ok(())
        }
        _ => Err(Error::AmbiguousParameterKey(path.to_string())),
    }
}

fn merge_override_value(existing: &mut Json, incoming: &Json) {
    match (existing, incoming) {
        (Json::Object(dst), Json::Object(src)) => {
            for (k, v) in src {
                match dst.get_mut(k) {
                    Some(cur) => merge_override_value(cur, v),
                    None => {
                        dst.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (slot, v) => *slot = v.clone(),
    }
}
