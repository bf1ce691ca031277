use std::collections::HashMap;

use appset_core::{Error, ParameterSet, Result};
use serde_json::Value as Json;

/// Join later children onto the first (base) child by the values of
/// `merge_keys`. Later children override base keys; base cardinality and
/// order are kept.
pub fn combine(children: Vec<Vec<ParameterSet>>, merge_keys: &[String]) -> Result<Vec<ParameterSet>> {
    if children.len() < 2 {
        return Err(Error::invalid(format!("merge needs at least 2 child generators, got {}", children.len())));
    }
    if merge_keys.is_empty() {
        return Err(Error::invalid("merge needs at least one merge key"));
    }
    let mut iter = children.into_iter();
    let mut base = iter.next().unwrap_or_default();
    index_by_key(&base, merge_keys)?;
    for child in iter {
        let index = index_by_key(&child, merge_keys)?;
        base = base
            .into_iter()
            .map(|set| match index.get(&merge_key(&set, merge_keys)) {
                Some(i) => set.merge_override(&child[*i]),
                None => set,
            })
            .collect();
    }
    Ok(base)
}

fn merge_key(set: &ParameterSet, keys: &[String]) -> String {
    let values: Vec<Json> = keys.iter().map(|k| set.get_path(k).cloned().unwrap_or(Json::Null)).collect();
    Json::Array(values).to_string()
}

fn index_by_key(sets: &[ParameterSet], keys: &[String]) -> Result<HashMap<String, usize>> {
    let mut index = HashMap::with_capacity(sets.len());
    for (i, set) in sets.iter().enumerate() {
        let key = merge_key(set, keys);
        if index.insert(key.clone(), i).is_some() {
            return Err(Error::NonUniqueMergeKey(key));
        }
    }
    Ok(index)
}
