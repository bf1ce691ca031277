//! Cluster decision resource (duck-typed) generator.
//!
//! A config map in the ApplicationSet namespace declares where decisions
//! live (`apiVersion`, `kind`, `statusListKey`, `matchKey`). The matching
//! resource's `status.<statusListKey>` list is read through a
//! [`DecisionSource`] adapter and each entry is joined with the cluster
//! snapshot on `entry[matchKey] == cluster.name`.

use std::collections::BTreeMap;
use std::sync::Arc;

use appset_core::{ClusterSnapshot, DuckTypeGenerator, Error, ParameterSet, Result};
use serde_json::Value as Json;
use tracing::{debug, warn};

use crate::cluster::cluster_params;
use crate::{values_object, DecisionReader, GeneratorContext, ResourceQuery};

pub const DEFAULT_MATCH_KEY: &str = "clusterName";
pub const STATUS_LIST_ADAPTER: &str = "statusList";

/// Decision resource layout read from the config map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionSchema {
    pub api_version: String,
    pub kind: String,
    pub status_list_key: String,
    pub match_key: String,
    pub adapter: String,
}

impl DecisionSchema {
    pub fn from_config_map(data: &BTreeMap<String, String>) -> Result<Self> {
        let need = |k: &str| {
            data.get(k)
                .filter(|v| !v.trim().is_empty())
                .cloned()
                .ok_or_else(|| Error::invalid(format!("decision config map is missing '{k}'")))
        };
        Ok(Self {
            api_version: need("apiVersion")?,
            kind: need("kind")?,
            status_list_key: need("statusListKey")?,
            match_key: data.get("matchKey").cloned().unwrap_or_else(|| DEFAULT_MATCH_KEY.to_string()),
            adapter: data.get("adapter").cloned().unwrap_or_else(|| STATUS_LIST_ADAPTER.to_string()),
        })
    }
}

/// Capability interface over one known decision layout.
#[async_trait::async_trait]
pub trait DecisionSource: Send + Sync {
    /// Raw decision entries; scalar fields only.
    async fn list_entries(&self) -> Result<Vec<ParameterSet>>;
}

/// Reads `status.<key>` as a list of objects from every matching resource.
pub struct StatusListSource {
    reader: Arc<dyn DecisionReader>,
    query: ResourceQuery,
    status_list_key: String,
}

impl StatusListSource {
    pub fn new(reader: Arc<dyn DecisionReader>, query: ResourceQuery, status_list_key: impl Into<String>) -> Self {
        Self { reader, query, status_list_key: status_list_key.into() }
    }
}

#[async_trait::async_trait]
impl DecisionSource for StatusListSource {
    async fn list_entries(&self) -> Result<Vec<ParameterSet>> {
        let objects = self.reader.list_resources(&self.query).await?;
        let mut out = Vec::new();
        for obj in &objects {
            let list = obj.get("status").and_then(|s| s.get(&self.status_list_key));
            let Some(items) = list.and_then(Json::as_array) else {
                debug!(kind = %self.query.kind, key = %self.status_list_key, "decision: status list absent");
                continue;
            };
            for item in items {
                if let Some(map) = item.as_object() {
                    out.push(map.iter().filter(|(_, v)| !v.is_object() && !v.is_array()).map(|(k, v)| (k.clone(), v.clone())).collect());
                }
            }
        }
        Ok(out)
    }
}

/// Pick the adapter declared by the schema.
pub fn source_for(schema: &DecisionSchema, reader: Arc<dyn DecisionReader>, query: ResourceQuery) -> Result<Box<dyn DecisionSource>> {
    match schema.adapter.as_str() {
        STATUS_LIST_ADAPTER => Ok(Box::new(StatusListSource::new(reader, query, schema.status_list_key.clone()))),
        other => Err(Error::invalid(format!("unknown decision adapter '{other}'"))),
    }
}

pub async fn generate(g: &DuckTypeGenerator, ctx: &GeneratorContext) -> Result<Vec<ParameterSet>> {
    if g.name.is_none() && g.label_selector.is_none() {
        return Err(Error::invalid("clusterDecisionResource needs name or labelSelector"));
    }
    let data = ctx.decisions.get_config_map(&ctx.namespace, &g.config_map_ref).await?;
    let schema = DecisionSchema::from_config_map(&data)?;
    let query = ResourceQuery {
        api_version: schema.api_version.clone(),
        kind: schema.kind.clone(),
        namespace: ctx.namespace.clone(),
        name: g.name.clone(),
        label_selector: g.label_selector.clone(),
    };
    let entries = source_for(&schema, Arc::clone(&ctx.decisions), query)?.list_entries().await?;
    Ok(join_clusters(entries, &schema.match_key, &ctx.clusters, g))
}

fn join_clusters(entries: Vec<ParameterSet>, match_key: &str, clusters: &ClusterSnapshot, g: &DuckTypeGenerator) -> Vec<ParameterSet> {
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(wanted) = entry.get_string(match_key) else {
            warn!(match_key, "decision: entry without match key skipped");
            continue;
        };
        let Some(cluster) = clusters.by_name(&wanted) else {
            warn!(cluster = %wanted, "decision: unknown cluster skipped");
            continue;
        };
        let mut set = entry.merge_override(&cluster_params(cluster));
        if !g.values.is_empty() {
            set = set.with("values", values_object(&g.values));
        }
        out.push(set);
    }
    out
}
