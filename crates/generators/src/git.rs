//! Git directory generator.

use std::time::Instant;

use appset_core::{Error, GitDirectoryItem, GitGenerator, ParameterSet, Result};
use glob::{MatchOptions, Pattern};
use serde_json::Value as Json;
use tracing::debug;

use crate::{normalize_name, values_object, RepoService};

const MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

pub async fn generate(g: &GitGenerator, repos: &dyn RepoService) -> Result<Vec<ParameterSet>> {
    let t0 = Instant::now();
    let dirs = repos.list_directories(&g.repo_url, &g.revision).await?;
    let matched = match_directories(&dirs, &g.directories)?;
    debug!(repo = %g.repo_url, revision = %g.revision, listed = dirs.len(), matched = matched.len(), took_ms = %t0.elapsed().as_millis(), "git: directories matched");
    Ok(matched.iter().map(|p| directory_params(p, g)).collect())
}

/// Paths matching at least one include item and no exclude item, sorted.
/// Patterns use shell glob rules: `*` never crosses `/`.
pub fn match_directories(paths: &[String], items: &[GitDirectoryItem]) -> Result<Vec<String>> {
    let compile = |item: &GitDirectoryItem| {
        Pattern::new(&item.path).map_err(|e| Error::invalid(format!("bad directory pattern '{}': {e}", item.path)))
    };
    let mut include = Vec::new();
    let mut exclude = Vec::new();
    for item in items {
        if item.exclude {
            exclude.push(compile(item)?);
        } else {
            include.push(compile(item)?);
        }
    }
    let mut out: Vec<String> = paths
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .filter(|p| include.iter().any(|pat| pat.matches_with(p, MATCH)))
        .filter(|p| !exclude.iter().any(|pat| pat.matches_with(p, MATCH)))
        .map(str::to_string)
        .collect();
    out.sort();
    out.dedup();
    Ok(out)
}

fn directory_params(path: &str, g: &GitGenerator) -> ParameterSet {
    let segments: Vec<&str> = path.split('/').collect();
    let basename = segments.last().copied().unwrap_or(path);
    let mut set = ParameterSet::new()
        .with("path", path)
        .with("path.basename", basename)
        .with("path.basenameNormalized", normalize_name(basename));
    for (i, seg) in segments.iter().enumerate() {
        set = set.with(format!("path[{i}]"), Json::String(seg.to_string()));
    }
    if !g.values.is_empty() {
        set = set.with("values", values_object(&g.values));
    }
    set
}
