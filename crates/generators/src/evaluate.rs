//! Recursive generator tree evaluation.

use std::time::{Duration, Instant};

use appset_core::{ApplicationSet, ApplicationSetSpec, Error, GeneratorNode, GeneratorSpec, ParameterSet, Result};
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use metrics::{counter, histogram};
use tracing::{debug, warn};

use crate::{cluster, duck, git, list, matrix, merge, selector, EvalOptions, GeneratorContext, DEFAULT_POLL_REQUEUE};

/// Result of expanding an ApplicationSet's generators.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub params: Vec<ParameterSet>,
    /// Shortest polling interval declared anywhere in the tree.
    pub requeue_after: Option<Duration>,
}

/// Structural checks that do not need any external source.
pub fn validate(spec: &ApplicationSetSpec, max_depth: usize) -> Result<()> {
    if spec.generators.is_empty() {
        return Err(Error::invalid("applicationset declares no generators"));
    }
    if spec.template.metadata.name.trim().is_empty() {
        return Err(Error::invalid("template metadata.name is empty"));
    }
    for node in &spec.generators {
        let depth = node.spec.depth();
        if depth > max_depth {
            return Err(Error::invalid(format!("generator nesting depth {depth} exceeds limit {max_depth}")));
        }
        validate_node(node)?;
    }
    Ok(())
}

fn validate_node(node: &GeneratorNode) -> Result<()> {
    match &node.spec {
        GeneratorSpec::Matrix(m) if m.generators.len() < 2 => {
            Err(Error::invalid(format!("matrix needs at least 2 child generators, got {}", m.generators.len())))
        }
        GeneratorSpec::Merge(m) if m.generators.len() < 2 => {
            Err(Error::invalid(format!("merge needs at least 2 child generators, got {}", m.generators.len())))
        }
        GeneratorSpec::Merge(m) if m.merge_keys.is_empty() => Err(Error::invalid("merge needs at least one merge key")),
        GeneratorSpec::Git(g) if g.directories.is_empty() => {
            Err(Error::invalid(format!("git generator for {} lists no directories", g.repo_url)))
        }
        spec => spec.children().iter().try_for_each(validate_node),
    }
}

/// Minimum requeue interval of the polling generators in `spec`.
pub fn requeue_after(spec: &ApplicationSetSpec) -> Option<Duration> {
    spec.generators.iter().filter_map(|n| node_requeue(&n.spec)).min()
}

fn node_requeue(spec: &GeneratorSpec) -> Option<Duration> {
    match spec {
        GeneratorSpec::Git(g) => Some(g.requeue_after_seconds.map(Duration::from_secs).unwrap_or(DEFAULT_POLL_REQUEUE)),
        GeneratorSpec::ClusterDecisionResource(g) => {
            Some(g.requeue_after_seconds.map(Duration::from_secs).unwrap_or(DEFAULT_POLL_REQUEUE))
        }
        GeneratorSpec::List(_) | GeneratorSpec::Clusters(_) => None,
        GeneratorSpec::Matrix(_) | GeneratorSpec::Merge(_) => spec.children().iter().filter_map(|c| node_requeue(&c.spec)).min(),
    }
}

/// Expand every top-level generator and concatenate their outputs in
/// declaration order. Any failure fails the whole evaluation.
pub async fn evaluate(appset: &ApplicationSet, ctx: &GeneratorContext, opts: &EvalOptions) -> Result<Evaluation> {
    validate(&appset.spec, opts.max_depth)?;
    let t0 = Instant::now();
    let nested = appset.spec.apply_nested_selectors;
    let outputs = try_join_all(appset.spec.generators.iter().map(|g| eval_node(g, ctx, opts, nested, true))).await?;
    let params: Vec<ParameterSet> = outputs.into_iter().flatten().collect();
    let took = t0.elapsed();
    histogram!("appset_eval_latency_ms", took.as_secs_f64() * 1000.0);
    debug!(appset = %appset.key(), sets = params.len(), took_ms = %took.as_millis(), "generators: evaluated");
    Ok(Evaluation { params, requeue_after: requeue_after(&appset.spec) })
}

fn eval_node<'a>(
    node: &'a GeneratorNode,
    ctx: &'a GeneratorContext,
    opts: &'a EvalOptions,
    apply_nested: bool,
    top_level: bool,
) -> BoxFuture<'a, Result<Vec<ParameterSet>>> {
    async move {
        let produced = match &node.spec {
            GeneratorSpec::Matrix(m) => {
                let kids = try_join_all(m.generators.iter().map(|c| eval_node(c, ctx, opts, apply_nested, false))).await?;
                matrix::combine(kids)?
            }
            GeneratorSpec::Merge(m) => {
                let kids = try_join_all(m.generators.iter().map(|c| eval_node(c, ctx, opts, apply_nested, false))).await?;
                merge::combine(kids, &m.merge_keys)?
            }
            terminal => run_terminal(terminal, ctx, opts).await?,
        };
        match &node.selector {
            Some(sel) if top_level || apply_nested => selector::filter(produced, sel),
            _ => Ok(produced),
        }
    }
    .boxed()
}

async fn run_terminal(spec: &GeneratorSpec, ctx: &GeneratorContext, opts: &EvalOptions) -> Result<Vec<ParameterSet>> {
    let kind = spec.kind_name();
    let t0 = Instant::now();
    let call = async {
        match spec {
            GeneratorSpec::List(g) => list::generate(g),
            GeneratorSpec::Git(g) => git::generate(g, ctx.repos.as_ref()).await,
            GeneratorSpec::Clusters(g) => cluster::generate(g, &ctx.clusters),
            GeneratorSpec::ClusterDecisionResource(g) => duck::generate(g, ctx).await,
            GeneratorSpec::Matrix(_) | GeneratorSpec::Merge(_) => Err(Error::Internal(format!("{kind} is not a terminal generator"))),
        }
    };
    match tokio::time::timeout(opts.generator_timeout, call).await {
        Ok(out) => {
            histogram!("appset_generator_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => kind);
            if out.is_err() {
                counter!("appset_generator_errors_total", 1u64, "kind" => kind);
            }
            out
        }
        Err(_) => {
            let after_ms = opts.generator_timeout.as_millis() as u64;
            counter!("appset_generator_timeouts_total", 1u64, "kind" => kind);
            warn!(generator = kind, after_ms, "generators: timed out");
            Err(Error::GeneratorTimeout { generator: kind.to_string(), after_ms })
        }
    }
}
