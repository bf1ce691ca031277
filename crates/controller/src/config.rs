use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use appset_generators::EvalOptions;
use appset_reconcile::RetryConfig;
use tracing::warn;

/// Controller tuning knobs. Defaults suit a single replica; every field can
/// be overridden from `APPSET_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Worker tasks reconciling different ApplicationSets in parallel.
    pub workers: usize,
    pub generator_timeout: Duration,
    pub max_generator_depth: usize,
    /// Requeue delay after a retryable evaluation error.
    pub error_requeue: Duration,
    /// Requeue delay once Application writes exhausted their retries.
    pub fallback_requeue: Duration,
    pub write_retries: u32,
    pub git_cache_dir: PathBuf,
    /// Watched namespaces; empty means all.
    pub namespaces: Vec<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            generator_timeout: Duration::from_secs(60),
            max_generator_depth: 8,
            error_requeue: Duration::from_secs(30),
            fallback_requeue: Duration::from_secs(180),
            write_retries: 5,
            git_cache_dir: std::env::temp_dir().join("appset-git"),
            namespaces: Vec::new(),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    match lookup(name) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(var = name, value = %raw, "config: unparsable value; using default");
                default
            }
        },
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary variable source; unset or invalid entries keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let secs = |name: &str, default: Duration| Duration::from_secs(parsed(&lookup, name, default.as_secs()));
        Self {
            workers: parsed(&lookup, "APPSET_WORKERS", d.workers).max(1),
            generator_timeout: secs("APPSET_GENERATOR_TIMEOUT_SECS", d.generator_timeout),
            max_generator_depth: parsed(&lookup, "APPSET_MAX_GENERATOR_DEPTH", d.max_generator_depth).max(1),
            error_requeue: secs("APPSET_ERROR_REQUEUE_SECS", d.error_requeue),
            fallback_requeue: secs("APPSET_FALLBACK_REQUEUE_SECS", d.fallback_requeue),
            write_retries: parsed(&lookup, "APPSET_WRITE_RETRIES", d.write_retries).max(1),
            git_cache_dir: lookup("APPSET_GIT_CACHE_DIR").map(PathBuf::from).unwrap_or(d.git_cache_dir),
            namespaces: lookup("APPSET_NAMESPACES")
                .map(|s| s.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect())
                .unwrap_or_default(),
        }
    }

    pub fn eval_options(&self) -> EvalOptions {
        EvalOptions { generator_timeout: self.generator_timeout, max_depth: self.max_generator_depth }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::with_max_attempts(self.write_retries)
    }
}
