use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use appset_controller::{spawn_event_trigger, Collaborators, Controller, ControllerConfig, TriggerSource};
use appset_core::{ApplicationSet, ClusterInfo, ClusterSnapshot, ObjectEvent};
use appset_generators::{memory::MemoryDecisionReader, GeneratorContext};
use appset_kubehub::{GitRepoService, KubeAppSetStore, KubeApplicationStore, KubeDecisionReader};
use appset_store::{spawn_cluster_ingest, ClusterRegistry};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "appsetctl", version, about = "ApplicationSet controller and generator tooling")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller against the current kube context
    Run {
        /// Worker tasks (overrides APPSET_WORKERS)
        #[arg(long)]
        workers: Option<usize>,
        /// Namespace to watch; repeatable (overrides APPSET_NAMESPACES)
        #[arg(long = "ns")]
        namespaces: Vec<String>,
        /// Namespace holding cluster registration secrets
        #[arg(long = "secret-ns", env = "APPSET_SECRET_NAMESPACE", default_value = "argocd")]
        secret_namespace: String,
        /// Decision resource to watch; repeatable, e.g.
        /// "cluster.open-cluster-management.io/v1beta1/PlacementDecision"
        #[arg(long = "decision-gvk")]
        decision_gvks: Vec<String>,
    },
    /// Expand an ApplicationSet file offline and print the Applications it renders
    Render {
        /// ApplicationSet YAML
        #[arg(long, short = 'f')]
        file: PathBuf,
        /// YAML list of clusters ({name, server, labels, annotations})
        #[arg(long)]
        clusters: Option<PathBuf>,
    },
    /// Check an ApplicationSet file without reading any source
    Validate {
        #[arg(long, short = 'f')]
        file: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("APPSET_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("APPSET_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid APPSET_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_appset(path: &Path) -> Result<ApplicationSet> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing ApplicationSet {}", path.display()))
}

fn load_clusters(path: Option<&Path>) -> Result<Vec<ClusterInfo>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing cluster list {}", path.display()))
}

/// Watch with `start`, feeding a trigger task of kind `source`.
fn spawn_watch<F>(ctl: &Arc<Controller>, source: TriggerSource, what: String, start: impl FnOnce(mpsc::Sender<ObjectEvent>) -> F) -> Vec<JoinHandle<()>>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1024);
    let trigger = spawn_event_trigger(Arc::clone(ctl), source, rx);
    let watch = start(tx);
    let watcher = tokio::spawn(async move {
        if let Err(e) = watch.await {
            error!(watch = %what, error = ?e, "watcher failed");
        }
    });
    vec![watcher, trigger]
}

async fn run(config: ControllerConfig, secret_namespace: String, decision_gvks: Vec<String>) -> Result<()> {
    let client = appset_kubehub::client().await?;
    let registry = ClusterRegistry::new();
    let cluster_tx = spawn_cluster_ingest(registry.clone(), 1024);
    let deps = Collaborators {
        appsets: Arc::new(KubeAppSetStore::new(client.clone(), config.namespaces.clone())),
        apps: Arc::new(KubeApplicationStore::new(client.clone())),
        repos: Arc::new(GitRepoService::new(config.git_cache_dir.clone())),
        decisions: Arc::new(KubeDecisionReader::new(client.clone())),
        clusters: registry,
    };
    let ctl = Arc::new(Controller::new(config, deps));

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn({
        let client = client.clone();
        async move {
            if let Err(e) = appset_kubehub::watch_cluster_secrets(client, &secret_namespace, cluster_tx).await {
                error!(error = ?e, "cluster secret watcher failed");
            }
        }
    }));

    let scopes: Vec<Option<String>> = match ctl.config().namespaces.as_slice() {
        [] => vec![None],
        list => list.iter().cloned().map(Some).collect(),
    };
    for ns in scopes {
        for (source, ar) in [
            (TriggerSource::ApplicationSet, appset_kubehub::applicationset_resource()),
            (TriggerSource::Application, appset_kubehub::application_resource()),
        ] {
            let (client, ns) = (client.clone(), ns.clone());
            let what = format!("{}@{}", ar.kind, ns.as_deref().unwrap_or("*"));
            tasks.extend(spawn_watch(&ctl, source, what, move |tx| async move {
                appset_kubehub::start_watcher(client, &ar, ns.as_deref(), tx).await
            }));
        }
        for gvk in &decision_gvks {
            let (client, ns, gvk) = (client.clone(), ns.clone(), gvk.clone());
            let what = format!("{gvk}@{}", ns.as_deref().unwrap_or("*"));
            tasks.extend(spawn_watch(&ctl, TriggerSource::DecisionResource, what, move |tx| async move {
                appset_kubehub::start_discovered_watcher(client, &gvk, ns.as_deref(), tx).await
            }));
        }
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "waiting for Ctrl-C failed");
        }
        info!("Ctrl-C received; stopping controller");
    };
    let result = Arc::clone(&ctl).run(shutdown).await;
    for t in tasks {
        t.abort();
    }
    result.map_err(Into::into)
}

async fn render(file: &Path, clusters: Option<&Path>, output: Output) -> Result<()> {
    let appset = load_appset(file)?;
    let config = ControllerConfig::from_env();
    let ctx = GeneratorContext {
        namespace: appset.namespace().to_string(),
        clusters: Arc::new(ClusterSnapshot::new(0, load_clusters(clusters)?)),
        repos: Arc::new(GitRepoService::new(config.git_cache_dir.clone())),
        decisions: Arc::new(MemoryDecisionReader::new()),
    };
    let evaluation = appset_generators::evaluate(&appset, &ctx, &config.eval_options()).await?;
    let apps = appset_template::render_all(&appset, &evaluation.params)?;
    info!(appset = %appset.key(), params = evaluation.params.len(), apps = apps.len(), "render complete");
    match output {
        Output::Human => {
            println!("{:<40} {:<16} {:<40} PATH", "NAME", "NAMESPACE", "DESTINATION");
            for app in &apps {
                let dest = &app.spec.destination;
                let target = dest.server.as_deref().or(dest.name.as_deref()).unwrap_or("-");
                let target = format!("{}/{}", target, dest.namespace.as_deref().unwrap_or("-"));
                let path = app.spec.source.as_ref().and_then(|s| s.path.as_deref()).unwrap_or("-");
                println!("{:<40} {:<16} {:<40} {}", app.name(), app.namespace(), target, path);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&apps)?),
    }
    Ok(())
}

fn validate(file: &Path, output: Output) -> Result<()> {
    let appset = load_appset(file)?;
    let config = ControllerConfig::from_env();
    let verdict = appset_generators::validate(&appset.spec, config.max_generator_depth);
    let depth = appset.spec.generators.iter().map(|g| g.spec.depth()).max().unwrap_or(0);
    match output {
        Output::Human => match &verdict {
            Ok(()) => println!("{}: valid ({} generators, depth {})", appset.key(), appset.spec.generators.len(), depth),
            Err(e) => eprintln!("{}: {}", appset.key(), e),
        },
        Output::Json => {
            let body = serde_json::json!({
                "applicationSet": appset.key().to_string(),
                "valid": verdict.is_ok(),
                "depth": depth,
                "error": verdict.as_ref().err().map(ToString::to_string),
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }
    verdict.map_err(Into::into)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { workers, namespaces, secret_namespace, decision_gvks } => {
            let mut config = ControllerConfig::from_env();
            if let Some(w) = workers {
                config.workers = w.max(1);
            }
            if !namespaces.is_empty() {
                config.namespaces = namespaces;
            }
            info!(workers = config.workers, namespaces = ?config.namespaces, decision_gvks = ?decision_gvks, "run invoked");
            run(config, secret_namespace, decision_gvks).await
        }
        Commands::Render { file, clusters } => render(&file, clusters.as_deref(), cli.output).await,
        Commands::Validate { file } => validate(&file, cli.output),
    }
}
