use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kube::{core::ApiResource, Client};
use synk_core::{ClusterAccessor, SyncKey};
use synk_kubehub::KubeAccessor;
use synk_queue::{spawn_dispatcher, spawn_resync, DispatchConfig, RetryPolicy};
use synk_reconcile::{KindRegistry, KindSpec, ReconcileConfig, Reconciler};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "synk8s", version, about = "Mirror a namespaced kind from one cluster into another")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Source kubeconfig (default: KUBECONFIG / ~/.kube/config / in-cluster)
    #[arg(long, env = "SYNK_SOURCE", global = true)]
    source: Option<PathBuf>,

    /// Context to use from the source kubeconfig
    #[arg(long, env = "SYNK_SOURCE_CONTEXT", global = true)]
    source_context: Option<String>,

    /// Destination kubeconfig (default: KUBECONFIG / ~/.kube/config / in-cluster)
    #[arg(long, env = "SYNK_DEST", global = true)]
    dest: Option<PathBuf>,

    /// Context to use from the destination kubeconfig
    #[arg(long, env = "SYNK_DEST_CONTEXT", global = true)]
    dest_context: Option<String>,

    /// Only mirror objects in this namespace (default: all namespaces)
    #[arg(long = "namespace", short = 'n', env = "SYNK_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// GVK key, e.g. "v1/Secret" or "apps/v1/Deployment"
    #[arg(long, env = "SYNK_KIND", global = true, default_value = "v1/Secret")]
    kind: String,

    /// Comma-separated top-level payload fields to mirror instead of the kind's default
    #[arg(long, env = "SYNK_FIELDS", global = true, value_delimiter = ',')]
    fields: Option<Vec<String>>,

    /// Version conflicts retried within one pass
    #[arg(long, env = "SYNK_CONFLICT_RETRIES", global = true, default_value_t = 3)]
    conflict_retries: u32,

    /// Prometheus listener, host:port
    #[arg(long, env = "SYNK_METRICS_ADDR", global = true)]
    metrics_addr: Option<String>,

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
    /// Watch the source and keep the destination converged until Ctrl-C
    Run {
        /// Concurrent reconcile passes
        #[arg(long, env = "SYNK_WORKERS", default_value_t = 4)]
        workers: usize,
        /// Upper bound on one pass; expiry counts as a transient failure
        #[arg(long, env = "SYNK_PASS_TIMEOUT_SECS", default_value_t = 30)]
        pass_timeout_secs: u64,
        /// Re-enqueue every known key this often (0: only at start)
        #[arg(long, env = "SYNK_RESYNC_SECS", default_value_t = 600)]
        resync_secs: u64,
        /// First retry delay for a failing key
        #[arg(long, env = "SYNK_BACKOFF_BASE_MS", default_value_t = 500)]
        backoff_base_ms: u64,
        /// Retry delay ceiling
        #[arg(long, env = "SYNK_BACKOFF_MAX_SECS", default_value_t = 300)]
        backoff_max_secs: u64,
        /// Also resync keys found only in the destination, deleting mirrors whose source is gone
        #[arg(long, env = "SYNK_PRUNE_DESTINATION", action = ArgAction::SetTrue)]
        prune_destination: bool,
    },
    /// Run a single reconcile pass for <namespace>/<name>
    Once {
        key: String,
    },
    /// List built-in kinds and the fields mirrored for each
    Kinds,
}

fn init_tracing() {
    let env = std::env::var("SYNK_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        match builder.with_http_listener(sock).install() {
            Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        }
    } else {
        warn!(addr = %addr, "invalid metrics address; expected host:port");
    }
}

struct Clusters {
    source: Arc<KubeAccessor>,
    dest: Arc<KubeAccessor>,
    source_client: Client,
    source_ar: ApiResource,
}

/// Connect to both clusters and resolve the mirrored kind on each.
async fn connect(cli: &Cli, spec: &KindSpec) -> Result<Clusters> {
    let source_client = synk_kubehub::client_for(cli.source.as_deref(), cli.source_context.as_deref())
        .await
        .context("source cluster")?;
    let dest_client = synk_kubehub::client_for(cli.dest.as_deref(), cli.dest_context.as_deref())
        .await
        .context("destination cluster")?;
    let source_ar = synk_kubehub::resolve_kind(&source_client, &spec.gvk).await.context("source cluster")?;
    let dest_ar = synk_kubehub::resolve_kind(&dest_client, &spec.gvk).await.context("destination cluster")?;
    Ok(Clusters {
        source: Arc::new(KubeAccessor::new(source_client.clone(), source_ar.clone(), "source")),
        dest: Arc::new(KubeAccessor::new(dest_client, dest_ar, "destination")),
        source_client,
        source_ar,
    })
}

fn reconciler(cli: &Cli, spec: &KindSpec, clusters: &Clusters) -> Reconciler {
    let source: Arc<dyn ClusterAccessor> = clusters.source.clone();
    Reconciler::new(spec, source, clusters.dest.clone(), clusters.dest.clone())
        .with_config(ReconcileConfig { conflict_retries: cli.conflict_retries })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    init_metrics(cli.metrics_addr.as_deref());

    let registry = KindRegistry::builtin();
    match &cli.command {
        Commands::Kinds => {
            match cli.output {
                Output::Human => {
                    println!("{:<24} FIELDS", "KIND");
                    for (kind, fields) in registry.entries() {
                        println!("{:<24} {}", kind, fields.join(", "));
                    }
                }
                Output::Json => {
                    let rows: Vec<_> = registry
                        .entries()
                        .map(|(kind, fields)| serde_json::json!({ "kind": kind, "fields": fields }))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::Once { key } => {
            let key: SyncKey = key.parse().context("expected <namespace>/<name>")?;
            let spec = registry.resolve(&cli.kind, cli.fields.as_deref())?;
            info!(key = %key, kind = %spec.gvk, "once invoked");
            let clusters = connect(&cli, &spec).await?;
            let outcome = reconciler(&cli, &spec, &clusters).reconcile_key(&key).await;
            match cli.output {
                Output::Human => match &outcome {
                    Ok(status) => println!("{} {}", key, status.as_str()),
                    Err(e) => eprintln!("{} failed: {}", key, e),
                },
                Output::Json => {
                    let row = match &outcome {
                        Ok(status) => serde_json::json!({ "key": key.to_string(), "status": status }),
                        Err(e) => serde_json::json!({
                            "key": key.to_string(),
                            "error": e.to_string(),
                            "class": e.class().as_str(),
                        }),
                    };
                    println!("{}", serde_json::to_string_pretty(&row)?);
                }
            }
            outcome.with_context(|| format!("reconcile {}", key))?;
        }
        Commands::Run { workers, pass_timeout_secs, resync_secs, backoff_base_ms, backoff_max_secs, prune_destination } => {
            let spec = registry.resolve(&cli.kind, cli.fields.as_deref())?;
            let ns = cli.namespace.clone();
            info!(kind = %spec.gvk, fields = ?spec.fields.fields(), ns = ?ns, workers, "run invoked");
            let clusters = connect(&cli, &spec).await?;
            let reconciler = Arc::new(reconciler(&cli, &spec, &clusters));

            let shutdown = CancellationToken::new();
            let cfg = DispatchConfig {
                workers: *workers,
                pass_timeout: Duration::from_secs(*pass_timeout_secs),
                retry: RetryPolicy {
                    base: Duration::from_millis(*backoff_base_ms),
                    max: Duration::from_secs(*backoff_max_secs),
                },
                ..DispatchConfig::default()
            };
            let (tx, mut dispatcher) = spawn_dispatcher(reconciler, cfg, shutdown.clone());

            let watcher_handle = tokio::spawn({
                let client = clusters.source_client.clone();
                let ar = clusters.source_ar.clone();
                let ns = ns.clone();
                let tx = tx.clone();
                async move {
                    if let Err(e) = synk_kubehub::start_watcher(client, &ar, ns.as_deref(), tx).await {
                        error!(error = ?e, "watcher failed");
                    }
                }
            });

            let source: Arc<dyn ClusterAccessor> = clusters.source.clone();
            let dest: Option<Arc<dyn ClusterAccessor>> = if *prune_destination {
                Some(clusters.dest.clone())
            } else {
                None
            };
            let period = (*resync_secs > 0).then(|| Duration::from_secs(*resync_secs));
            let resync_handle = spawn_resync(source, dest, ns, period, tx, shutdown.clone());

            let early = tokio::select! {
                _ = signal::ctrl_c() => None,
                res = &mut dispatcher => Some(res),
            };
            shutdown.cancel();
            let joined = match early {
                Some(res) => res,
                None => {
                    info!("Ctrl-C received; draining in-flight passes");
                    dispatcher.await
                }
            };
            watcher_handle.abort();
            resync_handle.abort();
            joined.context("dispatcher task")?.context("dispatcher stopped")?;
            info!("shutdown complete");
        }
    }

    Ok(())
}
