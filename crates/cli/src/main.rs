use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kube::CustomResourceExt;
use meshsplit_controller::ControllerConfig;
use meshsplit_core::{build_virtual_service, Scheme, TrafficSplit};
use meshsplit_kubehub::KubeStore;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "meshsplitctl", version, about = "TrafficSplit to VirtualService controller")]
struct Cli {
    /// Output format for printed manifests
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Yaml)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Yaml, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller against the current cluster until interrupted
    Run(RunArgs),
    /// Print the TrafficSplit CustomResourceDefinition
    Crd,
    /// Print the VirtualService derived from a TrafficSplit manifest ("-" reads stdin)
    Render {
        file: PathBuf,
        /// Namespace to assume when the manifest has none
        #[arg(long = "ns", default_value = "default")]
        namespace: String,
    },
}

#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// Watch a single namespace (default: all namespaces)
    #[arg(long = "ns")]
    namespace: Option<String>,
    /// Maximum concurrent reconciles
    #[arg(long)]
    concurrency: Option<usize>,
    /// Notification channel capacity
    #[arg(long = "queue-cap")]
    queue_cap: Option<usize>,
    /// First retry delay in milliseconds
    #[arg(long = "backoff-base-ms")]
    backoff_base_ms: Option<u64>,
    /// Retry delay ceiling in seconds
    #[arg(long = "backoff-max-secs")]
    backoff_max_secs: Option<u64>,
    /// Serve Prometheus metrics on host:port
    #[arg(long = "metrics-addr", env = "MESHSPLIT_METRICS_ADDR")]
    metrics_addr: Option<String>,
    /// Skip the startup check that both kinds are served
    #[arg(long = "skip-preflight")]
    skip_preflight: bool,
}

impl RunArgs {
    /// Layer flags over `base` (normally the env-derived config).
    fn apply(&self, mut base: ControllerConfig) -> ControllerConfig {
        if let Some(ns) = &self.namespace {
            base.namespace = Some(ns.clone());
        }
        if let Some(n) = self.concurrency {
            base.concurrency = n.max(1);
        }
        if let Some(n) = self.queue_cap {
            base.queue_cap = n.max(1);
        }
        if let Some(ms) = self.backoff_base_ms {
            base.backoff_base = Duration::from_millis(ms);
        }
        if let Some(secs) = self.backoff_max_secs {
            base.backoff_max = Duration::from_secs(secs);
        }
        base
    }
}

fn init_tracing() {
    let env = std::env::var("MESHSPLIT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        match builder.with_http_listener(sock).install() {
            Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
        }
    } else {
        tracing::warn!(addr = %addr, "invalid MESHSPLIT_METRICS_ADDR; expected host:port");
    }
}

fn print<T: serde::Serialize>(output: Output, value: &T) -> Result<()> {
    match output {
        Output::Yaml => print!("{}", serde_yaml::to_string(value)?),
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn read_manifest(file: &Path) -> Result<String> {
    if file.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))
    }
}

/// Parse a TrafficSplit manifest and return its derived VirtualService.
fn render(manifest: &str, namespace: &str) -> Result<meshsplit_core::VirtualService> {
    let mut split: TrafficSplit = serde_yaml::from_str(manifest).context("parsing TrafficSplit manifest")?;
    if split.metadata.name.is_none() {
        anyhow::bail!("TrafficSplit manifest has no metadata.name");
    }
    split.metadata.namespace.get_or_insert_with(|| namespace.to_string());
    Ok(build_virtual_service(&split))
}

async fn run(args: RunArgs) -> Result<()> {
    init_metrics(args.metrics_addr.as_deref());
    let config = args.apply(ControllerConfig::from_env());
    info!(?config, "starting controller");

    let scheme = Scheme::traffic_split();
    let store = KubeStore::try_default(scheme.clone())
        .await?
        .with_namespace(config.namespace.clone())
        .with_feed_capacity(config.queue_cap);
    if !args.skip_preflight {
        meshsplit_kubehub::preflight(store.client().clone(), &scheme).await?;
    }
    meshsplit_controller::operator::run(Arc::new(store), config).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await?,
        Commands::Crd => print(cli.output, &TrafficSplit::crd())?,
        Commands::Render { file, namespace } => {
            let vs = render(&read_manifest(&file)?, &namespace)?;
            print(cli.output, &vs)?;
        }
    }
    Ok(())
}
