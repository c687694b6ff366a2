use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use hsync_core::{HarborRobotAccount, HarborSync, MetricsSink, RecorderSink};
use hsync_harbor::{ClientConfig, HarborClient, RegistryApi};
use hsync_kubehub::{ClusterApi, CrdStore, KubeCluster};
use hsync_persist::{CredentialStore, SqliteStore};
use hsync_store::RegistryCache;
use hsync_sync::trigger::force_sync_ticker;
use hsync_sync::{ControllerConfig, Reconciler, TriggerAdapter};
use kube::CustomResourceExt;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "harbor-sync", version, about = "Keeps Harbor robot accounts and their pull secrets in sync")]
struct Cli {
    /// Log filter, e.g. "info" or "hsync_sync=debug"
    #[arg(long = "loglevel", env = "HSYNC_LOG", global = true, default_value = "info")]
    loglevel: String,

    /// Path of the local credential store
    #[arg(long = "store", env = "HSYNC_STORE", global = true, default_value = "/data/credentials.db")]
    store: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct HarborOpts {
    /// URL of the Harbor API endpoint
    #[arg(long = "harbor-api-endpoint", env = "HARBOR_API_ENDPOINT")]
    endpoint: String,
    #[arg(long = "harbor-username", env = "HARBOR_USERNAME")]
    username: String,
    #[arg(long = "harbor-password", env = "HARBOR_PASSWORD", hide_env_values = true)]
    password: String,
    #[arg(long = "skip-tls-verification", env = "SKIP_TLS_VERIFICATION", action = ArgAction::SetTrue)]
    skip_tls_verification: bool,
    /// Seconds between Harbor polls
    #[arg(long = "harbor-poll-interval", env = "HARBOR_POLL_INTERVAL", default_value_t = 300)]
    poll_interval: u64,
    /// Seconds between forced reconciles of every config
    #[arg(long = "force-sync-interval", env = "FORCE_SYNC_INTERVAL", default_value_t = 600)]
    force_sync_interval: u64,
    /// Seconds after which credentials are rotated
    #[arg(long = "rotation-interval", env = "ROTATION_INTERVAL", default_value_t = 3600)]
    rotation_interval: u64,
    /// host:port for the Prometheus exporter
    #[arg(long = "metrics-addr", env = "HSYNC_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

impl HarborOpts {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            rotation_horizon: Duration::from_secs(self.rotation_interval),
            poll_interval: Duration::from_secs(self.poll_interval),
            force_sync_interval: Duration::from_secs(self.force_sync_interval),
            ..ControllerConfig::default()
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut cfg = ClientConfig::new(&self.endpoint, &self.username, &self.password);
        cfg.skip_tls_verify = self.skip_tls_verification;
        cfg
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller against the current cluster
    Controller(HarborOpts),
    /// Run without a cluster: manage robot accounts and send webhooks for one config
    Standalone {
        #[command(flatten)]
        harbor: HarborOpts,
        /// Path to a HarborSync manifest
        #[arg(long = "config")]
        config: PathBuf,
    },
    /// Inspect or wipe the local credential store
    Store {
        #[command(subcommand)]
        command: StoreCommand,
    },
    /// Print the custom resource definitions as YAML
    Crd,
}

#[derive(Subcommand, Debug)]
enum StoreCommand {
    /// Print every stored credential
    List {
        #[arg(long = "show-token", action = ArgAction::SetTrue)]
        show_token: bool,
    },
    /// Delete every stored credential
    Reset,
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::from_str(level).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<SocketAddr>) {
    if let Some(sock) = addr {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        match builder.with_http_listener(sock).install() {
            Ok(_) => info!(addr = %sock, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        }
    }
}

/// Live client behind the polling cache. Refuses registries without robot accounts.
async fn harbor_cache(opts: &HarborOpts, metrics: Arc<dyn MetricsSink>) -> Result<Arc<RegistryCache>> {
    let client = HarborClient::new(opts.client_config(), Arc::clone(&metrics)).context("creating harbor client")?;
    let version = client.check_version().await.context("checking harbor version")?;
    info!(version = %version, endpoint = %opts.endpoint, "connected to harbor");
    let cache = Arc::new(RegistryCache::new(Arc::new(client) as Arc<dyn RegistryApi>, metrics));
    if let Err(e) = cache.update().await {
        warn!(error = %e, "initial harbor sync failed");
    }
    Ok(cache)
}

async fn run_controller(opts: HarborOpts) -> Result<()> {
    init_metrics(opts.metrics_addr);
    let metrics: Arc<dyn MetricsSink> = Arc::new(RecorderSink);
    let config = opts.controller_config();
    let cache = harbor_cache(&opts, Arc::clone(&metrics)).await?;
    let harbor_rx = cache.spawn_polling(config.poll_interval);

    let kube = KubeCluster::try_default().await?;
    let client = kube.client();
    let cluster: Arc<dyn ClusterApi> = Arc::new(kube);
    let creds: Arc<dyn CredentialStore> = Arc::new(CrdStore::new(client.clone()));

    let (work_tx, work_rx) = mpsc::channel(256);
    let watcher = tokio::spawn({
        let tx = work_tx.clone();
        async move {
            if let Err(e) = hsync_kubehub::watch_sync_configs(client, tx).await {
                error!(error = ?e, "sync config watcher failed");
            }
        }
    });
    let adapter = TriggerAdapter::new(Arc::clone(&cluster), work_tx.clone());
    let force_rx = force_sync_ticker(config.force_sync_interval);
    let triggers = tokio::spawn(adapter.run(vec![("harbor", harbor_rx), ("force", force_rx)]));

    let reconciler = Arc::new(
        Reconciler::new(cache as Arc<dyn RegistryApi>, creds, Some(cluster), metrics, config).context("creating reconciler")?,
    );
    let worker = tokio::spawn(reconciler.run(work_rx, work_tx));
    info!("controller started");

    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutting down");
    watcher.abort();
    triggers.abort();
    worker.abort();
    Ok(())
}

async fn run_standalone(opts: HarborOpts, store: PathBuf, path: PathBuf) -> Result<()> {
    init_metrics(opts.metrics_addr);
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading config {}", path.display()))?;
    let mut sync_config: HarborSync = serde_yaml::from_str(&raw).with_context(|| format!("decoding config {}", path.display()))?;

    let metrics: Arc<dyn MetricsSink> = Arc::new(RecorderSink);
    let config = opts.controller_config();
    let creds: Arc<dyn CredentialStore> = Arc::new(SqliteStore::open(&store).context("opening credential store")?);
    let cache = harbor_cache(&opts, Arc::clone(&metrics)).await?;
    // keep the mirror fresh; standalone passes run on the force interval only
    let mut harbor_rx = cache.spawn_polling(config.poll_interval);
    tokio::spawn(async move { while harbor_rx.recv().await.is_some() {} });

    let interval = config.force_sync_interval;
    let reconciler = Reconciler::new(cache as Arc<dyn RegistryApi>, creds, None, metrics, config).context("creating reconciler")?;
    loop {
        let report = reconciler.pass(&sync_config, chrono::Utc::now()).await;
        match &report.aborted {
            Some(e) => error!(error = %e, "error reconciling"),
            None => info!(
                reconciled = report.reconciled.len(),
                changed = report.changed.len(),
                failed = report.project_errors.len(),
                "done recon"
            ),
        }
        for (project, e) in &report.project_errors {
            warn!(project = %project, error = %e, "project failed");
        }
        sync_config.status = Some(report.status);
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            res = signal::ctrl_c() => {
                res.context("waiting for shutdown signal")?;
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

async fn run_store(store: PathBuf, command: StoreCommand) -> Result<()> {
    let s = SqliteStore::open(&store).with_context(|| format!("opening credential store {}", store.display()))?;
    match command {
        StoreCommand::List { show_token } => {
            let entries = s.entries()?;
            info!(count = entries.len(), "found items");
            for (project, robot, cred) in entries {
                let token = if show_token { cred.token.as_str() } else { "<redacted>" };
                println!("{}\t{}\t{}\t{}\t{}", project, robot, cred.name, cred.created_at, token);
            }
        }
        StoreCommand::Reset => {
            s.reset().await?;
            info!(path = %store.display(), "credential store reset");
        }
    }
    Ok(())
}

fn print_crds() -> Result<()> {
    println!("{}", serde_yaml::to_string(&HarborSync::crd())?);
    println!("---");
    println!("{}", serde_yaml::to_string(&HarborRobotAccount::crd())?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.loglevel);

    match cli.command {
        Commands::Controller(opts) => run_controller(opts).await,
        Commands::Standalone { harbor, config } => run_standalone(harbor, cli.store, config).await,
        Commands::Store { command } => run_store(cli.store, command).await,
        Commands::Crd => print_crds(),
    }
}
