//! Dependency Updater - CLI
//!
//! Drives the propagation engine against an in-memory store snapshot.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dependency_updater::dispatch::{ChannelQueue, DispatchMode, RefreshWorker, WorkerStats};
use dependency_updater::notification::{ChangeNotification, DeleteNotification};
use dependency_updater::propagation::{PropagationOutcome, PropagationSettings, Propagator};
use dependency_updater::query::DependencySpec;
use dependency_updater::store::MemoryStore;
use dependency_updater::Config;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "sdu")]
#[command(about = "Propagate record changes to dependent records")]
struct Cli {
    /// Path to the YAML config file (default: ./config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Store snapshot to run against (overrides store.path)
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run change notifications (one object or an array) through the engine
    Propagate {
        /// JSON file holding the notification(s)
        notification: PathBuf,

        /// Submit refresh tasks to the queue instead of refreshing in-line
        #[arg(long)]
        queued: bool,
    },

    /// Propagate the deletion of a record
    Delete {
        /// Key of the deleted record
        subject: String,

        /// Dependency spec values the record held before deletion
        #[arg(long = "spec", required = true)]
        specs: Vec<String>,
    },

    /// Resolve a dependency spec and print the matching records
    Resolve {
        /// Raw dependency spec value, e.g. "A OR B"
        spec: String,
    },

    /// Print the effective configuration
    Config,
}

/// A notification file holds either one notification or a batch
#[derive(Deserialize)]
#[serde(untagged)]
enum NotificationFile {
    Many(Vec<ChangeNotification>),
    One(Box<ChangeNotification>),
}

#[derive(Serialize)]
struct RunSummary {
    outcomes: Vec<PropagationOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    worker: Option<WorkerStats>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = Config::from_yaml_and_env(cli.config.as_deref())?;
    if let Some(path) = cli.store {
        config.store_path = Some(path);
    }

    match cli.command {
        Commands::Propagate {
            notification,
            queued,
        } => {
            if queued {
                config.use_job_queue = true;
            }
            run_propagate(config, &notification).await
        }
        Commands::Delete { subject, specs } => run_delete(config, subject, specs).await,
        Commands::Resolve { spec } => run_resolve(config, &spec).await,
        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,dependency_updater=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn load_store(config: &Config) -> Result<Arc<MemoryStore>> {
    let Some(path) = &config.store_path else {
        bail!("No store snapshot configured; pass --store or set store.path");
    };
    Ok(Arc::new(MemoryStore::load(path)?))
}

/// Engine wired to the in-memory store, plus the queue worker it feeds.
struct Runtime {
    store: Arc<MemoryStore>,
    propagator: Propagator,
    worker: tokio::task::JoinHandle<WorkerStats>,
}

impl Runtime {
    fn start(config: &Config) -> Result<Self> {
        let store = load_store(config)?;
        let settings = PropagationSettings::resolve(config, store.as_ref())?;

        let (queue, rx) = ChannelQueue::new(settings.queue_capacity);
        let worker = RefreshWorker::new(store.clone(), settings.worker_max_attempts).spawn(rx);
        let propagator = Propagator::new(settings, store.clone(), store.clone(), Arc::new(queue));

        Ok(Self {
            store,
            propagator,
            worker,
        })
    }

    /// Close the queue and wait for queued refreshes to finish.
    async fn finish(self) -> Result<Option<WorkerStats>> {
        let queued = self.propagator.settings().mode == DispatchMode::Queued;
        drop(self.propagator);
        let stats = self.worker.await.context("Refresh worker panicked")?;
        tracing::info!(
            "Store refreshed {} record(s) in total",
            self.store.total_refreshes().await
        );
        Ok(queued.then_some(stats))
    }
}

async fn run_propagate(config: Config, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let notifications = match serde_json::from_str::<NotificationFile>(&content)
        .with_context(|| format!("Invalid notification file {}", path.display()))?
    {
        NotificationFile::Many(list) => list,
        NotificationFile::One(one) => vec![*one],
    };

    let runtime = Runtime::start(&config)?;

    // One file is one unit of work
    let mut ctx = runtime.propagator.new_context();
    let mut outcomes = Vec::with_capacity(notifications.len());
    for notification in &notifications {
        outcomes.push(
            runtime
                .propagator
                .on_data_update(&mut ctx, notification)
                .await?,
        );
    }

    let worker = runtime.finish().await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&RunSummary { outcomes, worker })?
    );
    Ok(())
}

async fn run_delete(config: Config, subject: String, specs: Vec<String>) -> Result<()> {
    let runtime = Runtime::start(&config)?;
    let outcome = runtime
        .propagator
        .on_delete(&DeleteNotification::new(subject, specs))
        .await?;

    let worker = runtime.finish().await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&RunSummary {
            outcomes: vec![outcome],
            worker,
        })?
    );
    Ok(())
}

async fn run_resolve(config: Config, spec: &str) -> Result<()> {
    let runtime = Runtime::start(&config)?;
    let resolver = runtime.propagator.resolver();

    let query = resolver.build_query(spec)?;
    let resolution = resolver.resolve(&DependencySpec::new([spec])).await;

    println!("Query: {}", query);
    for target in &resolution.targets {
        println!("  {}", target);
    }
    if resolution.truncated {
        println!("(truncated at {} results)", resolver.limit());
    }
    for failure in &resolution.failures {
        eprintln!("Failed: {}: {}", failure.source, failure.error);
    }

    runtime.finish().await?;
    Ok(())
}
