use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use fabrik_api::{Collaborators, DeploymentOperator, DirectorService, TaskStatusPoller};
use fabrik_core::config::{DirectorConfig, Settings};
use fabrik_core::operation::OperationType;
use fabrik_core::queue::OperationQueue;
use fabrik_core::resource::{Resource, ResourceRegistry, ResourceState};
use fabrik_kubehub::KubeResourceApi;
use fabrik_ops::{BoshDirectorClient, Director, Dispatcher, StaggeredDeploymentPoller, YamlManifest};
use fabrik_persist::SqliteOperationQueue;
use fabrik_store::{EventKind, ListQuery, ResourceStore, WatchEvent};
use serde::Serialize;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "fabrikctl", version, about = "Fabrik control plane CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace override (default: resolved from the resource id)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Director to talk to (default: the primary one)
    #[arg(long = "director", global = true)]
    director: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json, Yaml }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Action { Create, Update, Delete }

impl From<Action> for OperationType {
    fn from(a: Action) -> Self {
        match a {
            Action::Create => OperationType::Create,
            Action::Update => OperationType::Update,
            Action::Delete => OperationType::Delete,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or patch the type definitions of all registered resource types
    RegisterTypes,
    /// Show one resource
    Get {
        /// Resource group, e.g. "deployment.servicefabrik.io"
        group: String,
        /// Resource type (plural), e.g. "directors"
        plural: String,
        id: String,
    },
    /// List resources, oldest first
    List {
        group: String,
        plural: String,
        /// Label selector
        #[arg(long = "selector", short = 'l')]
        selector: Option<String>,
        /// Only resources in these states (comma separated)
        #[arg(long = "state", value_delimiter = ',')]
        states: Vec<String>,
        #[arg(long = "all-namespaces", short = 'A', action = ArgAction::SetTrue)]
        all_namespaces: bool,
        #[arg(long = "limit")]
        limit: Option<u32>,
    },
    /// Watch resources and print +/- events until Ctrl-C
    Watch {
        group: String,
        plural: String,
        #[arg(long = "selector", short = 'l')]
        selector: Option<String>,
    },
    /// Evaluate admission against the director's current tasks
    Admission {
        #[arg(value_enum)]
        action: Action,
        #[arg(long = "scheduled", action = ArgAction::SetTrue)]
        scheduled: bool,
    },
    /// Inspect the operation queue
    Queue {
        /// Show the dispatched task recorded for this instance instead of the queue
        #[arg(long = "instance")]
        instance: Option<String>,
    },
    /// Run the operator loops
    Operator {
        #[command(subcommand)]
        command: OperatorCommand,
    },
}

#[derive(Subcommand, Debug)]
enum OperatorCommand {
    /// Process requests, poll tasks and re-dispatch queued deployments until Ctrl-C
    Run {
        /// Seconds between task status rounds
        #[arg(long = "poll-secs", default_value_t = 10)]
        poll_secs: u64,
        /// Seconds between re-dispatch rounds over the queue
        #[arg(long = "stagger-secs", default_value_t = 30)]
        stagger_secs: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("FABRIK_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FABRIK_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid FABRIK_METRICS_ADDR; expected host:port");
        }
    }
}

fn print<T: Serialize>(output: Output, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    match output {
        Output::Human => human(value),
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
        Output::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

fn row(r: &Resource) {
    let ns = r.metadata.namespace.as_deref().unwrap_or("-");
    println!("{:<16} {:<40} {}", ns, r.metadata.name, r.state_str().unwrap_or("-"));
}

fn pick_director<'a>(settings: &'a Settings, name: Option<&str>) -> Result<&'a DirectorConfig> {
    match name {
        Some(n) => settings.director(n).ok_or_else(|| anyhow!("no director named '{}' configured", n)),
        None => settings
            .directors
            .iter()
            .find(|d| d.primary)
            .or_else(|| settings.directors.first())
            .ok_or_else(|| anyhow!("no director configured")),
    }
}

async fn open_store(settings: &Settings) -> Result<Arc<ResourceStore>> {
    let api = KubeResourceApi::try_default().await.context("connecting to the resource API")?;
    Ok(Arc::new(ResourceStore::new(Arc::new(api), ResourceRegistry::with_defaults(), settings.apiserver.clone())))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let settings = Settings::load()?;

    match cli.command {
        Commands::RegisterTypes => {
            let store = open_store(&settings).await?;
            let types: Vec<_> = store.registry().types().cloned().collect();
            for rt in &types {
                store.register_type(&rt.group, &rt.plural).await?;
                info!(rt = %rt, "type registered");
            }
            print(cli.output, &types, |ts| ts.iter().for_each(|t| println!("{}", t.crd_name())))?;
        }
        Commands::Get { group, plural, id } => {
            let store = open_store(&settings).await?;
            let r = store.get(&group, &plural, &id, cli.namespace.as_deref()).await?;
            print(cli.output, &r, |r| {
                row(r);
                for (k, v) in &r.status {
                    println!("  {}: {}", k, v);
                }
            })?;
        }
        Commands::List { group, plural, selector, states, all_namespaces, limit } => {
            let store = open_store(&settings).await?;
            let items = if states.is_empty() {
                let query = ListQuery { label_selector: selector, limit, ..Default::default() };
                store.list(&group, &plural, &query, all_namespaces).await?
            } else {
                let parsed = states
                    .iter()
                    .map(|s| ResourceState::parse(s).ok_or_else(|| anyhow!("unknown state '{}'", s)))
                    .collect::<Result<Vec<_>>>()?;
                store.list_by_state(&group, &plural, &parsed).await?
            };
            print(cli.output, &items, |items| {
                println!("{:<16} {:<40} STATE", "NAMESPACE", "NAME");
                items.iter().for_each(row);
            })?;
        }
        Commands::Watch { group, plural, selector } => {
            let store = open_store(&settings).await?;
            info!(group = %group, plural = %plural, selector = ?selector, "watch invoked");
            let (tx, mut rx) = mpsc::channel::<WatchEvent>(256);
            let handle = store.spawn_watch(&group, &plural, selector, tx);
            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(ev) => {
                            let sign = if ev.kind == EventKind::Deleted { "-" } else { "+" };
                            let ns = ev.resource.metadata.namespace.as_deref().unwrap_or("-");
                            println!("{} {}/{} {}", sign, ns, ev.resource.metadata.name, ev.resource.state_str().unwrap_or("-"));
                        }
                        None => {
                            warn!("watch channel closed; exiting watch loop");
                            break;
                        }
                    },
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
            handle.abort();
        }
        Commands::Admission { action, scheduled } => {
            let cfg = pick_director(&settings, cli.director.as_deref())?;
            let director = BoshDirectorClient::new(cfg.clone())?;
            let counts = director.current_tasks().await?;
            let decision = fabrik_ops::evaluate(&director, scheduled, action.into()).await;
            #[derive(Serialize)]
            struct Report<'a> {
                director: &'a str,
                max_workers: u32,
                counts: fabrik_ops::TaskCounts,
                should_run_now: bool,
                fail_safe: bool,
            }
            let report = Report { director: &cfg.name, max_workers: cfg.max_workers, counts, should_run_now: decision.should_run_now, fail_safe: decision.fail_safe };
            print(cli.output, &report, |r| {
                println!("director {} (max_workers {})", r.director, r.max_workers);
                println!(
                    "in flight: total={} scheduled={} create={} update={} delete={} uncategorized={}",
                    r.counts.total, r.counts.scheduled, r.counts.create, r.counts.update, r.counts.delete, r.counts.uncategorized
                );
                println!("run now: {}", r.should_run_now);
            })?;
        }
        Commands::Queue { instance } => {
            let queue = SqliteOperationQueue::open_default()?;
            match instance {
                Some(id) => {
                    let task = queue.get_bosh_task(&id).await?;
                    print(cli.output, &task, |t| println!("{}", t.as_deref().unwrap_or("-")))?;
                }
                None => {
                    let mut entries = Vec::new();
                    for name in queue.get_deployment_names().await? {
                        if let Some(e) = queue.get_deployment_by_name(&name).await? {
                            entries.push(e);
                        }
                    }
                    print(cli.output, &entries, |es| {
                        println!("{:<60} PLAN", "DEPLOYMENT");
                        es.iter().for_each(|e| println!("{:<60} {}", e.deployment_name, e.plan_id));
                    })?;
                }
            }
        }
        Commands::Operator { command: OperatorCommand::Run { poll_secs, stagger_secs } } => {
            let store = open_store(&settings).await?;
            let cfg = pick_director(&settings, cli.director.as_deref())?;
            let director: Arc<dyn Director> = Arc::new(BoshDirectorClient::new(cfg.clone())?);
            let queue: Arc<dyn OperationQueue> = Arc::new(SqliteOperationQueue::open_default()?);
            let dispatcher = Arc::new(Dispatcher::new(director, queue, Arc::new(YamlManifest), settings.enable_rate_limit));
            let service = Arc::new(DirectorService::new(dispatcher.clone(), store.clone(), &settings.deployment, Collaborators::default())?);

            let operator = Arc::new(DeploymentOperator::new(service.clone(), store.clone()));
            let picked = operator.process_pending().await?;
            info!(director = %cfg.name, pending = picked, rate_limit = settings.enable_rate_limit, "operator starting");
            let tasks = vec![
                operator.spawn(),
                Arc::new(TaskStatusPoller::new(service, store, Duration::from_secs(poll_secs))).spawn(),
                Arc::new(StaggeredDeploymentPoller::new(dispatcher, Duration::from_secs(stagger_secs))).spawn(),
            ];
            signal::ctrl_c().await?;
            info!("Ctrl-C received; stopping operator");
            tasks.iter().for_each(|t| t.abort());
        }
    }

    Ok(())
}
