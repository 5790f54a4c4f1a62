mod check_cmd;
mod config;
mod identity_cmd;
mod jobs_cmd;
mod terminal_output;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info, warn, Instrument, Span};

use netwarden_cluster::{
    ClusterCoordinator, ClusterEvent, ClusterHandle, ClusterMember, ClusterSettings,
    MastershipStatus, SqliteNotificationBus,
};
use netwarden_config::NetwardenConfig;
use netwarden_hooks::{HookPipeline, HookRegistry, LoggingHook};
use netwarden_scheduler::{
    HandlerRegistry, JobRunner, JobScheduler, JobStore, JobType, PurgeDatabaseHandler,
    RunnerCandidate, SqliteJobStore, WeightedRunnerSelector,
};

#[derive(Parser)]
#[command(name = "netwarden")]
#[command(about = "netwarden: network device job scheduler with clustering")]
#[command(version)]
struct Cli {
    /// Config file (defaults to $NETWARDEN_CONFIG or ~/.netwarden/netwarden.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler (and the cluster coordinator when enabled)
    Serve,
    /// Show the cluster instance id and priorities of this host
    Identity,
    /// List jobs from the database
    Jobs {
        /// Maximum number of jobs to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        /// Only jobs in this status (e.g. RUNNING)
        #[arg(short, long)]
        status: Option<String>,
    },
    /// Validate the config file
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = config::resolve_config_path(cli.config);

    match cli.command {
        Commands::Check => check_cmd::run(&path).await,
        Commands::Identity => {
            let config = config::load(&path).await?;
            identity_cmd::run(&config);
            Ok(())
        }
        Commands::Jobs { limit, status } => {
            let config = config::load(&path).await?;
            jobs_cmd::run(&config, limit, status.as_deref())
        }
        Commands::Serve => {
            let config = config::load(&path).await?;
            let _log_guard =
                netwarden_logging::init_logger(&config.logging.dir, &config.logging.level);
            info!(config = %path.display(), "Loaded configuration");
            run_server(config).await
        }
    }
}

async fn run_server(config: NetwardenConfig) -> Result<()> {
    let cluster = config
        .cluster
        .enabled
        .then(|| ClusterSettings::from_config(&config.cluster));
    let span = netwarden_logging::instance_span(cluster.as_ref().map(|s| s.instance_id.as_str()));
    serve(config, cluster).instrument(span).await
}

async fn serve(config: NetwardenConfig, cluster: Option<ClusterSettings>) -> Result<()> {
    info!(
        db = %config.database.path,
        threads = config.tasks.thread_count,
        cluster = config.cluster.enabled,
        "Starting netwarden"
    );

    let store: Arc<dyn JobStore> = Arc::new(
        SqliteJobStore::open(&config.database.path).context("failed to open job database")?,
    );

    let mut handlers = HandlerRegistry::new();
    handlers.register(
        JobType::PurgeDatabase,
        Arc::new(PurgeDatabaseHandler::new(Arc::clone(&store))),
    );

    let hooks = HookRegistry::new();
    hooks
        .register(
            Arc::new(LoggingHook::new("netwarden")),
            JobType::ALL.iter().map(|t| t.as_str()),
        )
        .await;

    let runner_id = cluster.as_ref().map(|s| s.instance_id.clone());
    let runner = JobRunner::new(
        Arc::clone(&store),
        Arc::new(handlers),
        HookPipeline::new(hooks),
        runner_id,
    );
    let scheduler = JobScheduler::new(Arc::clone(&store), runner, config.tasks.thread_count);

    let report = scheduler.reschedule_all()?;
    info!(
        readmitted = report.readmitted.len(),
        cancelled = report.cancelled.len(),
        "Startup job recovery done"
    );

    let (trigger, shutdown) = netwarden_core::shutdown::channel();
    let mut tasks = Vec::new();

    if let Some(settings) = cluster {
        let bus = Arc::new(
            SqliteNotificationBus::open(&config.database.path)
                .context("failed to open cluster notification table")?,
        );
        let (coordinator, events) = ClusterCoordinator::new(settings, bus);
        let handle = coordinator.handle();
        let instance_id = coordinator.instance_id().to_string();

        let cluster_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(
            async move {
                if let Err(e) = coordinator.start(cluster_shutdown).await {
                    error!(error = %e, "Cluster coordinator failed");
                }
            }
            .instrument(Span::current()),
        ));
        tasks.push(tokio::spawn(
            forward_cluster_events(events, scheduler.clone(), handle, instance_id)
                .instrument(Span::current()),
        ));
    }

    info!("All components started");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    trigger.trigger();
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

/// Apply coordinator events to the local scheduler.
async fn forward_cluster_events(
    mut events: mpsc::Receiver<ClusterEvent>,
    scheduler: JobScheduler,
    cluster: ClusterHandle,
    instance_id: String,
) {
    while let Some(event) = events.recv().await {
        match event {
            ClusterEvent::LoadTasks => match scheduler.schedule_local_jobs(&instance_id) {
                Ok(count) => info!(count, "Loaded jobs assigned to this runner"),
                Err(e) => error!(error = %e, "Unable to load jobs assigned to this runner"),
            },
            ClusterEvent::RunnersChanged(runners) => {
                if cluster.is_master() {
                    reassign_orphans(&scheduler, &cluster, &runners);
                }
            }
            ClusterEvent::MastershipChanged { status, master } => {
                info!(status = %status, master = ?master, "Cluster mastership");
                if status == MastershipStatus::Master {
                    reassign_orphans(&scheduler, &cluster, &cluster.runners());
                }
            }
            ClusterEvent::ReloadDrivers => {
                info!("Device driver reload requested by the cluster master");
            }
            ClusterEvent::AutoSnapshot(devices) => {
                info!(count = devices.len(), devices = ?devices, "Devices due for an automatic snapshot");
            }
        }
    }
}

fn reassign_orphans(scheduler: &JobScheduler, cluster: &ClusterHandle, runners: &[ClusterMember]) {
    let candidates: Vec<RunnerCandidate> = runners
        .iter()
        .map(|m| RunnerCandidate {
            instance_id: m.instance_id.clone(),
            runner_priority: m.runner_priority,
            runner_weight: m.runner_weight,
        })
        .collect();
    match scheduler.reassign_orphans(&WeightedRunnerSelector, &candidates) {
        Ok(moved) if !moved.is_empty() => cluster.request_tasks_load(),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Unable to reassign orphan jobs"),
    }
}
