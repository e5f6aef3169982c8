//! CLI command definitions for registry-loadgen.
//!
//! Three commands share one set of settings:
//!
//! - `run` drives a load run: plans the tags, fills the queues and launches
//!   the push and pull jobs for every user segment
//! - `worker` is one execution unit, the entrypoint of every job pod
//! - `plan` prints the tags `run` would enqueue
//!
//! Every option falls back to the environment variable the job pods receive,
//! so a unit started by `run` needs no arguments besides `worker`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::aggregate::ResultAggregator;
use crate::config::{
    ExecutionSettings, RegistrySettings, RunContext, RunSettings, StoreSettings, WorkerSettings,
};
use crate::execution::{
    ExecutionUnit, HttpRegistryClient, PodmanTool, DEFAULT_BATCH_SIZE, DEFAULT_LAYER_CONCURRENCY,
    DEFAULT_MAX_ATTEMPTS,
};
use crate::metrics::{init_metrics, write_metrics_file};
use crate::orchestrator::{KubernetesOrchestrator, LocalOrchestrator, Orchestrator};
use crate::plan::{plan_usernames, TagPlan};
use crate::scheduler::{
    segments_from_usernames, BatchCoordinator, CoordinatorError, JobLauncher, JobMonitor,
    MemoryWorkQueue, MonitorConfig, Operation, PullPolicy, RedisWorkQueue, SegmentReport,
    UserSegment, WorkQueue,
};

/// Image the units run in when none is configured.
const DEFAULT_UNIT_IMAGE: &str = "quay.io/quay/registry-loadgen:latest";

/// Default Redis location.
const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Container registry load generator.
#[derive(Parser)]
#[command(name = "registry-loadgen")]
#[command(about = "Generate push/pull load against a container registry")]
#[command(version)]
#[command(
    long_about = "registry-loadgen fans image push and pull work out across registry users and Kubernetes jobs, then stores per-image timings in Elasticsearch.\n\nExample usage:\n  registry-loadgen run --host quay.example.com --org perf --username admin --count 1000"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a push/pull load test across all user segments.
    Run(Box<RunArgs>),

    /// Run one execution unit: pop a batch from a queue and process it.
    ///
    /// This is what every job pod runs. All settings are normally supplied
    /// through the environment by `run`.
    Worker(Box<WorkerArgs>),

    /// Print the tags a run would push and pull.
    Plan(PlanArgs),
}

/// Target registry.
#[derive(Args, Debug, Clone)]
pub struct RegistryArgs {
    /// Registry host, e.g. quay.example.com.
    #[arg(long, env = "QUAY_HOST")]
    pub host: String,

    /// Password shared by the registry users.
    #[arg(long, env = "QUAY_PASSWORD", default_value = "", hide_env_values = true)]
    pub password: String,

    /// Organization the test repositories live in.
    #[arg(long = "org", env = "QUAY_ORG", default_value = "")]
    pub organization: String,

    /// Verify the registry TLS certificate on HTTP pulls.
    #[arg(long, env = "VERIFY_TLS")]
    pub verify_tls: bool,
}

impl RegistryArgs {
    fn settings(&self) -> RegistrySettings {
        RegistrySettings {
            host: self.host.clone(),
            password: self.password.clone(),
            organization: self.organization.clone(),
            verify_tls: self.verify_tls,
        }
    }
}

/// Elasticsearch location.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Elasticsearch host. Results are not stored when unset.
    #[arg(long, env = "ES_HOST")]
    pub es_host: Option<String>,

    /// Elasticsearch port.
    #[arg(long, env = "ES_PORT", default_value = "9200")]
    pub es_port: u16,

    /// Index receiving push/pull results.
    #[arg(long, env = "PUSH_PULL_ES_INDEX", default_value = "registry-push-pull")]
    pub es_index: String,
}

impl StoreArgs {
    fn settings(&self) -> StoreSettings {
        StoreSettings {
            host: self.es_host.clone(),
            port: self.es_port,
            index: self.es_index.clone(),
        }
    }
}

/// Settings of the push and pull paths inside a unit.
#[derive(Args, Debug, Clone)]
pub struct ExecutionArgs {
    /// Units per job, and items in flight per unit.
    #[arg(short = 'c', long, env = "CONCURRENCY", default_value = "10")]
    pub concurrency: usize,

    /// Items each unit pops from its queue.
    #[arg(short = 'b', long, env = "TEST_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Base image of pushed builds.
    #[arg(long, env = "CUSTOM_BUILD_IMAGE")]
    pub base_image: Option<String>,

    /// Attempts per publish and per layer fetch.
    #[arg(long, env = "MAX_RETRIES", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_retries: u32,

    /// Layers fetched at once per pulled image.
    #[arg(long, env = "LAYER_CONCURRENCY", default_value_t = DEFAULT_LAYER_CONCURRENCY)]
    pub layer_concurrency: usize,

    /// Which tags are pulled: all_items or pushed_only.
    #[arg(long, env = "PULL_POLICY", default_value = "all_items")]
    pub pull_policy: PullPolicy,
}

impl ExecutionArgs {
    fn settings(&self) -> ExecutionSettings {
        ExecutionSettings {
            concurrency: self.concurrency,
            batch_size: self.batch_size,
            base_image: self.base_image.clone(),
            max_attempts: self.max_retries,
            layer_concurrency: self.layer_concurrency,
            pull_policy: self.pull_policy,
        }
    }
}

/// Which tags a run covers.
#[derive(Args, Debug, Clone)]
pub struct TagArgs {
    /// Number of tags to push and pull.
    #[arg(short = 'n', long = "count", env = "PUSH_PULL_NUMBERS", default_value = "50")]
    pub count: usize,

    /// Explicit comma-separated tag list.
    #[arg(long, env = "TAGS")]
    pub tags: Option<String>,

    /// Skip the push phase and only pull.
    #[arg(long, env = "SKIP_PUSH")]
    pub skip_push: bool,

    /// Layer count of pre-seeded pull repositories.
    #[arg(long, env = "PULL_LAYERS", default_value = "0")]
    pub pull_layers: u32,

    /// Name prefix of pre-seeded pull repositories.
    #[arg(long, env = "PULL_REPO_PREFIX")]
    pub pull_repo_prefix: Option<String>,
}

impl TagArgs {
    fn plan(&self, registry: &RegistryArgs) -> TagPlan {
        TagPlan {
            host: registry.host.clone(),
            organization: registry.organization.clone(),
            count: self.count,
            explicit: self.tags.clone(),
            skip_push: self.skip_push,
            pull_layers: self.pull_layers,
            pull_repo_prefix: self.pull_repo_prefix.clone(),
        }
    }
}

/// Arguments for `registry-loadgen run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub registry: RegistryArgs,

    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub execution: ExecutionArgs,

    #[command(flatten)]
    pub tags: TagArgs,

    /// Registry user when no user list or count is given.
    #[arg(short = 'u', long, env = "QUAY_USERNAME")]
    pub username: Option<String>,

    /// Explicit comma-separated list of users, one segment each.
    #[arg(long, env = "TEST_USERS")]
    pub users: Option<String>,

    /// Generate this many `<prefix>_user_<n>` users.
    #[arg(long, env = "TEST_USER_COUNT")]
    pub user_count: Option<usize>,

    /// Segments running at once (defaults to the concurrency).
    #[arg(short = 'g', long, env = "GROUP_SIZE")]
    pub group_size: Option<usize>,

    /// Identifier of this run (defaults to a fresh UUID).
    #[arg(long, env = "TEST_UUID")]
    pub run_id: Option<String>,

    /// Redis URL of the work queues.
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Image the units run in.
    #[arg(long, env = "PUSH_PULL_IMAGE", default_value = DEFAULT_UNIT_IMAGE)]
    pub image: String,

    /// Kubernetes namespace (defaults to the service account's).
    #[arg(long, env = "TEST_NAMESPACE")]
    pub namespace: Option<String>,

    /// Passed through to units for reporting.
    #[arg(long, env = "TARGET_HIT_SIZE", default_value = "0")]
    pub target_hit_size: usize,

    /// Run units in this process with an in-memory queue instead of
    /// submitting Kubernetes jobs.
    #[arg(long)]
    pub local: bool,

    /// Kubernetes API server URL. In-cluster configuration is used when unset.
    #[arg(long, env = "KUBE_API_URL")]
    pub kube_api: Option<String>,

    /// Bearer token for --kube-api.
    #[arg(long, env = "KUBE_TOKEN", hide_env_values = true)]
    pub kube_token: Option<String>,

    /// Skip TLS verification of --kube-api.
    #[arg(long)]
    pub kube_insecure: bool,

    /// Seconds to wait before the first job status poll.
    #[arg(long, default_value = "60")]
    pub start_delay: u64,

    /// Seconds between job status polls.
    #[arg(long, default_value = "60")]
    pub poll_interval: u64,

    /// Give up on a job after this many seconds.
    #[arg(long)]
    pub job_timeout: Option<u64>,

    /// Delete a job when its wait is abandoned.
    #[arg(long)]
    pub delete_on_abandon: bool,

    /// Write Prometheus metrics to this file when the run ends.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

impl RunArgs {
    fn settings(&self) -> anyhow::Result<RunSettings> {
        let run_id = self
            .run_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let context = RunContext::new(
            run_id.clone(),
            self.registry.host.clone(),
            self.registry.organization.clone(),
        );
        let usernames = plan_usernames(
            self.users.as_deref(),
            self.user_count,
            &run_id,
            self.username.as_deref(),
        )?;

        let settings = RunSettings {
            context,
            registry: self.registry.settings(),
            store: self.store.settings(),
            execution: self.execution.settings(),
            redis_url: self.redis_url.clone(),
            usernames,
            items: self.tags.plan(&self.registry).items(),
            group_size: self.group_size.unwrap_or(self.execution.concurrency),
            skip_push: self.tags.skip_push,
            namespace: self.namespace.clone().filter(|ns| !ns.trim().is_empty()),
            unit_image: self.image.clone(),
            target_hit_size: self.target_hit_size,
            monitor: MonitorConfig {
                start_delay: Duration::from_secs(self.start_delay),
                poll_interval: Duration::from_secs(self.poll_interval),
                timeout: self.job_timeout.map(Duration::from_secs),
                delete_on_abandon: self.delete_on_abandon,
            },
        };
        settings.validate()?;
        Ok(settings)
    }
}

/// Arguments for `registry-loadgen worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub registry: RegistryArgs,

    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub execution: ExecutionArgs,

    /// Registry user whose queue this unit drains.
    #[arg(short = 'u', long, env = "QUAY_USERNAME")]
    pub username: String,

    /// Queue to drain: push or pull.
    #[arg(long, env = "QUAY_TEST_NAME")]
    pub operation: Operation,

    /// Identifier of the run this unit belongs to.
    #[arg(long, env = "TEST_UUID")]
    pub run_id: String,

    /// Redis URL of the work queues.
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Write Prometheus metrics to this file when the unit ends.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,
}

impl WorkerArgs {
    fn settings(&self) -> anyhow::Result<WorkerSettings> {
        let settings = WorkerSettings {
            context: RunContext::new(
                self.run_id.clone(),
                self.registry.host.clone(),
                self.registry.organization.clone(),
            ),
            registry: self.registry.settings(),
            store: self.store.settings(),
            execution: self.execution.settings(),
            redis_url: self.redis_url.clone(),
            username: self.username.clone(),
            operation: self.operation,
        };
        settings.validate()?;
        Ok(settings)
    }
}

/// Arguments for `registry-loadgen plan`.
#[derive(Parser, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub registry: RegistryArgs,

    #[command(flatten)]
    pub tags: TagArgs,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_load_command(*args).await,
        Commands::Worker(args) => run_worker_command(*args).await,
        Commands::Plan(args) => run_plan_command(args),
    }
}

// ============================================================================
// Run Command Implementation
// ============================================================================

fn build_unit(settings: &WorkerSettings, queue: Arc<dyn WorkQueue>) -> anyhow::Result<ExecutionUnit> {
    let store = settings.store.build()?;
    let aggregator = Arc::new(ResultAggregator::new(
        store,
        settings.store.index.clone(),
        settings.context.metadata(),
    ));
    let registry = HttpRegistryClient::new(!settings.registry.verify_tls)?;

    Ok(ExecutionUnit::new(
        queue,
        Arc::new(PodmanTool::new()),
        Arc::new(registry),
        aggregator,
        settings.push_config(),
        settings.pull_config(),
    )
    .with_batch_size(settings.execution.batch_size)
    .with_pull_policy(settings.execution.pull_policy))
}

async fn build_orchestrator(
    args: &RunArgs,
    settings: &RunSettings,
    queue: Arc<dyn WorkQueue>,
) -> anyhow::Result<Arc<dyn Orchestrator>> {
    if args.local {
        let unit = build_unit(&settings.local_worker(), queue)?;
        info!("Running units in process");
        return Ok(Arc::new(LocalOrchestrator::new(Arc::new(unit))));
    }

    let orchestrator = match &args.kube_api {
        Some(api) => KubernetesOrchestrator::new(
            api.clone(),
            args.kube_token.clone(),
            settings.namespace.clone().unwrap_or_else(|| "default".to_string()),
            args.kube_insecure,
        )?,
        None => KubernetesOrchestrator::in_cluster(settings.namespace.clone()).await?,
    };
    Ok(Arc::new(orchestrator))
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });
}

async fn export_metrics_to(path: Option<&Path>) {
    if let Some(path) = path {
        match write_metrics_file(path).await {
            Ok(()) => info!(path = %path.display(), "Wrote metrics"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to write metrics"),
        }
    }
}

fn report_json(reports: &[SegmentReport]) -> serde_json::Value {
    let segments: Vec<_> = reports
        .iter()
        .map(|r| {
            json!({
                "user": r.segment.username(),
                "slug": r.segment.slug(),
                "chunk": r.chunk,
                "push": r.push.to_string(),
                "pull": r.pull.to_string(),
                "success": r.is_success(),
            })
        })
        .collect();
    json!({
        "segments": segments,
        "failed": reports.iter().filter(|r| !r.is_success()).count(),
    })
}

fn print_reports(reports: &[SegmentReport], as_json: bool) -> anyhow::Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(&report_json(reports))?);
        return Ok(());
    }
    for report in reports {
        let marker = if report.is_success() { "ok" } else { "FAILED" };
        println!(
            "{:<6} {:<30} push: {}  pull: {}",
            marker,
            report.segment.username(),
            report.push,
            report.pull
        );
    }
    Ok(())
}

async fn run_load_command(args: RunArgs) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }

    let settings = args.settings()?;
    let segments = segments_from_usernames(settings.usernames.clone())?;

    info!(
        host = %settings.registry.host,
        run_id = %settings.context.run_id,
        organization = %settings.registry.organization,
        users = segments.len(),
        total_tags = settings.items.len(),
        concurrency = settings.execution.concurrency,
        batch_size = settings.execution.batch_size,
        group_size = settings.group_size,
        skip_push = settings.skip_push,
        pull_policy = %settings.execution.pull_policy,
        "Running registry push/pull load test"
    );

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    let queue: Arc<dyn WorkQueue> = if args.local {
        Arc::new(MemoryWorkQueue::new())
    } else {
        Arc::new(RedisWorkQueue::connect(&settings.redis_url).await?)
    };
    let orchestrator = build_orchestrator(&args, &settings, Arc::clone(&queue)).await?;

    let launcher = Arc::new(
        JobLauncher::new(
            Arc::clone(&orchestrator),
            settings.unit_image.clone(),
            settings.execution.concurrency as u32,
            settings.execution.batch_size,
        )
        .with_env(settings.unit_env()),
    );
    let monitor = Arc::new(JobMonitor::new(
        orchestrator,
        Arc::clone(&queue),
        settings.monitor.clone(),
        cancel.clone(),
    ));
    let coordinator = BatchCoordinator::new(
        queue,
        launcher,
        monitor,
        settings.items.clone(),
        settings.coordinator_config(),
        cancel,
    );

    let started = std::time::Instant::now();
    let outcome = coordinator.run(&segments).await;
    info!(elapsed = ?started.elapsed(), "Image push/pulls finished");
    export_metrics_to(args.metrics_file.as_deref()).await;

    let reports = match outcome {
        Ok(reports) => reports,
        Err(CoordinatorError::Cancelled {
            completed_chunks,
            reports,
        }) => {
            print_reports(&reports, args.json)?;
            anyhow::bail!("Run cancelled after {} chunk(s)", completed_chunks);
        }
        Err(e) => return Err(e.into()),
    };

    print_reports(&reports, args.json)?;
    let failed = reports.iter().filter(|r| !r.is_success()).count();
    if failed > 0 {
        error!(failed, total = reports.len(), "Some segments failed");
        anyhow::bail!("{} of {} segment(s) failed", failed, reports.len());
    }
    Ok(())
}

// ============================================================================
// Worker Command Implementation
// ============================================================================

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }

    let settings = args.settings()?;
    let segment = UserSegment::new(settings.username.clone())?;
    let queue: Arc<dyn WorkQueue> = Arc::new(RedisWorkQueue::connect(&settings.redis_url).await?);
    let unit = build_unit(&settings, queue)?;

    info!(
        segment = %segment,
        operation = %settings.operation,
        run_id = %settings.context.run_id,
        host = %settings.context.worker_host,
        "Starting execution unit"
    );
    let result = unit.run(&segment, settings.operation).await;
    export_metrics_to(args.metrics_file.as_deref()).await;

    let report = result?;
    info!(
        segment = %segment,
        popped = report.popped,
        forwarded = report.forwarded,
        "Execution unit finished"
    );
    Ok(())
}

// ============================================================================
// Plan Command Implementation
// ============================================================================

fn run_plan_command(args: PlanArgs) -> anyhow::Result<()> {
    let plan = args.tags.plan(&args.registry);
    let items = plan.items();

    if args.json {
        let output = json!({
            "repository": plan.repository(),
            "total": items.len(),
            "tags": items,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        for item in &items {
            println!("{}", item);
        }
    }
    Ok(())
}
