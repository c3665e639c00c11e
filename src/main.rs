use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use sisyphus_lite::channel::{Connector, ControlDir, SshConnector};
use sisyphus_lite::config::{
    HostInventory, HostSpec, PoolConfig, PublishConfig, RetryConfig, RunConfig, Secret,
};
use sisyphus_lite::dashboard::{run_dashboard, DashboardState};
use sisyphus_lite::matrix::BuildMatrix;
use sisyphus_lite::pool::{spawn_health_monitor, ChannelPool};
use sisyphus_lite::report::{render, MatrixReport};
use sisyphus_lite::reporter::{AnacondaClient, GitHubApi, PublishTarget, Publisher};
use sisyphus_lite::scheduler::Scheduler;
use sisyphus_lite::shutdown::install_shutdown_handler;

/// Exit status for configuration errors detected before any job runs.
const CONFIG_ERROR_EXIT: u8 = 1;

#[derive(Parser, Debug)]
#[command(name = "sisyphus-lite")]
#[command(version)]
#[command(about = "Build CUDA package matrices on remote hosts")]
#[command(propagate_version = true)]
struct Args {
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Build every target of a matrix
    Run(RunArgs),

    /// Connect to every inventory host and report whether it answers
    Hosts(HostsArgs),
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Build matrix document (YAML)
    #[arg(long, short = 'm')]
    matrix: PathBuf,

    /// Host inventory document (YAML)
    #[arg(long)]
    hosts: PathBuf,

    /// Maximum number of targets building at once
    #[arg(long, short = 'j', default_value = "4")]
    concurrency: usize,

    /// Total attempts per target, the first one included
    #[arg(long, default_value = "3")]
    max_attempts: u32,

    /// Default timeout of a build step, in seconds
    #[arg(long, default_value = "14400")]
    step_timeout_secs: u64,

    /// Wall-clock limit of a single attempt, in seconds
    #[arg(long, default_value = "28800")]
    job_timeout_secs: u64,

    /// Wall-clock limit of the whole run, in seconds
    #[arg(long)]
    run_timeout_secs: Option<u64>,

    /// Time a cancelled job gets to stop its remote command, in seconds
    #[arg(long, default_value = "15")]
    grace_secs: u64,

    /// Download artifacts into this directory
    #[arg(long)]
    artifact_dir: Option<PathBuf>,

    /// Queue targets no host can build instead of rejecting the matrix
    #[arg(long)]
    allow_unmatched: bool,

    /// Print the resolved matrix and exit without building
    #[arg(long)]
    dry_run: bool,

    /// Output format of the final report
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    /// Also write the JSON report to this file
    #[arg(long)]
    report_file: Option<PathBuf>,

    /// Serve a progress dashboard on this port
    #[arg(long)]
    dashboard_port: Option<u16>,

    #[command(flatten)]
    publish: PublishArgs,
}

#[derive(clap::Args, Debug)]
struct PublishArgs {
    /// Repository to publish results to, as owner/name
    #[arg(long)]
    repo: Option<String>,

    /// Set commit statuses on this commit
    #[arg(long, requires = "repo", conflicts_with_all = ["pr", "release"])]
    commit: Option<String>,

    /// Post a summary comment on this pull request
    #[arg(long, requires = "repo", conflicts_with = "release")]
    pr: Option<u64>,

    /// Upload downloaded artifacts to the release with this tag
    #[arg(long, requires = "repo")]
    release: Option<String>,

    /// API token for the code-hosting service
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(long, default_value = "https://api.github.com")]
    api_url: String,

    #[arg(long, default_value = "https://uploads.github.com")]
    uploads_url: String,

    /// Prefix of commit status contexts
    #[arg(long, default_value = "sisyphus")]
    context_prefix: String,

    /// Upload downloaded packages to this anaconda.org user or organization
    #[arg(long, conflicts_with_all = ["commit", "pr", "release"])]
    channel: Option<String>,

    /// API token for anaconda.org
    #[arg(long, env = "ANACONDA_API_TOKEN", hide_env_values = true)]
    anaconda_token: Option<String>,

    /// Link attached to commit statuses
    #[arg(long)]
    details_url: Option<String>,
}

impl PublishArgs {
    fn target(&self) -> Option<PublishTarget> {
        if let Some(channel) = &self.channel {
            return Some(PublishTarget::Channel {
                channel: channel.clone(),
            });
        }
        let repo = self.repo.clone()?;
        if let Some(sha) = &self.commit {
            Some(PublishTarget::Commit {
                repo,
                sha: sha.clone(),
            })
        } else if let Some(number) = self.pr {
            Some(PublishTarget::PullRequest { repo, number })
        } else {
            self.release
                .as_ref()
                .map(|tag| PublishTarget::Release {
                    repo,
                    tag: tag.clone(),
                })
        }
    }

    /// Client for `target`, if its token was given.
    fn publisher(&self, target: &PublishTarget) -> Option<Publisher> {
        let config = self.config();
        match target {
            PublishTarget::Channel { .. } => {
                let token = self.anaconda_token.clone()?;
                let client = AnacondaClient::new(Secret::new(token));
                Some(Publisher::for_packages(Arc::new(client), config))
            }
            _ => {
                let token = self.token.clone()?;
                let api = GitHubApi::new(&config, Secret::new(token));
                Some(Publisher::new(Arc::new(api), config))
            }
        }
    }

    fn config(&self) -> PublishConfig {
        PublishConfig {
            api_url: self.api_url.clone(),
            uploads_url: self.uploads_url.clone(),
            context_prefix: self.context_prefix.clone(),
            details_url: self.details_url.clone(),
            ..PublishConfig::default()
        }
    }
}

// =============================================================================
// Hosts Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct HostsArgs {
    /// Host inventory document (YAML)
    #[arg(long)]
    hosts: PathBuf,

    /// Connection timeout per host, in seconds
    #[arg(long, default_value = "10")]
    timeout_secs: u64,

    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct HostProbeOutput {
    name: String,
    address: String,
    os: String,
    tags: Vec<String>,
    reachable: bool,
    latency_ms: Option<u64>,
    error: Option<String>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();
}

/// Directory for the ssh multiplexing sockets, removed when the command
/// returns. Kept short; unix socket paths are limited to about 100 bytes.
fn control_dir() -> std::io::Result<ControlDir> {
    ControlDir::create(std::env::temp_dir().join(format!("sisyphus-{}", std::process::id())))
}

fn run_config(args: &RunArgs) -> RunConfig {
    let mut config = RunConfig {
        step_timeout_ms: args.step_timeout_secs * 1000,
        job_timeout_ms: args.job_timeout_secs * 1000,
        cancel_grace_ms: args.grace_secs * 1000,
        strict_capabilities: !args.allow_unmatched,
        retry: RetryConfig {
            max_attempts: args.max_attempts,
            ..RetryConfig::default()
        },
        pool: PoolConfig::default(),
        ..RunConfig::default()
    };
    if let Some(secs) = args.run_timeout_secs {
        config = config.with_run_timeout(Duration::from_secs(secs));
    }
    if let Some(dir) = &args.artifact_dir {
        config = config.with_artifact_dir(dir);
    }
    config
}

fn write_report_file(path: &Path, report: &MatrixReport) {
    let result = report
        .to_json()
        .map_err(|e| e.to_string())
        .and_then(|json| std::fs::write(path, json).map_err(|e| e.to_string()));
    match result {
        Ok(()) => tracing::info!(path = %path.display(), "Wrote report"),
        Err(e) => tracing::error!(path = %path.display(), error = %e, "Failed to write report"),
    }
}

// =============================================================================
// Run Implementation
// =============================================================================

async fn run_matrix(args: RunArgs) -> Result<u8, Box<dyn std::error::Error>> {
    let matrix = BuildMatrix::load(&args.matrix)?;
    if args.dry_run {
        print!("{}", render::render_plan(&matrix));
        return Ok(0);
    }
    let inventory = HostInventory::load(&args.hosts)?;
    let config = run_config(&args);

    // Dropped after the pool has shut its channels down
    let control = control_dir()?;
    let connector = Arc::new(SshConnector::new(control.path(), config.log_limit_bytes));
    let pool = Arc::new(ChannelPool::new(
        inventory.hosts,
        connector,
        config.pool.clone(),
    ));
    let scheduler = Scheduler::new(pool.clone(), config);

    let cancel = install_shutdown_handler();
    let background = CancellationToken::new();
    let health = spawn_health_monitor(pool.clone(), background.clone());

    if let Some(port) = args.dashboard_port {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        let state = DashboardState {
            progress: scheduler.subscribe(),
            pool: pool.clone(),
        };
        tokio::spawn(run_dashboard(addr, state, background.clone()));
    }

    let result = scheduler.run(&matrix, args.concurrency, cancel).await;

    background.cancel();
    let _ = health.await;
    pool.shutdown().await;
    let report = result?;

    match args.output {
        OutputFormat::Json => println!("{}", report.to_json()?),
        OutputFormat::Table => print!("{}", render::render_table(&report)),
    }
    if let Some(path) = &args.report_file {
        write_report_file(path, &report);
    }

    if let Some(target) = args.publish.target() {
        match args.publish.publisher(&target) {
            Some(publisher) => {
                if let Err(e) = publisher.publish(&report, &target).await {
                    tracing::error!(%target, error = %e, "Failed to publish results");
                }
            }
            None => tracing::error!(%target, "No token given, results not published"),
        }
    }

    Ok(report.exit_code())
}

// =============================================================================
// Hosts Implementation
// =============================================================================

async fn probe_host(connector: Arc<SshConnector>, host: HostSpec, timeout: Duration) -> HostProbeOutput {
    let started = Instant::now();
    let result = match connector.connect(&host, timeout).await {
        Ok(mut channel) => {
            let probe = channel.probe(timeout).await;
            channel.close().await;
            probe
        }
        Err(e) => Err(e),
    };
    let (reachable, latency_ms, error) = match result {
        Ok(()) => (true, Some(started.elapsed().as_millis() as u64), None),
        Err(e) => (false, None, Some(e.to_string())),
    };
    HostProbeOutput {
        name: host.name.clone(),
        address: host.destination(),
        os: host.os.to_string(),
        tags: host.capabilities().into_iter().collect(),
        reachable,
        latency_ms,
        error,
    }
}

async fn check_hosts(args: HostsArgs) -> Result<u8, Box<dyn std::error::Error>> {
    let inventory = HostInventory::load(&args.hosts)?;
    let control = control_dir()?;
    let connector = Arc::new(SshConnector::new(control.path(), 64 * 1024));
    let timeout = Duration::from_secs(args.timeout_secs);

    let handles: Vec<_> = inventory
        .hosts
        .into_iter()
        .map(|host| tokio::spawn(probe_host(connector.clone(), host, timeout)))
        .collect();
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await?);
    }

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&results)?),
        OutputFormat::Table => {
            println!("{:<20} {:<28} {:<8} {:<10} TAGS", "HOST", "ADDRESS", "OS", "STATUS");
            println!("{}", "-".repeat(80));
            for r in &results {
                let status = match r.latency_ms {
                    Some(ms) => format!("[+] {}ms", ms),
                    None => "[-] down".to_string(),
                };
                println!(
                    "{:<20} {:<28} {:<8} {:<10} {}",
                    r.name,
                    r.address,
                    r.os,
                    status,
                    r.tags.join(",")
                );
                if let Some(error) = &r.error {
                    println!("    {}", error);
                }
            }
        }
    }

    let down = results.iter().filter(|r| !r.reachable).count();
    Ok(down.min(u8::MAX as usize) as u8)
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let result = match args.command {
        Commands::Run(run_args) => run_matrix(run_args).await,
        Commands::Hosts(hosts_args) => check_hosts(hosts_args).await,
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(CONFIG_ERROR_EXIT)
        }
    }
}
