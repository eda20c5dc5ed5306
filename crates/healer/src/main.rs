//! Deploy Healer CLI
//!
//! Runs the deployment-failure remediation server, and offers one-shot
//! commands for validating a proposed change set and recovering stale guards.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use deploy_healer::collaborators::Collaborators;
use deploy_healer::guard::ConcurrencyGuard;
use deploy_healer::intake::Intake;
use deploy_healer::orchestrator::Orchestrator;
use deploy_healer::server::{self, ServerState};
use deploy_healer::store::{FileStore, MemoryStore, RemediationStore};
use deploy_healer::validator::ChangeValidator;
use deploy_healer::worker::{CycleQueue, CycleRegistry, Worker};
use deploy_healer::{HealerConfig, ProposedEdit};

/// Deployment-failure remediation loop
#[derive(Parser)]
#[command(name = "deploy-healer")]
#[command(about = "Detects failed deployments, proposes validated fixes and redeploys")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log output format (json or text)
    #[arg(long, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Path to the JSON configuration file
    #[arg(long, env = "HEALER_CONFIG", global = true)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum LogFormat {
    Json,
    #[default]
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server, cycle worker and stale-guard sweeper
    Server {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:8080", env = "HEALER_ADDR")]
        addr: String,

        /// JSON file for durable state (overrides the config file)
        #[arg(long, env = "HEALER_STORE")]
        store: Option<PathBuf>,

        /// Kill switch: accept no remediation work
        #[arg(long, env = "HEALER_DISABLED")]
        disabled: bool,
    },
    /// Run the change validator over a JSON list of `{path, newContent}`
    Validate {
        /// File holding the proposed edits
        edits: PathBuf,
    },
    /// Reset stale guards in the file store once and exit
    Recover {
        /// JSON state file (overrides the config file)
        #[arg(long, env = "HEALER_STORE")]
        store: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = match &cli.config {
        Some(path) => HealerConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => HealerConfig::default(),
    };

    match cli.command {
        Commands::Server {
            addr,
            store,
            disabled,
        } => {
            if let Some(store) = store {
                config.store_path = Some(store);
            }
            if disabled {
                config.enabled = false;
            }
            run_server_command(&addr, config).await?;
        }
        Commands::Validate { edits } => {
            let accepted = run_validate_command(&edits, &config)?;
            if !accepted {
                std::process::exit(1);
            }
        }
        Commands::Recover { store } => {
            if let Some(store) = store {
                config.store_path = Some(store);
            }
            run_recover_command(&config).await?;
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "deploy_healer=info,tower_http=info".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn open_store(config: &HealerConfig) -> Result<Arc<dyn RemediationStore>> {
    let store: Arc<dyn RemediationStore> = match &config.store_path {
        Some(path) => Arc::new(
            FileStore::open(path)
                .await
                .with_context(|| format!("Failed to open state file {}", path.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };
    for project in &config.projects {
        store
            .upsert_project(project.clone())
            .await
            .with_context(|| format!("Failed to register project {}", project.id))?;
    }
    Ok(store)
}

/// Run the remediation server until ctrl-c.
async fn run_server_command(addr: &str, config: HealerConfig) -> Result<()> {
    println!("{}", "═".repeat(60).cyan());
    println!("{}", "DEPLOY HEALER REMEDIATION SERVER".cyan().bold());
    println!("{}", "═".repeat(60).cyan());
    println!();
    println!("  Address:      {}", addr.green());
    println!(
        "  Remediation:  {}",
        if config.enabled {
            "enabled".green()
        } else {
            "disabled".red()
        }
    );
    println!("  Max Attempts: {}", config.max_attempts);
    println!("  Retries:      {}", config.retry.max_retries);
    println!(
        "  Storage:      {}",
        config
            .store_path
            .as_ref()
            .map_or_else(|| "memory".to_string(), |p| p.display().to_string())
            .cyan()
    );
    println!("  Projects:     {}", config.projects.len());
    println!();

    let store = open_store(&config).await?;
    let collaborators = Collaborators::http(&config.collaborators)
        .context("Failed to build collaborator clients")?;
    let platform = Arc::clone(&collaborators.platform);

    let sweep_interval = config.stale_sweep_interval();
    let queue_capacity = config.queue_capacity;
    let enabled = config.enabled;
    let max_attempts = config.max_attempts;

    let orchestrator = Arc::new(
        Orchestrator::new(config, Arc::clone(&store), collaborators)
            .context("Failed to initialize orchestrator")?,
    );

    let shutdown = CancellationToken::new();
    let registry = CycleRegistry::default();
    let (queue, jobs) = CycleQueue::bounded(queue_capacity);
    let worker = Arc::new(Worker::new(
        orchestrator,
        ConcurrencyGuard::new(Arc::clone(&store)),
        registry.clone(),
        shutdown.clone(),
    ));

    let worker_task = tokio::spawn(Arc::clone(&worker).run(jobs));
    let sweeper_task = tokio::spawn(Arc::clone(&worker).run_sweeper(sweep_interval));

    let state = Arc::new(ServerState {
        intake: Intake::new(enabled, Arc::clone(&store), platform, queue),
        store,
        registry,
        max_attempts,
    });

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {e}");
            return;
        }
        info!("Shutdown requested, cancelling live cycles");
        signal_token.cancel();
    });

    println!("{}", format!("Starting server on {addr}...").cyan());
    let served = server::run_server(state, addr, shutdown.clone()).await;

    // the worker drains even when the listener failed
    shutdown.cancel();
    if let Err(e) = worker_task.await {
        error!("Worker task failed: {e}");
    }
    if let Err(e) = sweeper_task.await {
        error!("Sweeper task failed: {e}");
    }

    served.context("HTTP server failed")?;
    println!("{}", "Server stopped".cyan());
    Ok(())
}

/// Print the validator's verdict. Returns false on rejection.
fn run_validate_command(path: &Path, config: &HealerConfig) -> Result<bool> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let edits: Vec<ProposedEdit> =
        serde_json::from_str(&content).context("Failed to parse proposed edits")?;
    let validator =
        ChangeValidator::with_policy(&config.validator).context("Invalid validator policy")?;

    match validator.validate(&edits) {
        Ok(()) => {
            println!(
                "{} {} file(s) accepted",
                "✓".green().bold(),
                edits.len()
            );
            for edit in &edits {
                println!("  {}", edit.path);
            }
            Ok(true)
        }
        Err(rejection) => {
            println!("{} change set rejected", "✗".red().bold());
            println!("  File:   {}", rejection.path.yellow());
            println!("  Kind:   {:?}", rejection.kind);
            println!("  Reason: {}", rejection.reason);
            Ok(false)
        }
    }
}

/// One stale-guard sweep against the file store.
async fn run_recover_command(config: &HealerConfig) -> Result<()> {
    if config.store_path.is_none() {
        warn!("No store configured; in-memory state has nothing to recover");
        println!("{}", "No state file configured (use --store)".yellow());
        return Ok(());
    }

    let store = open_store(config).await?;
    let guard = ConcurrencyGuard::new(store);
    // no cycles run in this process, so every old guard is stale
    let recovered = guard
        .recover_stale(config.stale_guard_timeout(), &HashSet::new())
        .await
        .context("Stale-guard recovery failed")?;

    if recovered.is_empty() {
        println!("{}", "No stale guards found".green());
    } else {
        println!("{}", serde_json::to_string_pretty(&recovered)?);
    }
    Ok(())
}
