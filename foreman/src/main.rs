//! Parallel coding-agent orchestrator.
//!
//! Deploys one worker per work item into an isolated git worktree, watches
//! their health, and makes sure every completed item ends with a pull request.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use foreman::core::types::{AgentStatus, StatusEvent};
use foreman::exit_codes;
use foreman::io::config::{ForemanConfig, config_path, load_config, write_config};
use foreman::io::hosting::GhCli;
use foreman::io::instructions::INSTRUCTIONS_FILE;
use foreman::io::process::kill_stray_workers;
use foreman::io::worker::ClaudeCli;
use foreman::logging;
use foreman::orchestrator::Orchestrator;

#[derive(Parser)]
#[command(
    name = "foreman",
    version,
    about = "Run coding agents in parallel, one git worktree per work item"
)]
struct Cli {
    /// Project root (a git checkout). Defaults to the current directory.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// More diagnostics on stderr (`-v` info, `-vv` debug). `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `.foreman/config.toml` with defaults if missing.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Deploy agents for the given work items and wait for them to finish.
    Deploy {
        #[arg(required = true)]
        items: Vec<u64>,
        /// Extra instructions passed to every worker.
        #[arg(long)]
        context: Option<String>,
        /// Restart agents the health monitor flags.
        #[arg(long)]
        auto_restart: bool,
    },
    /// Destroy workspaces and branches that no agent owns.
    Sweep {
        /// Also forget finished agents from earlier runs first.
        #[arg(long)]
        drop_inactive: bool,
    },
    /// Print persisted agent records as JSON.
    Status,
    /// Show the branch, pending changes, and diff of an item's workspace.
    Inspect { item: u64 },
    /// Kill worker processes that outlived their orchestrator.
    KillStrays,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Deploy {
            items,
            context,
            auto_restart,
        } => cmd_deploy(&root, items, context, auto_restart).await,
        Command::Sweep { drop_inactive } => cmd_sweep(&root, drop_inactive).await,
        Command::Status => cmd_status(&root),
        Command::Inspect { item } => cmd_inspect(&root, item).await,
        Command::KillStrays => cmd_kill_strays().await,
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let path = config_path(root);
    if !force && path.exists() {
        println!("{} already exists", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(&path, &ForemanConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn open(root: &Path) -> Result<Orchestrator> {
    let config = load_config(&config_path(root))?;
    let hosting = Arc::new(GhCli::new(root));
    let launcher = Arc::new(ClaudeCli::new(config.worker.clone()));
    Orchestrator::new(root, config, hosting, launcher, true)
}

async fn cmd_deploy(
    root: &Path,
    items: Vec<u64>,
    context: Option<String>,
    auto_restart: bool,
) -> Result<i32> {
    let orchestrator = open(root)?;
    let sweep = orchestrator.startup_sweep().await;
    if !sweep.destroyed.is_empty() {
        println!("swept orphaned workspaces: {:?}", sweep.destroyed_ids());
    }

    let outcomes = track_outcomes(orchestrator.manager().subscribe());
    let background = orchestrator.start_background(auto_restart);

    let mut deploys = JoinSet::new();
    for item_id in items.iter().copied() {
        let orchestrator = orchestrator.clone();
        let context = context.clone();
        deploys.spawn(async move { (item_id, orchestrator.deploy(item_id, context).await) });
    }
    let mut deploy_failed = false;
    while let Some(joined) = deploys.join_next().await {
        let (item_id, result) = joined.context("deploy task panicked")?;
        match result {
            Ok(agent) => println!("#{item_id}: {} in {}", agent.status, agent.workspace.display()),
            Err(err) => {
                deploy_failed = true;
                eprintln!("#{item_id}: deploy failed: {err:#}");
            }
        }
    }

    let settled = tokio::select! {
        _ = orchestrator.run_until_settled() => true,
        _ = tokio::signal::ctrl_c() => false,
    };
    background.stop().await;
    if !settled {
        eprintln!("interrupted, stopping agents");
        orchestrator.shutdown().await;
        return Ok(exit_codes::INTERRUPTED);
    }

    // Let the tracker catch up with the last events.
    tokio::task::yield_now().await;
    let outcomes = outcomes.lock().clone();
    let mut agent_failed = deploy_failed;
    for item_id in &items {
        match outcomes.get(item_id) {
            Some((status, detail)) => {
                println!(
                    "#{item_id}: {status}{}",
                    detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default()
                );
                agent_failed |= *status != AgentStatus::Completed;
            }
            None => agent_failed = true,
        }
    }
    for item_id in &items {
        if let Some(artifact) = orchestrator.reconciler().artifact(*item_id)
            && let Some(url) = &artifact.url
        {
            println!("#{item_id}: {url}");
        }
    }

    let failures = orchestrator.reconciler().failures();
    for failure in &failures {
        eprintln!("{failure}");
    }
    if agent_failed {
        Ok(exit_codes::AGENT_FAILED)
    } else if !failures.is_empty() {
        Ok(exit_codes::RECONCILE_FAILED)
    } else {
        Ok(exit_codes::OK)
    }
}

type Outcomes = Arc<Mutex<BTreeMap<u64, (AgentStatus, Option<String>)>>>;

/// Remember the last terminal status of each item; completed agents are
/// forgotten once cleaned up, so the event stream is the only record.
fn track_outcomes(mut events: broadcast::Receiver<StatusEvent>) -> Outcomes {
    let outcomes: Outcomes = Arc::default();
    let sink = Arc::clone(&outcomes);
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if event.status.is_terminal() {
                        sink.lock().insert(event.item_id, (event.status, event.detail));
                    } else {
                        sink.lock().remove(&event.item_id);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "status events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    outcomes
}

async fn cmd_sweep(root: &Path, drop_inactive: bool) -> Result<i32> {
    let orchestrator = open(root)?;
    if drop_inactive {
        orchestrator.drop_inactive().await;
    }
    let report = orchestrator.startup_sweep().await;
    println!("kept: {:?}", report.kept);
    println!("destroyed: {:?}", report.destroyed_ids());
    for error in &report.errors {
        eprintln!("{error}");
    }
    Ok(if report.errors.is_empty() {
        exit_codes::OK
    } else {
        exit_codes::INVALID
    })
}

fn cmd_status(root: &Path) -> Result<i32> {
    let orchestrator = open(root)?;
    let records = orchestrator.manager().records();
    let payload = serde_json::to_string_pretty(&records).context("serialize agent records")?;
    println!("{payload}");
    Ok(exit_codes::OK)
}

async fn cmd_inspect(root: &Path, item_id: u64) -> Result<i32> {
    let orchestrator = open(root)?;
    let Some(summary) = orchestrator.provisioner().inspect(item_id).await? else {
        println!("#{item_id}: no workspace");
        return Ok(exit_codes::INVALID);
    };
    println!("#{item_id}: {}", summary.path.display());
    println!("branch: {}", summary.branch.as_deref().unwrap_or("(detached)"));
    for change in &summary.changes {
        println!("{} {}", change.code, change.path);
    }
    if !summary.diff_stat.trim().is_empty() {
        println!("{}", summary.diff_stat.trim_end());
    }
    Ok(exit_codes::OK)
}

/// Workers are matched by the instructions file their prompt names, which
/// no other process should carry on its command line.
async fn cmd_kill_strays() -> Result<i32> {
    let killed = kill_stray_workers(INSTRUCTIONS_FILE).await?;
    println!("{}", if killed { "killed stray workers" } else { "no stray workers" });
    Ok(exit_codes::OK)
}
