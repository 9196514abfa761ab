use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use wreckit::agent::{self, install_signal_handlers, CliAgentRunner};
use wreckit::artifact::{self, Paths};
use wreckit::config;
use wreckit::log::parse_log_level;
use wreckit::orchestrator::{self, RunOptions};
use wreckit::permissions::PhaseTag;
use wreckit::state_machine::ItemState;
use wreckit::workflow;
use wreckit::{log_error, log_info};

#[derive(Parser)]
#[command(name = "wreckit", about = "Deterministic, multi-phase software-production workflow engine")]
struct Cli {
    /// Project root directory (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (defaults to {root}/wreckit.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,

    /// Batch mode: maximum number of items to run concurrently
    #[arg(long, default_value = "1", global = true)]
    parallel: u32,

    /// Ignore any existing batch-progress.json and start fresh
    #[arg(long, global = true)]
    no_resume: bool,

    /// Retry items that failed in a previous (resumable) run
    #[arg(long, global = true)]
    retry_failed: bool,

    /// Run the configured agent in dry-run mode (no subprocess spawned)
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive one item through all of its remaining phases
    Run {
        /// Item id, e.g. 001-add-login
        id: String,
    },
    /// Drive exactly one phase for one item
    Phase {
        /// Phase name: research, plan, implement, critique, pr, complete
        phase: String,
        /// Item id, e.g. 001-add-login
        id: String,
    },
}

/// `2`: invocation error (bad args / missing repo). `1`: one or more items
/// failed. `0`: clean. Per the documented CLI contract.
#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = parse_log_level(&cli.log_level).map(wreckit::log::set_log_level) {
        eprintln!("Error: {}", e);
        std::process::exit(2);
    }

    if let Err(e) = install_signal_handlers() {
        eprintln!("Error: {}", e);
        std::process::exit(2);
    }

    let config = match config::load_config_from(cli.config.as_deref(), &cli.root) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    let mut runtime_config = config.clone();
    runtime_config.agent.dry_run = runtime_config.agent.dry_run || cli.dry_run;

    let runner = CliAgentRunner::new(runtime_config.agent.cli.clone(), runtime_config.agent.model.clone());
    if !runtime_config.agent.dry_run {
        if let Err(e) = runner.verify_cli_available() {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    }

    let cancel = CancellationToken::new();
    let cancel_watcher = cancel.clone();
    tokio::spawn(async move {
        loop {
            if agent::is_shutdown_requested() {
                cancel_watcher.cancel();
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    });

    let exit_code = match cli.command {
        None => run_batch(&cli.root, &runtime_config, &cli, runner, cancel).await,
        Some(Commands::Run { id }) => run_single_item(&cli.root, &runtime_config, &id, runner, cancel).await,
        Some(Commands::Phase { phase, id }) => run_single_phase(&cli.root, &runtime_config, &phase, &id, runner, cancel).await,
    };

    std::process::exit(exit_code);
}

async fn run_batch(
    root: &std::path::Path,
    config: &config::WreckitConfig,
    cli: &Cli,
    runner: CliAgentRunner,
    cancel: CancellationToken,
) -> i32 {
    let options = RunOptions {
        parallel: cli.parallel,
        no_resume: cli.no_resume,
        retry_failed: cli.retry_failed,
    };
    match orchestrator::run_batch(root, config, &options, Arc::new(runner), cancel).await {
        Ok(summary) => {
            log_info!(
                "[batch] completed={} failed={} skipped={}",
                summary.completed.len(),
                summary.failed.len(),
                summary.skipped.len()
            );
            if summary.is_clean() {
                0
            } else {
                1
            }
        }
        Err(e) => {
            log_error!("Error: {}", e);
            2
        }
    }
}

async fn run_single_item(
    root: &std::path::Path,
    config: &config::WreckitConfig,
    id: &str,
    runner: CliAgentRunner,
    cancel: CancellationToken,
) -> i32 {
    let paths = Paths::new(root);
    let item = match artifact::read_item(&paths, id) {
        Ok(i) => i,
        Err(e) => {
            log_error!("Error: {}", e);
            return 2;
        }
    };

    let (gateway, _task) = wreckit::gateway::spawn_gateway(root.to_path_buf());
    let mut done_ids = std::collections::HashSet::new();
    done_ids.extend(
        artifact::rebuild_index(&paths)
            .map(|idx| idx.items.into_iter().filter(|i| i.state == ItemState::Done).map(|i| i.id).collect::<Vec<_>>())
            .unwrap_or_default(),
    );

    match workflow::run_item_workflow(item, config, root, &gateway, &runner, &done_ids, &cancel).await {
        Ok(final_item) => {
            log_info!("[{}] ended in state {:?}", id, final_item.state);
            if final_item.state == ItemState::Done {
                0
            } else {
                1
            }
        }
        Err(e) => {
            log_error!("[{}] {}", id, e);
            1
        }
    }
}

async fn run_single_phase(
    root: &std::path::Path,
    config: &config::WreckitConfig,
    phase: &str,
    id: &str,
    runner: CliAgentRunner,
    cancel: CancellationToken,
) -> i32 {
    let tag = match phase {
        "research" => PhaseTag::Research,
        "plan" => PhaseTag::Plan,
        "implement" => PhaseTag::Implement,
        "critique" => PhaseTag::Critique,
        "pr" => PhaseTag::Pr,
        "complete" => PhaseTag::Complete,
        other => {
            log_error!("Error: unknown phase '{}'", other);
            return 2;
        }
    };

    let paths = Paths::new(root);
    let item = match artifact::read_item(&paths, id) {
        Ok(i) => i,
        Err(e) => {
            log_error!("Error: {}", e);
            return 2;
        }
    };

    let (gateway, _task) = wreckit::gateway::spawn_gateway(root.to_path_buf());
    let spec = wreckit::workflow::phase_spec_for_cli(tag, &item);

    match wreckit::phase::run_phase(&spec, &item, config, root, &gateway, &runner, &std::collections::HashMap::new(), None, &cancel).await {
        Ok(outcome) => {
            log_info!("[{}][{}] advanced to {:?}", id, phase, outcome.item.state);
            0
        }
        Err(e) => {
            log_error!("[{}][{}] {}", id, phase, e);
            1
        }
    }
}
