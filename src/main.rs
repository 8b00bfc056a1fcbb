use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use herd::config::Config;
use herd::tmux::Tmux;
use herd::tracker::BeadsCli;
use herd::{hlog, hlog_error, DispatchRequest, Error, Orchestrator, Poller, Result};

/// Herd - dispatch and supervise background coding workers
#[derive(Parser, Debug)]
#[command(name = "herd")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    HERD_DEBUG=1    Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.herd/herd.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Repository root workers branch from (defaults to the current directory)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Launch a worker for a task
    Dispatch {
        task_id: String,
        /// Instructions for the worker
        prompt: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        /// Workspace label (defaults to the task id)
        #[arg(long)]
        branch: Option<String>,
        /// Run in the repository root instead of a new worktree
        #[arg(long)]
        no_workspace: bool,
    },

    /// Show a worker's status, recent messages and diff
    Check {
        task_id: String,
        #[arg(long, short = 'n', default_value_t = 10)]
        limit: usize,
    },

    /// Send another message to a worker
    Followup { task_id: String, message: String },

    /// Stop a worker's current operation
    Abort { task_id: String },

    /// Tear down a worker and close its task
    Cleanup {
        task_id: String,
        /// Final tracker status (defaults to the configured close status)
        #[arg(long)]
        status: Option<String>,
    },

    /// List registered workers
    List,

    /// Re-adopt surviving workers and print what was found
    Reconstruct,

    /// Poll workers and print lifecycle events until Ctrl-C
    Watch {
        /// Seconds between polls (defaults to poll_interval_secs)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Print the effective configuration
    Config {
        /// Write the current configuration to ~/.herd/herd.toml
        #[arg(long)]
        init: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    herd::log::init_with_debug(cli.debug);
    if herd::log::is_debug() {
        hlog!("herd starting (debug mode enabled): {:?}", cli.command);
    } else {
        hlog!("herd starting: {:?}", cli.command);
    }

    let rt = tokio::runtime::Runtime::new()?;
    let success = rt.block_on(run(cli))?;
    if !success {
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<bool> {
    let config = Config::load()?;
    if let Command::Config { init } = cli.command {
        return show_config(&config, init);
    }
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };

    if !BeadsCli::new(config.tracker_command(), &root, config.tracker_timeout()).is_available() {
        return Err(Error::Tracker(format!(
            "'{}' not found on PATH",
            config.tracker_command()
        )));
    }
    if matches!(cli.command, Command::Dispatch { .. }) && !Tmux::is_available() {
        return Err(Error::Tmux("tmux not found on PATH".to_string()));
    }

    let orchestrator = Arc::new(Orchestrator::with_real_collaborators(config, root)?);
    let recovered = orchestrator.reconstruct().await;

    match cli.command {
        Command::Reconstruct => {
            print_json(&recovered)?;
            Ok(!recovered.is_degraded())
        }
        Command::Dispatch {
            task_id,
            prompt,
            model,
            provider,
            branch,
            no_workspace,
        } => {
            let request = DispatchRequest {
                task_id,
                prompt,
                model,
                provider,
                branch,
                skip_workspace: no_workspace,
            };
            let outcome = orchestrator.dispatch(request).await;
            print_json(&outcome)?;
            Ok(outcome.is_success())
        }
        Command::Check { task_id, limit } => {
            let outcome = orchestrator.check(&task_id, limit).await;
            print_json(&outcome)?;
            Ok(outcome.is_success())
        }
        Command::Followup { task_id, message } => {
            let outcome = orchestrator.followup(&task_id, &message).await;
            print_json(&outcome)?;
            Ok(outcome.is_success())
        }
        Command::Abort { task_id } => {
            let outcome = orchestrator.abort(&task_id).await;
            print_json(&outcome)?;
            Ok(outcome.is_success())
        }
        Command::Cleanup { task_id, status } => {
            let outcome = orchestrator.cleanup(&task_id, status.as_deref()).await;
            print_json(&outcome)?;
            Ok(outcome.is_success())
        }
        Command::List => {
            print_json(&orchestrator.list().await)?;
            Ok(true)
        }
        Command::Watch { interval } => {
            let interval = interval
                .map(std::time::Duration::from_secs)
                .unwrap_or_else(|| orchestrator.config().poll_interval());
            watch(orchestrator, interval).await?;
            Ok(true)
        }
        Command::Config { .. } => unreachable!("config is handled before startup"),
    }
}

fn show_config(config: &Config, init: bool) -> Result<bool> {
    if init {
        config.save()?;
        hlog!("Wrote {}", Config::config_path()?.display());
    }
    print_json(&serde_json::json!({
        "path": Config::config_path()?,
        "worker_command": config.worker_command(),
        "port_pattern": config.port_pattern(),
        "log_dir": config.log_dir(),
        "tracker_command": config.tracker_command(),
        "claimed_status": config.claimed_status(),
        "close_status": config.close_status(),
        "worker_host": config.worker_host(),
        "default_provider": config.default_provider,
        "default_model": config.default_model,
        "port_timeout_secs": config.port_timeout().as_secs(),
        "http_timeout_secs": config.http_timeout().as_secs(),
        "tracker_timeout_secs": config.tracker_timeout().as_secs(),
        "reconstruct_timeout_secs": config.reconstruct_timeout().as_secs(),
        "poll_interval_secs": config.poll_interval().as_secs(),
    }))?;
    Ok(true)
}

async fn watch(orchestrator: Arc<Orchestrator>, interval: std::time::Duration) -> Result<()> {
    let printer = orchestrator.events().observe(|event| async move {
        println!("{}", serde_json::to_string(&event)?);
        Ok(())
    });

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            hlog_error!("Failed to listen for Ctrl-C: {}", e);
        }
        on_signal.cancel();
    });

    let poller = Poller::new(Arc::clone(&orchestrator));
    poller.run(interval, cancel).await;
    printer.abort();
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
