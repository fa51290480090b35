use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use conductor::agent::AgentId;
use conductor::config::Config;
use conductor::core::{ScheduleAnalysis, TaskId, TaskPlan};
use conductor::events::{EventSink, EventStream};
use conductor::orchestration::{Orchestrator, Snapshot};
use conductor::transport::TransportListener;
use conductor::Result;

/// Conductor - coordinate a pool of AI coding agents over a task graph
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Configuration file (defaults to ~/.conductor/conductor.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the orchestrator on a local socket
    Serve {
        /// Socket path (overrides the configuration)
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Task plan to load before accepting workers
        #[arg(long)]
        plan: Option<PathBuf>,

        /// Worker processes to launch (0 waits for external workers)
        #[arg(long, short = 'w', default_value_t = 0)]
        workers: usize,

        /// Restore from this snapshot at startup and save to it on shutdown
        #[arg(long)]
        state: Option<PathBuf>,
    },

    /// Validate a task plan and print its schedule
    Plan {
        /// Plan file (TOML or JSON)
        file: PathBuf,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ConfigAction {
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long, short = 'f')]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let _guard = conductor::log::init_with_debug(cli.debug);

    match cli.command {
        Command::Serve {
            socket,
            plan,
            workers,
            state,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(socket) = socket {
                config.socket_path = Some(socket.to_string_lossy().into_owned());
            }
            config.validate()?;
            run_serve(config, plan, workers, state)
        }
        Command::Plan { file } => run_plan(&file),
        Command::Config { action } => run_config(action, cli.config),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn run_serve(
    config: Config,
    plan: Option<PathBuf>,
    workers: usize,
    state: Option<PathBuf>,
) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let config = Arc::new(config);
        let (events, stream) = EventSink::channel(config.event_buffer);
        spawn_event_logger(stream);

        let orchestrator = Orchestrator::new(config.clone(), events)?;

        if let Some(path) = state.as_deref().filter(|p| p.exists()) {
            orchestrator.restore(Snapshot::load(path)?).await?;
            info!(path = %path.display(), "snapshot restored");
        }
        if let Some(path) = &plan {
            let added = orchestrator.load_plan(&TaskPlan::load(path)?).await?;
            info!(path = %path.display(), added, "plan loaded");
        }

        let socket = config.socket_path()?;
        let listener = TransportListener::bind(&socket, config.transport.max_frame_len)?;
        eprintln!("conductor listening on {}", socket.display());

        for n in 1..=workers {
            let agent = AgentId::new(format!("worker-{}", n));
            if let Err(e) = orchestrator.spawn_worker(&agent).await {
                error!(%agent, error = %e, "failed to launch worker");
                eprintln!("failed to launch {}: {}", agent, e);
            }
        }

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received");
                shutdown.cancel();
            }
        });

        orchestrator.clone().run(listener, cancel).await?;

        if let Some(path) = &state {
            orchestrator.snapshot().await.save(path)?;
            info!(path = %path.display(), "snapshot saved");
        }
        let status = orchestrator.status().await;
        println!("{}", serde_json::to_string_pretty(&status)?);
        Ok(())
    })
}

/// Mirror the event stream into the log.
fn spawn_event_logger(stream: EventStream) {
    let spawned = thread::Builder::new()
        .name("conductor-events".into())
        .spawn(move || {
            for event in stream.iter() {
                match serde_json::to_string(&event) {
                    Ok(line) if event.is_fatal() => error!(target: "conductor::events", "{}", line),
                    Ok(line) => info!(target: "conductor::events", "{}", line),
                    Err(e) => warn!(error = %e, "unserializable event"),
                }
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "event logger not started");
    }
}

#[derive(Serialize)]
struct PlanReport {
    tasks: usize,
    dependencies: usize,
    executable: Vec<TaskId>,
    order: Vec<TaskId>,
    critical_path: Vec<TaskId>,
    makespan_secs: f64,
}

fn run_plan(file: &Path) -> Result<()> {
    let dag = TaskPlan::load(file)?.into_dag()?;
    let ScheduleAnalysis {
        order,
        critical_path,
        total_duration,
        ..
    } = dag.analyze_schedule()?;

    let report = PlanReport {
        tasks: dag.task_count(),
        dependencies: dag.dependency_count(),
        executable: dag.get_executable_tasks().into_iter().collect(),
        order,
        critical_path,
        makespan_secs: total_duration.as_secs_f64(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_config(action: ConfigAction, path: Option<PathBuf>) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => Config::config_path()?,
    };
    match action {
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                println!("{} already exists (use --force to overwrite)", path.display());
                return Ok(());
            }
            Config::default().save_to(&path)?;
            println!("wrote {}", path.display());
        }
        ConfigAction::Show => {
            let config = if path.exists() {
                Config::load_from(&path)?
            } else {
                Config::default()
            };
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }
    Ok(())
}
