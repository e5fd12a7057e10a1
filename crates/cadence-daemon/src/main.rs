use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use cadence_core::config::{CadenceConfig, DEFAULT_LOG_FILTER};
use cadence_core::Node;
use cadence_scheduler::schedule::parse_time_of_day;
use cadence_scheduler::{open_store, IntervalUnit, Job, TaskScheduler, SCRIPT_NODE};
use chrono::Weekday;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

mod control;
mod executor;

use control::{ControlRequest, ControlResponse};
use executor::{ShellExecutor, SHELL_NODE};

#[derive(Parser)]
#[command(name = "cadence", version, about = "Persistent repeating job scheduler")]
struct Cli {
    /// Config file (defaults to $CADENCE_CONFIG, then ~/.cadence/cadence.toml).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run scheduled jobs until interrupted.
    Run,
    /// Schedule a new job.
    Add(AddArgs),
    /// Delete a job.
    Remove { name: String },
    /// List every job with its next due time.
    List,
    /// Print the stored document of one job.
    Get { name: String },
}

#[derive(Args)]
struct AddArgs {
    #[arg(long)]
    name: String,

    #[arg(long)]
    description: Option<String>,

    /// Repeat every N units.
    #[arg(long, conflicts_with = "weekday")]
    every: Option<i64>,

    /// seconds, minutes, hours or days.
    #[arg(long, default_value = "minutes")]
    unit: String,

    /// Repeat weekly on this day (e.g. monday).
    #[arg(long, requires = "time")]
    weekday: Option<String>,

    /// Time of day for --weekday, HH:MM UTC.
    #[arg(long)]
    time: Option<String>,

    /// Shell command line; repeat for several steps.
    #[arg(long = "command", required = true)]
    commands: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .init();

    let cli = Cli::parse();

    // config: --config > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config_path = cli.config.or_else(|| std::env::var("CADENCE_CONFIG").ok());
    let config = CadenceConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });

    let store_config = &config.scheduler.store;
    ensure_parent_dir(&store_config.path);
    info!(mode = ?store_config.mode, path = %store_config.path, "opening job store");
    let store = open_store(store_config)?;
    let executor = Arc::new(ShellExecutor::new(&config.shell));
    let scheduler = TaskScheduler::new(store, executor);
    let socket = control::socket_path(store_config);

    let request = match cli.command {
        Command::Run => return run(scheduler, &socket).await,
        Command::Add(args) => ControlRequest::Add {
            job: build_job(args)?.to_node(),
        },
        Command::Remove { name } => ControlRequest::Remove { name },
        Command::List => ControlRequest::List,
        Command::Get { name } => ControlRequest::Get { name },
    };

    match control::dispatch(&socket, &scheduler, request).await? {
        ControlResponse::Added { job } => println!("{}", serde_json::to_string_pretty(&job)?),
        ControlResponse::Removed { name } => println!("removed {name}"),
        ControlResponse::Jobs { jobs } => println!("{}", serde_json::to_string_pretty(&jobs)?),
        ControlResponse::Job { node } => println!("{}", serde_json::to_string_pretty(&node)?),
        ControlResponse::Error { msg, .. } => bail!(msg),
    }

    Ok(())
}

/// Own the store until Ctrl-C. The control socket is claimed before the
/// store is read, so a concurrent `add` either reaches this daemon or is
/// on disk before the load.
async fn run(scheduler: TaskScheduler, socket: &Path) -> anyhow::Result<()> {
    let listener = control::bind(socket).await?;
    let scheduler = Arc::new(scheduler);
    if let Err(e) = scheduler.start().await {
        let _ = std::fs::remove_file(socket);
        return Err(e.into());
    }
    if let Some((name, due)) = scheduler.next_due().await {
        info!(job = %name, due = %due, "next job");
    }

    let server = tokio::spawn(control::serve(listener, Arc::clone(&scheduler)));
    info!(socket = %socket.display(), "accepting control requests");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    server.abort();
    scheduler.stop().await;
    let _ = std::fs::remove_file(socket);
    Ok(())
}

fn build_job(args: AddArgs) -> anyhow::Result<Job> {
    let script = Node::new(SCRIPT_NODE).with_children(
        args.commands
            .into_iter()
            .map(|line| Node::new(SHELL_NODE).with_value(line)),
    );

    let job = match (args.every, args.weekday) {
        (Some(count), None) => {
            let unit: IntervalUnit = args.unit.parse()?;
            Job::every(args.name, args.description, script, unit, count)?
        }
        (None, Some(day)) => {
            let day: Weekday = day
                .parse()
                .map_err(|_| anyhow!("unknown weekday '{day}'"))?;
            let time = args.time.context("--weekday requires --time")?;
            let (hour, minute) =
                parse_time_of_day(&time).ok_or_else(|| anyhow!("time '{time}' is not HH:MM"))?;
            Job::weekly(args.name, args.description, script, day, hour, minute)?
        }
        _ => bail!("give either --every N or --weekday DAY --time HH:MM"),
    };
    Ok(job)
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
