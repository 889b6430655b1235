//! `crewly` — run the agent-session control plane as a standalone process.
//!
//! Grounded on the teacher's `main.rs` (clap-derive `Cli`, a
//! `tracing_subscriber` registry wired from `-v`/`RUST_LOG`), scaled down
//! from the teacher's full `CliRunner` dispatch to the subset this crate's
//! scope covers: starting the control plane, inspecting its state, and
//! driving sessions directly for local testing.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crewly::{CrewlyConfig, CrewlyRuntime};
use ai_session::{RuntimeType, SessionOptions};

#[derive(Parser)]
#[command(name = "crewly")]
#[command(about = "Multi-agent orchestration backend: session supervisor, continuation engine, scheduler, and activity monitor")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Verbose (debug-level) logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore persisted sessions and run the control plane until a
    /// SIGINT/SIGTERM, saving state and tearing down all sessions on exit.
    Run,

    /// Print scheduler and notification counters, then exit.
    Status,

    /// Session registry operations.
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// List every session currently registered with the backend.
    List,
    /// Spawn a new session and register it for restart-resume.
    Create {
        name: String,
        #[arg(long, default_value = ".")]
        cwd: std::path::PathBuf,
        #[arg(long)]
        command: String,
        #[arg(long, value_delimiter = ',', default_value = "")]
        args: Vec<String>,
        #[arg(long, value_enum, default_value = "claude-code")]
        runtime_type: RuntimeTypeArg,
    },
    /// Kill a session and deregister it.
    Kill { name: String },
}

#[derive(Clone, clap::ValueEnum)]
enum RuntimeTypeArg {
    ClaudeCode,
    GeminiCli,
    CodexCli,
}

impl From<RuntimeTypeArg> for RuntimeType {
    fn from(value: RuntimeTypeArg) -> Self {
        match value {
            RuntimeTypeArg::ClaudeCode => RuntimeType::ClaudeCode,
            RuntimeTypeArg::GeminiCli => RuntimeType::GeminiCli,
            RuntimeTypeArg::CodexCli => RuntimeType::CodexCli,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = CrewlyConfig::load().context("loading configuration")?;
    let runtime = Arc::new(CrewlyRuntime::bootstrap(config, None));

    match cli.command {
        Commands::Run => run(runtime).await,
        Commands::Status => status(runtime).await,
        Commands::Sessions { action } => sessions(runtime, action).await,
    }
}

fn init_logging(verbose: bool) {
    let log_level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false).compact();
    let filter_layer = tracing_subscriber::EnvFilter::from_default_env().add_directive(log_level.into());
    tracing_subscriber::registry().with(filter_layer).with(fmt_layer).init();
}

async fn run(runtime: Arc<CrewlyRuntime>) -> Result<()> {
    let restored = runtime.start().await.context("starting control plane")?;
    tracing::info!(restored, "control plane started");

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, saving state and tearing down sessions");

    runtime.shutdown().await.context("shutting down control plane")?;
    tracing::info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn status(runtime: Arc<CrewlyRuntime>) -> Result<()> {
    let stats = runtime.scheduler.stats().await;
    let notifications = runtime.notifications.snapshot().await;
    println!("sessions: {}", runtime.backend.count());
    println!(
        "scheduler: pending={} fired_total={} delivery_failures={}",
        stats.pending, stats.fired_total, stats.delivery_failures
    );
    println!("notifications: {}", notifications.len());
    Ok(())
}

async fn sessions(runtime: Arc<CrewlyRuntime>, action: SessionAction) -> Result<()> {
    match action {
        SessionAction::List => {
            for name in runtime.backend.list() {
                println!("{name}");
            }
        }
        SessionAction::Create {
            name,
            cwd,
            command,
            args,
            runtime_type,
        } => {
            let mut options = SessionOptions::new(cwd, command, runtime_type.into());
            options.args = args.into_iter().filter(|a| !a.is_empty()).collect();
            runtime.create_session(&name, options).await.context("creating session")?;
            println!("created {name}");
        }
        SessionAction::Kill { name } => {
            runtime.kill_session(&name).await.context("killing session")?;
            println!("killed {name}");
        }
    }
    Ok(())
}
