//! abs-kosync entry point
//!
//! `run` (the default) supervises two copies of this binary: one running
//! `daemon`, one running `web`. `check` tests every configured service once.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::FutureExt;
use tracing::{error, info};

use abs_kosync::config::{Config, ConfigOverrides};
use abs_kosync::daemon::{self, Daemon};
use abs_kosync::supervisor::{ChildSpec, ShutdownSignals, Supervisor};
use abs_kosync::web;

#[derive(Parser)]
#[command(name = "abs-kosync")]
#[command(about = "Sync reading progress between Audiobookshelf, KOSync and Storyteller")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "ABS_KOSYNC_CONFIG", default_value = "abs-kosync.toml", global = true)]
    config: PathBuf,

    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Start the sync daemon and the web server and supervise both (default)
    Run,
    /// Run the sync daemon in the foreground
    Daemon,
    /// Run the web server in the foreground
    Web,
    /// Check connectivity to every configured service and exit
    Check,
}

impl Command {
    fn process_name(&self) -> &'static str {
        match self {
            Command::Run => "supervisor",
            Command::Daemon => "daemon",
            Command::Web => "web",
            Command::Check => "check",
        }
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let level = std::env::var("LOG_LEVEL")
        .ok()
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
        .to_lowercase();

    let filter = match std::env::var("RUST_LOG") {
        Ok(rust_log) if !rust_log.trim().is_empty() => tracing_subscriber::EnvFilter::new(rust_log),
        _ => tracing_subscriber::EnvFilter::new("warn")
            .add_directive(format!("abs_kosync={}", level).parse()?),
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run);

    let mut config = Config::load(&cli.config)?;
    config.apply_overrides(cli.overrides);

    info!(
        process = command.process_name(),
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "Starting abs-kosync"
    );

    match command {
        Command::Run => run_supervisor(&cli.config, &config).await,
        Command::Daemon => run_daemon(config).await,
        Command::Web => {
            let signals = ShutdownSignals::install().context("Cannot install signal handlers")?;
            web::serve(&config, signals.recv().map(|_| ())).await
        }
        Command::Check => {
            config.validate_for_daemon()?;
            let services = daemon::build_services(&config).await;
            if daemon::connectivity_checks(&services).await {
                info!("All services reachable");
                Ok(())
            } else {
                error!("One or more services unreachable");
                std::process::exit(1);
            }
        }
    }
}

async fn run_supervisor(config_path: &Path, config: &Config) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("Cannot locate own executable")?;
    let self_command = |subcommand: &str| -> Vec<String> {
        vec![
            exe.to_string_lossy().into_owned(),
            "--config".to_string(),
            config_path.to_string_lossy().into_owned(),
            subcommand.to_string(),
        ]
    };

    let sup = &config.supervisor;
    let daemon_cmd = sup.daemon_command.clone().unwrap_or_else(|| self_command("daemon"));
    let web_cmd = sup.web_command.clone().unwrap_or_else(|| self_command("web"));

    let supervisor = Supervisor::new(
        ChildSpec::from_command("daemon", &daemon_cmd)?,
        ChildSpec::from_command("web", &web_cmd)?,
        sup,
    );

    let signals = ShutdownSignals::install().context("Cannot install signal handlers")?;
    let outcome = supervisor.run(signals.recv()).await?;
    let code = outcome.exit_code();
    info!(?outcome, code, "Supervisor exiting");
    std::process::exit(code);
}

async fn run_daemon(config: Config) -> anyhow::Result<()> {
    config.validate_for_daemon()?;
    let services = daemon::build_services(&config).await;
    let signals = ShutdownSignals::install().context("Cannot install signal handlers")?;
    Daemon::new(&config, services)
        .run(signals.recv().map(|_| ()))
        .await
}
