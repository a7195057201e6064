// ABOUTME: Main entry point for the slackline terminal client
// ABOUTME: Parses the CLI, initializes logging and config, then runs the host on a single-threaded runtime

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use slackline::{config::Config, paths, Host, TerminalView};
use std::rc::Rc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[derive(Debug, Parser)]
#[command(name = "slackline", version, about = "Keep a terminal view of Slack workspaces in sync")]
struct Cli {
    /// Path to config.toml (overrides the search path)
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Write the log file as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect every configured workspace and stream messages (default)
    Run,
    /// Load and validate the configuration, then exit
    CheckConfig,
}

/// Log to a daily file under the data dir; warnings also go to stderr.
fn init_logging(json: bool) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = paths::log_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "slackline.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(non_blocking)
            .boxed()
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    Ok(guard)
}

fn main() -> Result<()> {
    // Set up panic hook to log panics before they crash the process
    std::panic::set_hook(Box::new(|panic_info| {
        tracing::error!(panic = %panic_info, "slackline panicked");
        eprintln!("{}", panic_info);
        eprintln!("\nBacktrace:");
        eprintln!("{:?}", std::backtrace::Backtrace::force_capture());
    }));

    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    if let Some(path) = &cli.config {
        std::env::set_var("SLACKLINE_CONFIG_PATH", path);
    }

    let _guard = init_logging(cli.json_logs)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting slackline");

    let config = Config::load().context("Failed to load configuration")?;
    tracing::info!(
        workspaces = config.workspaces.len(),
        display_thread_replies = config.history.display_thread_replies,
        history_page_limit = config.history.history_page_limit,
        "Configuration loaded"
    );

    match cli.command.unwrap_or(Command::Run) {
        Command::CheckConfig => {
            for workspace in &config.workspaces {
                println!(
                    "{}: timeout {}s, ping every {}s",
                    workspace.name, workspace.network_timeout_secs, workspace.ping_interval_secs
                );
            }
            println!("Configuration OK ({} workspaces)", config.workspaces.len());
            Ok(())
        }
        Command::Run => run(config),
    }
}

fn run(config: Config) -> Result<()> {
    if config.workspaces.is_empty() {
        anyhow::bail!("No workspaces configured (add [[workspace]] to config.toml or set SLACK_TOKEN)");
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let local = tokio::task::LocalSet::new();

    local.block_on(&runtime, async move {
        let view = Rc::new(TerminalView::new(std::io::stdout()));
        let host = Host::new(&config, view)?;
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
            }
        };
        host.run(shutdown).await
    })?;

    tracing::info!("slackline stopped");
    Ok(())
}
