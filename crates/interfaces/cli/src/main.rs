mod daemon;
mod history_cmds;
mod session;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

use shellbot_config::AppConfig;

#[derive(Debug, Parser)]
#[command(
    name = "shellbot",
    version,
    about = "A persistent agent daemon with shell tools and threaded history"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the daemon in the foreground until Ctrl-C.
    Daemon,
    /// Send a prompt to the running daemon and stream the reply.
    Ask {
        prompt: String,
        /// Start a fresh thread for this prompt.
        #[arg(long, conflicts_with = "thread")]
        new_thread: bool,
        /// Continue a specific thread instead of the most recent one.
        #[arg(long, value_name = "ID")]
        thread: Option<Uuid>,
    },
    /// Print the text output of every run the daemon performs.
    Watch,
    /// List stored threads, most recently active first.
    Threads,
    /// Print recent interactions of a thread.
    History {
        /// Thread to show (default: most recently active).
        #[arg(long, value_name = "ID")]
        thread: Option<Uuid>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Summarize recorded token usage by model and thread.
    Usage {
        /// Only count runs from the last N days.
        #[arg(long, value_name = "N")]
        since_days: Option<u32>,
        /// Number of threads to list.
        #[arg(long, default_value_t = 5)]
        threads: usize,
    },
    /// Write the effective configuration to the config path.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

/// Default filter from `telemetry.log_level`, overridden by `RUST_LOG`.
fn env_filter(config: &AppConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(&config.telemetry.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// Interactive commands log to stderr.  The daemon also writes a daily file
/// under `<data_dir>/logs`; the returned guard flushes it on drop.
fn init_logging(config: &AppConfig, daemon_mode: bool) -> Result<Option<WorkerGuard>> {
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    if !daemon_mode {
        tracing_subscriber::registry()
            .with(env_filter(config))
            .with(stderr_layer)
            .init();
        return Ok(None);
    }

    let log_dir = config.log_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;
    let appender = tracing_appender::rolling::daily(&log_dir, "shellbot.log");
    let (file_writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(env_filter(config))
        .with(stderr_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();
    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    let _log_guard = init_logging(&config, matches!(cli.command, Commands::Daemon))?;

    match cli.command {
        Commands::Daemon => daemon::run_foreground(config).await?,
        Commands::Ask {
            prompt,
            new_thread,
            thread,
        } => session::run_ask(&config, prompt, new_thread, thread).await?,
        Commands::Watch => session::run_watch(&config).await?,
        Commands::Threads => history_cmds::run_threads(&config).await?,
        Commands::History { thread, limit } => {
            history_cmds::run_history(&config, thread, limit.max(1)).await?
        }
        Commands::Usage { since_days, threads } => {
            history_cmds::run_usage(&config, since_days, threads)?
        }
        Commands::Init { force } => {
            if cli.config.exists() && !force {
                anyhow::bail!(
                    "{} already exists; pass --force to overwrite",
                    cli.config.display()
                );
            }
            config.save_to(&cli.config)?;
            println!("wrote {}", cli.config.display());
        }
    }
    Ok(())
}
