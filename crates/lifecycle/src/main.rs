//! Lifecycle job runner.
//!
//! Each subcommand runs one operation to completion, prints its report as
//! JSON on stdout and exits. Exit status: 0 on success, 1 when the request
//! was rejected, 2 when configuration or a backend made the run impossible.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use folio_core::config::AppConfig;
use folio_lifecycle::{Lifecycle, LifecycleError, metrics};
use serde::Serialize;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Folio media lifecycle jobs
#[derive(Parser, Debug)]
#[command(name = "folio-lifecycle")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "FOLIO_CONFIG",
        default_value = "config/lifecycle.toml"
    )]
    config: String,

    /// Log output format (logs go to stderr)
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Print Prometheus metrics to stderr after the run
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rebuild the usage ledger from the draft and all version snapshots
    Reindex,
    /// Schedule a media key for deletion after the grace period
    Enqueue {
        /// Media key, e.g. ebooks/book1/img1.png
        key: String,
    },
    /// Run one garbage collection batch
    Gc {
        /// Report what would be deleted without deleting anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Report orphaned objects and usage records without objects
    Audit {
        /// Continue a listing stopped by a previous audit
        #[arg(long)]
        resume_token: Option<String>,
    },
    /// Inspect or requeue deletions that exhausted their attempts
    DeadLetters {
        #[command(subcommand)]
        command: DeadLetterCommand,
    },
    /// Check metadata and storage connectivity
    Health,
}

#[derive(Subcommand, Debug)]
enum DeadLetterCommand {
    List {
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
    Requeue {
        key: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_format);

    let result = run(&args).await;

    if args.metrics {
        match metrics::encode() {
            Ok(text) => eprint!("{text}"),
            Err(e) => tracing::warn!(error = %e, "Failed to encode metrics"),
        }
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let fatal = e
                .downcast_ref::<LifecycleError>()
                .is_none_or(LifecycleError::is_fatal);
            let code = e
                .downcast_ref::<LifecycleError>()
                .map_or("startup_error", LifecycleError::code);
            tracing::error!(error = %format!("{e:#}"), code, fatal, "Lifecycle run failed");
            if fatal {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sqlx=warn,aws_config=warn".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

fn load_config(path: &str) -> Result<AppConfig> {
    let config_path = std::path::Path::new(path);
    let mut figment = Figment::new();
    let has_config_file = config_path.exists();

    if has_config_file {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path);
    }

    let has_env_config =
        std::env::vars().any(|(key, _)| key.starts_with("FOLIO_") && key != "FOLIO_CONFIG");

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: folio-lifecycle --config /path/to/lifecycle.toml <command>\n  \
             2. Environment variables: FOLIO_STORAGE__TYPE=filesystem \
             FOLIO_STORAGE__PATH=/var/lib/folio/media folio-lifecycle <command>\n\n\
             See config/lifecycle.example.toml for example configuration."
        );
    }

    figment
        .merge(Env::prefixed("FOLIO_").split("__"))
        .extract()
        .context("failed to load configuration")
}

async fn run(args: &Args) -> Result<()> {
    tracing::info!("Folio lifecycle v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;
    metrics::register_metrics();
    let lifecycle = Lifecycle::from_config(&config).await?;

    match &args.command {
        Command::Reindex => print_json(&lifecycle.reindex_now().await?),
        Command::Enqueue { key } => print_json(&lifecycle.enqueue_deletion(key).await?),
        Command::Gc { dry_run } => {
            let dry_run = *dry_run || lifecycle.config().dry_run;
            let now = time::OffsetDateTime::now_utc();
            print_json(&lifecycle.run_gc_batch_at(now, dry_run).await?)
        }
        Command::Audit { resume_token } => {
            print_json(&lifecycle.run_audit(resume_token.as_deref()).await?)
        }
        Command::DeadLetters { command } => match command {
            DeadLetterCommand::List { limit } => {
                print_json(&lifecycle.list_dead_letters(*limit).await?)
            }
            DeadLetterCommand::Requeue { key } => {
                print_json(&lifecycle.requeue_dead_letter(key).await?)
            }
        },
        Command::Health => print_json(&lifecycle.health_check().await?),
    }
}

fn print_json<T: Serialize>(report: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("failed to render report")?;
    println!("{json}");
    Ok(())
}
