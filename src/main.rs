use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use printfleet::config::Config;
use printfleet::fleet::{Fleet, FleetContext};
use printfleet::metrics;
use printfleet::server::FleetServer;

#[derive(Parser)]
#[command(
    name = "printfleet",
    version,
    about = "Printer fleet scheduler with energy admission control",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file (environment variables are used when absent)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides the configured format
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tracker, energy controller, scheduler and REST API
    Serve {
        /// Override the configured bind address (host:port)
        #[arg(long)]
        bind: Option<String>,

        /// Skip startup reconciliation of interrupted assignments
        #[arg(long, default_value = "false")]
        no_recover: bool,
    },

    /// Load and validate the configuration, then print it
    CheckConfig,

    /// Reconcile interrupted assignments once and print the report
    Recover,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    // Initialize tracing/logging
    setup_tracing(&config.logging.format, &config.logging.level, cli.verbose)?;

    match cli.command {
        Commands::Serve { bind, no_recover } => {
            if let Some(bind) = bind {
                config.server.bind_address = bind
                    .parse()
                    .with_context(|| format!("Invalid bind address: {bind}"))?;
            }
            if no_recover {
                config.scheduler.recover_on_start = false;
            }
            config.validate()?;

            tracing::info!(
                bind = %config.server.bind_address,
                database = %config.database.sqlite_path.display(),
                "Starting serve command"
            );
            serve(config).await?;
        }

        Commands::CheckConfig => {
            config.validate()?;
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{rendered}");
            println!("Configuration is valid.");
        }

        Commands::Recover => {
            config.validate()?;
            tracing::info!(database = %config.database.sqlite_path.display(), "Starting recover command");
            recover(config).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    }
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("printfleet=debug,tower_http=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .or_else(|_| tracing_subscriber::EnvFilter::try_new(format!("printfleet={level},warn")))
            .context("Invalid log level")?
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "Failed to initialize metrics");
    }

    let context = FleetContext::init(config)?;
    let fleet = Fleet::init(context)?;
    let server = FleetServer::new(fleet).context("Failed to create fleet server")?;

    println!("{}", server.info().display());
    println!();
    println!("Press Ctrl+C to stop.\n");

    server
        .start_with_shutdown(shutdown_signal())
        .await
        .context("Fleet server failed")?;

    Ok(())
}

async fn recover(config: Config) -> Result<()> {
    let context = FleetContext::init(config)?;
    let fleet = Fleet::init(context)?;

    let report = fleet
        .scheduler
        .recover()
        .await
        .context("Reconciliation failed")?;

    println!("Reconciliation complete");
    println!("  Replayed: {}", report.replayed.len());
    for entry_id in &report.replayed {
        println!("    {entry_id}");
    }
    println!("  Reverted: {}", report.reverted.len());
    for entry_id in &report.reverted {
        println!("    {entry_id}");
    }
    println!("  Unsignaled jobs: {}", report.unsignaled.len());
    for job_id in &report.unsignaled {
        println!("    {job_id}");
    }

    // Replays queue start signals; let them go out before exiting
    fleet.scheduler.wait_for_starts().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
