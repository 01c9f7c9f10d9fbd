use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(
    name = "pifleet",
    version,
    about = "Synchronized photo capture across a fleet of Raspberry Pi cameras",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the network and print the devices that would take part in a run
    Discover,

    /// Run a synchronized capture session on real devices over SSH
    Capture {
        /// Session name (remote directory and local output subdirectory)
        #[arg(short, long)]
        session: String,

        /// Number of synchronized captures
        #[arg(short, long)]
        images: Option<u32>,

        /// Device address; skips the network scan (repeatable)
        #[arg(long = "host")]
        hosts: Vec<String>,

        /// Local output directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Abort when any device fails to start its capture process
        #[arg(long, default_value = "false")]
        strict: bool,

        /// Print the run summary as JSON
        #[arg(long, default_value = "false")]
        json: bool,

        /// Write Prometheus metrics to this file after the run
        #[arg(long)]
        metrics_out: Option<PathBuf>,
    },

    /// Run the full capture lifecycle against a simulated fleet
    Simulate {
        /// Session name
        #[arg(short, long, default_value = "simulation")]
        session: String,

        /// Number of simulated devices
        #[arg(short, long, default_value = "3")]
        devices: usize,

        /// Number of synchronized captures
        #[arg(short, long)]
        images: Option<u32>,

        /// Index of a device that refuses connections (repeatable)
        #[arg(long)]
        unreachable: Vec<usize>,

        /// Index of a device whose capture process ignores shutdown (repeatable)
        #[arg(long)]
        hang: Vec<usize>,

        /// Local output directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the run summary as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = commands::load_config(cli.config.as_deref())?;
    let log_format = cli.log_format.unwrap_or_else(|| config.logging.format.clone());

    setup_tracing(&log_format, &config.logging.level, cli.verbose)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "pifleet starting");

    match cli.command {
        Commands::Discover => {
            commands::discover(&config).await?;
        }

        Commands::Capture {
            session,
            images,
            hosts,
            output,
            strict,
            json,
            metrics_out,
        } => {
            if let Some(images) = images {
                config.capture.images_per_session = images;
            }
            if !hosts.is_empty() {
                config.discovery.hosts = hosts;
            }
            if let Some(output) = output {
                config.storage.local_output = output;
            }
            config.capture.strict |= strict;

            tracing::info!(
                session = %session,
                images = config.capture.images_per_session,
                "Starting capture command"
            );
            commands::capture(config, &session, json, metrics_out.as_deref()).await?;
        }

        Commands::Simulate {
            session,
            devices,
            images,
            unreachable,
            hang,
            output,
            json,
        } => {
            if let Some(images) = images {
                config.capture.images_per_session = images;
            }
            if let Some(output) = output {
                config.storage.local_output = output;
            }

            let params = commands::SimulateParams {
                session,
                devices,
                unreachable,
                hang,
                json,
            };
            commands::simulate(config, params).await?;
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let default_filter = if verbose {
        String::from("pifleet=debug,info")
    } else {
        format!("pifleet={level},warn")
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}
