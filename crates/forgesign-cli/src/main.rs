//! forgesign - bus-mediated build-artifact signing client
//!
//! Publishes a signing request to the message bus, waits for the correlated
//! completion message, and verifies the returned signatures before
//! accepting them into the build output set.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// forgesign - bus-mediated build-artifact signing client
#[derive(Parser, Debug)]
#[command(name = "forgesign")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Request signatures from the remote signer and verify them
    Sign(commands::sign::SignArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        // Any timeout, signing failure, or verification failure surfaces
        // here as Err and exits non-zero; there is no partial-success
        // state to resume from.
        Commands::Sign(args) => commands::sign::run(&args),
    }
}
