//! vmmem CLI entry point.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vmmem::config::VmmemConfig;

mod cli;

/// vmmem - balloon-based memory balancing for VMs
#[derive(Parser, Debug)]
#[command(name = "vmmem")]
#[command(about = "Balloon-based memory balancing between a host and its VMs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the memory service.
    Serve(cli::serve::ServeCmd),

    /// Parse and print MGLRU stats.
    Mglru(cli::mglru::MglruCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to info
    init_logging();

    tracing::debug!(version = vmmem::VERSION, "starting vmmem");

    let config = match VmmemConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            VmmemConfig::default()
        }
    };

    let result = match cli.command {
        Commands::Serve(cmd) => cmd.run(&config),
        Commands::Mglru(cmd) => cmd.run(&config),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vmmem=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
