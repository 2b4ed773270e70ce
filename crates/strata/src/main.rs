//! Strata CLI entry point.

use clap::Parser;
use color_eyre::eyre::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use strata::cli::{Cli, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.debug { "strata=debug" } else { "strata=info" };
    let filter = EnvFilter::from_default_env().add_directive(level.parse()?);
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .with(filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init(),
    }

    // Execute command
    cli.execute().await
}
