//! agentdird - agent directory daemon
//!
//! Stores content-addressed agent records in an OCI-compatible registry,
//! announces their labels across the gossip mesh and the DHT, and serves
//! discovery queries over gRPC.

use agentdird::config::Config;
use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let directive = if config.verbose {
        "agentdird=debug"
    } else {
        "agentdird=info"
    };
    let filter = EnvFilter::from_default_env().add_directive(directive.parse().unwrap());
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
    }

    info!("agentdird v{} - agent directory daemon", env!("CARGO_PKG_VERSION"));

    if let Err(e) = agentdird::server::run(config).await {
        error!("daemon error: {e:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
