//! cec — Ethernet console.
//!
//! Client and server for the CEC console protocol carried over raw
//! Ethernet frames. Run `cec --help` for usage; raw link access needs
//! root (or CAP_NET_RAW).

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod connect;
mod probe;
mod serve;
mod tty;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // -d turns on everything, frame hex dumps included
    let directive = if cli.debug { "trace" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .with_writer(std::io::stderr)
        .init();

    let config = config::CecConfig::load(&cli.config)?;

    match cli.command {
        Commands::Probe(args) => probe::run(&config, args),
        Commands::Connect(args) => connect::run(&config, args),
        Commands::Serve(args) => serve::run(&config, args),
    }
}
