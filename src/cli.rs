//! CLI definitions for cec.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "cec",
    version,
    about = "Ethernet console\n\nConsole access over raw Ethernet frames: probe the link for shelves, connect to one, or publish the local console as a shelf.",
    long_about = None
)]
pub struct Cli {
    /// Path to cec.toml config file
    #[clap(long, short, global = true, default_value = "cec.toml")]
    pub config: PathBuf,

    /// Copious debugging output, frame hex dumps included
    #[clap(long, short, global = true)]
    pub debug: bool,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Probe the link and print the discovered shelf table
    Probe(ProbeArgs),

    /// Connect to a shelf for interactive console access
    Connect(ConnectArgs),

    /// Publish the local console (or a spawned command) as a shelf
    Serve(ServeArgs),
}

#[derive(Args)]
pub struct ProbeArgs {
    /// Network interface to probe (falls back to cec.toml)
    pub iface: Option<String>,

    /// Seconds to wait for offers (> 0)
    #[clap(long, short)]
    pub wait_secs: Option<u64>,
}

#[derive(Args)]
pub struct ConnectArgs {
    /// Network interface (falls back to cec.toml)
    pub iface: Option<String>,

    /// Connect only to this shelf number, then exit on close
    #[clap(long, short)]
    pub shelf: Option<i32>,

    /// Connect only to the server with this MAC, then exit on close
    #[clap(long, short)]
    pub mac: Option<String>,

    /// Escape letter a..y; the session escape is Ctrl-<letter>
    #[clap(long, short)]
    pub escape: Option<char>,

    /// Seconds to wait on probe and handshake (> 0)
    #[clap(long, short)]
    pub wait_secs: Option<u64>,

    /// Suppress informational output
    #[clap(long, short)]
    pub quiet: bool,
}

#[derive(Args)]
pub struct ServeArgs {
    /// Network interface (falls back to cec.toml)
    pub iface: Option<String>,

    /// Claim this shelf number instead of auto-allocating one
    #[clap(long, short)]
    pub shelf: Option<i32>,

    /// Disconnect clients idle longer than this many seconds (> 0)
    #[clap(long, short)]
    pub idle_secs: Option<u64>,

    /// Seconds to wait on the startup probe (> 0)
    #[clap(long, short)]
    pub wait_secs: Option<u64>,

    /// On SIGUSR1, write "<shelf> <mac>" to this file
    #[clap(long)]
    pub announce_file: Option<PathBuf>,

    /// Keep the operator terminal attached to the spawned command
    #[clap(long, short)]
    pub local: bool,

    /// Command to run behind the shelf (default: serve this stdio)
    #[clap(trailing_var_arg = true)]
    pub command: Vec<String>,
}
