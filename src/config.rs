//! `cec.toml` configuration — site defaults the flags fall back to.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CecConfig {
    /// Default network interface for all subcommands.
    pub interface: Option<String>,
    /// Probe / handshake timeout in seconds.
    pub wait_secs: Option<u64>,
    /// Server-side idle eviction threshold in seconds.
    pub idle_secs: Option<u64>,
    /// Escape letter a..y.
    pub escape: Option<char>,
    /// File the server writes "<shelf> <mac>" to on SIGUSR1.
    pub announce_file: Option<PathBuf>,
}

impl CecConfig {
    /// Load the file if present; a missing file is just an empty config.
    pub fn load(path: &Path) -> Result<CecConfig> {
        if !path.exists() {
            return Ok(CecConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: CecConfig = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }
}

/// Interface resolution order: flag, then cec.toml.
pub fn resolve_iface(flag: Option<String>, cfg: &CecConfig) -> Result<String> {
    match flag.or_else(|| cfg.interface.clone()) {
        Some(iface) => Ok(iface),
        None => bail!("no interface given (pass one or set `interface` in cec.toml)"),
    }
}

/// Probe/handshake timeout; defaults to 2 seconds, must be positive.
pub fn wait_secs(flag: Option<u64>, cfg: &CecConfig) -> Result<Duration> {
    positive_secs(flag.or(cfg.wait_secs).unwrap_or(2), "wait-secs")
}

/// Idle eviction threshold; defaults to 300 seconds, must be positive.
pub fn idle_secs(flag: Option<u64>, cfg: &CecConfig) -> Result<Duration> {
    positive_secs(flag.or(cfg.idle_secs).unwrap_or(300), "idle-secs")
}

fn positive_secs(value: u64, what: &str) -> Result<Duration> {
    if value == 0 {
        bail!("{} must be greater than 0", what);
    }
    Ok(Duration::from_secs(value))
}
