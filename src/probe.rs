//! `cec probe` — print the discovery table and exit.
//!
//! Quiet by definition: the output is meant to be script-parseable, so
//! there is no header and no progress chatter.

use anyhow::Result;
use cec_proto::{discover, probe::Filter, render_table, RawLink};

use crate::cli::ProbeArgs;
use crate::config::{self, CecConfig};

pub fn run(cfg: &CecConfig, args: ProbeArgs) -> Result<()> {
    let iface = config::resolve_iface(args.iface, cfg)?;
    let wait = config::wait_secs(args.wait_secs, cfg)?;

    let mut link = RawLink::open(&iface)?;
    let tab = discover(&mut link, wait, &Filter::any())?;
    if tab.is_empty() {
        eprintln!("none found.");
        std::process::exit(1);
    }
    print!("{}", render_table(&tab, false));
    Ok(())
}
