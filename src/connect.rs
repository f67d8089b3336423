//! `cec connect` — discovery, shelf selection, and the session driver.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use cec_proto::{
    discover, escape_display, escape_from_letter, parse_mac, probe::Filter, render_table,
    tokenize, ClientSession, RawLink, SessionEnd, Shelf, DEFAULT_ESCAPE,
};
use tracing::debug;

use crate::cli::ConnectArgs;
use crate::config::{self, CecConfig};
use crate::tty::{read_line_stdin, ConsoleTty};

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_term(_: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

pub fn run(cfg: &CecConfig, args: ConnectArgs) -> Result<()> {
    let iface = config::resolve_iface(args.iface, cfg)?;
    let wait = config::wait_secs(args.wait_secs, cfg)?;
    let quiet = args.quiet;

    let esc = match args.escape.or(cfg.escape) {
        Some(letter) => match escape_from_letter(letter) {
            Some(b) => b,
            None => bail!("escape character out of range (a..y): {}", letter),
        },
        None => DEFAULT_ESCAPE,
    };

    let filter = Filter {
        shelf: args.shelf,
        mac: match &args.mac {
            Some(text) => match parse_mac(text) {
                Some(mac) => Some(mac),
                None => bail!("bad mac address: {}", text),
            },
            None => None,
        },
    };

    let mut link = RawLink::open(&iface)?;

    unsafe {
        libc::signal(libc::SIGTERM, handle_term as *const () as libc::sighandler_t);
        libc::signal(libc::SIGHUP, handle_term as *const () as libc::sighandler_t);
    }

    let mut tab = probe(&mut link, wait, &filter, quiet)?;
    loop {
        let target = if filter.is_narrowed() {
            tab[0].clone()
        } else {
            match pick_one(&mut link, &mut tab, wait, quiet)? {
                Some(shelf) => shelf,
                None => return Ok(()), // q or EOF at the prompt
            }
        };

        attach(&mut link, &target, esc, wait, quiet)?;

        if filter.is_narrowed() || STOP.load(Ordering::SeqCst) {
            return Ok(());
        }
    }
}

/// One discovery pass with the chatter the C client printed.
fn probe(link: &mut RawLink, wait: Duration, filter: &Filter, quiet: bool) -> Result<Vec<Shelf>> {
    if !quiet {
        eprint!("Probing for shelves ... ");
    }
    let tab = discover(link, wait, filter)?;
    if tab.is_empty() {
        if !quiet {
            eprintln!("none found.");
        }
        std::process::exit(1);
    }
    if !quiet {
        if filter.is_narrowed() {
            eprintln!("shelf {} found.", tab[0].shelf);
        } else {
            eprintln!("done.");
        }
    }
    Ok(tab)
}

/// Selection prompt. `Ok(None)` means the user quit. Re-probing on `p`
/// refreshes `tab` in place.
fn pick_one(
    link: &mut RawLink,
    tab: &mut Vec<Shelf>,
    wait: Duration,
    quiet: bool,
) -> Result<Option<Shelf>> {
    print!("{}", render_table(tab, true));
    loop {
        print!("[#qp]: ");
        std::io::stdout().flush()?;
        let line = read_line_stdin()?;
        if line.is_empty() {
            return Ok(None); // EOF
        }
        let tokens = tokenize(&line);
        match tokens.as_slice() {
            [] => continue,
            ["q"] => return Ok(None),
            ["p"] => {
                *tab = probe(link, wait, &Filter::any(), quiet)?;
                print!("{}", render_table(tab, true));
                continue;
            }
            [shelf] | [shelf, _] => {
                let Ok(shelf) = shelf.parse::<i32>() else {
                    print!("{}", render_table(tab, true));
                    continue;
                };
                let mac = match tokens.get(1) {
                    Some(text) => match parse_mac(text) {
                        Some(mac) => Some(mac),
                        None => {
                            print!("{}", render_table(tab, true));
                            continue;
                        }
                    },
                    None => None,
                };
                match cec_proto::probe::find(tab, shelf, mac) {
                    Some(found) => return Ok(Some(found.clone())),
                    None => {
                        print!("{}", render_table(tab, true));
                        continue;
                    }
                }
            }
            _ => {
                print!("{}", render_table(tab, true));
                continue;
            }
        }
    }
}

/// Handshake, run the session, and always settle up: one `Reset` to the
/// peer, terminal restored by the tty guard.
fn attach(link: &mut RawLink, target: &Shelf, esc: u8, wait: Duration, quiet: bool) -> Result<()> {
    let mut session = ClientSession::new(target.mac, esc, wait);
    if !quiet {
        eprint!("connecting ... ");
    }
    if !session.connect(link)? {
        if !quiet {
            eprintln!("connection failed.");
        }
        return Ok(());
    }
    if !quiet {
        eprint!("done.\r\n");
        eprint!("Escape is Ctrl-{}\r\n", escape_display(esc));
    }

    let mut tty = ConsoleTty::new()?;
    let end = session.run(link, &mut tty, &STOP);
    // settle up before surfacing any loop error
    let _ = session.close(link);
    drop(tty);

    match end? {
        SessionEnd::RemoteReset => {
            if !quiet {
                eprintln!("connection closed by remote.");
            }
        }
        SessionEnd::Signal => debug!("session ended by signal"),
        SessionEnd::UserQuit | SessionEnd::TimedOut => {}
    }
    Ok(())
}
