//! `cec serve` — claim a shelf and multiplex a local console onto it.
//!
//! The local byte source is either this process's own stdio or a spawned
//! command wired up over two pipes. One poll loop watches the link, the
//! local source, and (in local mode) the operator terminal; the timeout
//! tracks the nearest idle-eviction deadline.

use std::ffi::CString;
use std::io::{self, Write};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use cec_proto::{
    bring_up, discover, format_mac, pick_free_shelf, poll_read, probe::Filter, ConsoleServer,
    LinkIo, Mac, RawLink, Readiness, MAX_PAYLOAD,
};
use tracing::{info, warn};

use crate::cli::ServeArgs;
use crate::config::{self, CecConfig};
use crate::tty::{read_fd, RawGuard};

static CHILD_EXITED: AtomicBool = AtomicBool::new(false);
static ANNOUNCE_REQ: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigchld(_: libc::c_int) {
    CHILD_EXITED.store(true, Ordering::SeqCst);
}

extern "C" fn handle_sigusr1(_: libc::c_int) {
    ANNOUNCE_REQ.store(true, Ordering::SeqCst);
}

pub fn run(cfg: &CecConfig, args: ServeArgs) -> Result<()> {
    let iface = config::resolve_iface(args.iface, cfg)?;
    let wait = config::wait_secs(args.wait_secs, cfg)?;
    let idle = config::idle_secs(args.idle_secs, cfg)?;
    let announce = args.announce_file.or_else(|| cfg.announce_file.clone());
    if args.local && args.command.is_empty() {
        bail!("--local requires a command to run");
    }

    bring_up(&iface)?;
    let mut link = RawLink::open(&iface)?;

    // one server per (link, shelf): probe before claiming
    let shelf = match args.shelf {
        Some(want) => {
            let filter = Filter { shelf: Some(want), mac: None };
            if let Some(s) = discover(&mut link, wait, &filter)?.first() {
                bail!(
                    "shelf {} ({}) already exists at {}",
                    want,
                    s.desc,
                    format_mac(&s.mac)
                );
            }
            want
        }
        None => {
            let n = pick_free_shelf(&discover(&mut link, wait, &Filter::any())?);
            eprintln!("Will use shelfno {}", n);
            n
        }
    };

    let mut server = ConsoleServer::new(shelf, host_description(), idle);

    if announce.is_some() {
        unsafe {
            libc::signal(libc::SIGUSR1, handle_sigusr1 as *const () as libc::sighandler_t);
        }
    }

    // local source: spawned command over pipes, or our own stdio
    let source = if args.command.is_empty() {
        unsafe { libc::signal(libc::SIGTERM, libc::SIG_IGN) };
        LocalSource { ifd: libc::STDIN_FILENO, ofd: libc::STDOUT_FILENO, child: None }
    } else {
        unsafe {
            libc::signal(libc::SIGCHLD, handle_sigchld as *const () as libc::sighandler_t);
        }
        spawn_command(&args.command)?
    };

    info!("serving shelf {} on {}", shelf, iface);
    event_loop(
        &mut server,
        &mut link,
        &iface,
        source,
        args.local,
        announce.as_deref(),
    )
}

// ─── Local source ────────────────────────────────────────────────────────────

struct LocalSource {
    /// Bytes the shelf emits (child stdout, or our stdin).
    ifd: RawFd,
    /// Where client keystrokes go (child stdin, or our stdout).
    ofd: RawFd,
    child: Option<libc::pid_t>,
}

/// Spawn `cmd` with both ends of its stdio on pipes. The child's stderr
/// joins its stdout so clients see diagnostics too.
fn spawn_command(cmd: &[String]) -> Result<LocalSource> {
    let argv: Vec<CString> = cmd
        .iter()
        .map(|a| CString::new(a.as_str()).context("NUL in command argument"))
        .collect::<Result<_>>()?;
    let mut argp: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
    argp.push(std::ptr::null());

    let mut to_child = [0 as libc::c_int; 2];
    let mut from_child = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(to_child.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error()).context("pipe");
    }
    if unsafe { libc::pipe(from_child.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error()).context("pipe");
    }

    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()).context("fork"),
        0 => unsafe {
            libc::dup2(to_child[0], libc::STDIN_FILENO);
            libc::dup2(from_child[1], libc::STDOUT_FILENO);
            libc::dup2(from_child[1], libc::STDERR_FILENO);
            for fd in to_child.iter().chain(from_child.iter()) {
                libc::close(*fd);
            }
            libc::execvp(argp[0], argp.as_ptr());
            // only reached when exec failed
            libc::_exit(127);
        },
        pid => {
            unsafe {
                libc::close(to_child[0]);
                libc::close(from_child[1]);
            }
            info!("spawned `{}` as pid {}", cmd.join(" "), pid);
            Ok(LocalSource { ifd: from_child[0], ofd: to_child[1], child: Some(pid) })
        }
    }
}

/// `write(2)` wrapper so the multiplexer can treat the keystroke sink as
/// a plain `io::Write`.
struct FdWriter(RawFd);

impl Write for FdWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::write(self.0, buf.as_ptr() as *const libc::c_void, buf.len())
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ─── Event loop ──────────────────────────────────────────────────────────────

fn event_loop(
    server: &mut ConsoleServer,
    link: &mut RawLink,
    iface: &str,
    source: LocalSource,
    mut local: bool,
    announce: Option<&Path>,
) -> Result<()> {
    let mut sink = FdWriter(source.ofd);
    // held for its Drop: restores the operator terminal on every exit path
    let mut _term_guard = None;
    if local {
        let mut g = RawGuard::new()?;
        g.raw_on()?;
        _term_guard = Some(g);
    }

    loop {
        if CHILD_EXITED.swap(false, Ordering::SeqCst) {
            let status = reap(source.child);
            info!("local command exited with status {}", status);
            server.shutdown(link)?;
            return Ok(());
        }
        if ANNOUNCE_REQ.swap(false, Ordering::SeqCst) {
            if let Some(path) = announce {
                write_announce(path, server.shelf(), &link.local_mac());
            }
        }

        let timeout = server.evict_idle(Instant::now(), link)?;

        let mut fds = vec![link.raw_fd(), source.ifd];
        if local {
            fds.push(libc::STDIN_FILENO);
        }
        let ready = match poll_read(&fds, timeout)? {
            Readiness::Interrupted | Readiness::TimedOut => continue,
            Readiness::Ready(r) => r,
        };

        if ready[0] {
            match link.recv_deadline(Some(Instant::now())) {
                Ok(Some(raw)) => {
                    server.handle_frame(&raw, link, &mut sink, Instant::now())?;
                }
                Ok(None) => {}
                Err(e) if e.raw_os_error() == Some(libc::ENETDOWN) => {
                    // interface bounced: re-up and reopen, keep serving
                    warn!("{} went down; re-upping", iface);
                    bring_up(iface)?;
                    link.reopen()?;
                }
                Err(e) => return Err(e).context("link receive"),
            }
        }

        if ready[1] {
            let mut buf = [0u8; MAX_PAYLOAD];
            let n = read_fd(source.ifd, &mut buf).context("read local source")?;
            if n == 0 {
                info!("local source EOF, shutting down");
                server.shutdown(link)?;
                eprint!("[EOF]\r\n");
                return Ok(());
            }
            if local {
                let mut err = io::stderr().lock();
                let _ = err.write_all(&buf[..n]);
                let _ = err.flush();
            }
            server.fan_out(&buf[..n], link)?;
        }

        if local && ready.get(2).copied().unwrap_or(false) {
            let mut buf = [0u8; MAX_PAYLOAD];
            match read_fd(libc::STDIN_FILENO, &mut buf) {
                Ok(0) => {
                    // operator went away; the shelf keeps serving
                    local = false;
                    _term_guard = None;
                    eprintln!("[EOF] read(stdin)");
                }
                Ok(n) => sink.write_all(&buf[..n])?,
                Err(e) => {
                    server.fan_out(b"\r\n[process error]\r\n", link)?;
                    server.shutdown(link)?;
                    return Err(e).context("read operator terminal");
                }
            }
        }
    }
}

fn reap(child: Option<libc::pid_t>) -> i32 {
    let Some(pid) = child else { return 0 };
    let mut status: libc::c_int = 0;
    unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
    status
}

fn write_announce(path: &Path, shelf: i32, mac: &Mac) {
    let line = format!("{} {}\n", shelf, format_mac(mac));
    if let Err(e) = std::fs::write(path, line) {
        warn!("can't write announce file {}: {}", path.display(), e);
    }
}

/// `"<nodename> <sysname> <release> <machine>"` for the Offer payload.
fn host_description() -> String {
    let mut u: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut u) } != 0 {
        return "unknown".into();
    }
    format!(
        "{} {} {} {}",
        uts_field(&u.nodename),
        uts_field(&u.sysname),
        uts_field(&u.release),
        uts_field(&u.machine)
    )
}

fn uts_field(field: &[libc::c_char]) -> String {
    unsafe { std::ffi::CStr::from_ptr(field.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}
