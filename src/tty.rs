//! Terminal mode handling and the interactive user-tty implementation.

use std::io::{self, Write};
use std::os::unix::io::RawFd;

use anyhow::{Context, Result};
use cec_proto::session::UserTty;

/// Scoped raw-mode switch for stdin. The saved attributes are restored on
/// drop, so every exit path (panics included) puts the terminal back.
pub struct RawGuard {
    saved: libc::termios,
    active: bool,
}

impl RawGuard {
    pub fn new() -> Result<RawGuard> {
        let mut saved: libc::termios = unsafe { std::mem::zeroed() };
        if unsafe { libc::tcgetattr(libc::STDIN_FILENO, &mut saved) } != 0 {
            return Err(io::Error::last_os_error()).context("stdin is not a terminal");
        }
        Ok(RawGuard { saved, active: false })
    }

    pub fn raw_on(&mut self) -> io::Result<()> {
        let mut raw = self.saved;
        unsafe { libc::cfmakeraw(&mut raw) };
        raw.c_cc[libc::VMIN] = 1;
        raw.c_cc[libc::VTIME] = 0;
        if unsafe { libc::tcsetattr(libc::STDIN_FILENO, libc::TCSAFLUSH, &raw) } != 0 {
            return Err(io::Error::last_os_error());
        }
        self.active = true;
        Ok(())
    }

    pub fn raw_off(&mut self) -> io::Result<()> {
        if self.active {
            if unsafe { libc::tcsetattr(libc::STDIN_FILENO, libc::TCSAFLUSH, &self.saved) } != 0 {
                return Err(io::Error::last_os_error());
            }
            self.active = false;
        }
        Ok(())
    }
}

impl Drop for RawGuard {
    fn drop(&mut self) {
        let _ = self.raw_off();
    }
}

/// `read(2)` on a descriptor with EINTR retry. Bypasses std's buffered
/// stdin so raw-mode byte reads and cooked-mode line reads never fight
/// over a userspace buffer.
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Read one line from stdin, newline included. Empty string on EOF.
pub fn read_line_stdin() -> io::Result<String> {
    let mut line = Vec::new();
    let mut b = [0u8; 1];
    loop {
        if read_fd(libc::STDIN_FILENO, &mut b)? == 0 {
            break;
        }
        line.push(b[0]);
        if b[0] == b'\n' {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// The interactive terminal handed to a connected session. Construction
/// switches stdin to raw mode; drop restores it.
pub struct ConsoleTty {
    guard: RawGuard,
}

impl ConsoleTty {
    pub fn new() -> Result<ConsoleTty> {
        let mut guard = RawGuard::new()?;
        guard.raw_on().context("can't switch terminal to raw mode")?;
        Ok(ConsoleTty { guard })
    }
}

impl UserTty for ConsoleTty {
    fn input_fd(&self) -> RawFd {
        libc::STDIN_FILENO
    }

    fn read_input(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        read_fd(libc::STDIN_FILENO, buf)
    }

    fn write_output(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut out = io::stdout().lock();
        out.write_all(buf)?;
        out.flush()
    }

    fn read_line(&mut self, prompt: &str) -> io::Result<String> {
        self.guard.raw_off()?;
        eprint!("{}", prompt);
        io::stderr().flush()?;
        let line = read_line_stdin()?;
        self.guard.raw_on()?;
        Ok(line)
    }
}
