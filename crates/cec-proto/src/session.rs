//! Client session engine.
//!
//! Three-way handshake, then a single-threaded connected loop multiplexed
//! over the user terminal and the link. Input is stop-and-wait: one
//! unacked `Data` frame at a time, retransmitted on a one-second timer,
//! and the terminal is not read again until the ack arrives.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, trace};

use crate::frame::{Frame, FrameType};
use crate::link::{poll_read, LinkIo, Readiness};
use crate::mac::Mac;

/// InitA transmissions before the handshake is declared dead.
pub const HANDSHAKE_ATTEMPTS: u32 = 3;
/// Total transmissions of one Data frame before the session is declared dead.
pub const SEND_ATTEMPTS: u32 = 3;
/// Ctrl-] — the default escape byte.
pub const DEFAULT_ESCAPE: u8 = 0x1d;

const RETRANSMIT_TIMER: Duration = Duration::from_secs(1);

/// The user-facing terminal, as the session engine needs it. The
/// implementation owns raw/cooked switching; `read_line` is expected to
/// drop to cooked mode for the duration of the prompt.
pub trait UserTty {
    fn input_fd(&self) -> RawFd;
    fn read_input(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_output(&mut self, buf: &[u8]) -> io::Result<()>;
    /// Print `prompt` and read one line in cooked mode. An empty string
    /// means EOF.
    fn read_line(&mut self, prompt: &str) -> io::Result<String>;
}

/// Why a connected session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Escape-menu quit or terminal EOF.
    UserQuit,
    /// Peer sent `Reset`.
    RemoteReset,
    /// Retransmit budget exhausted with no ack.
    TimedOut,
    /// Termination signal observed between poll wakeups.
    Signal,
}

enum EscapeAction {
    Quit,
    SendEscape,
    Resume,
}

/// Derive the per-session connection tag from the process identity.
pub fn conn_tag() -> u8 {
    let pid = std::process::id();
    ((pid >> 8) ^ pid) as u8
}

/// Map a menu letter (a..y) to its control byte.
pub fn escape_from_letter(c: char) -> Option<u8> {
    let up = c.to_ascii_uppercase();
    if up.is_ascii_uppercase() && up <= 'Y' {
        Some(up as u8 - b'A' + 1)
    } else {
        None
    }
}

/// Printable name of an escape byte, for the "Escape is Ctrl-x" banner.
pub fn escape_display(esc: u8) -> char {
    ((esc + 0x40) as char).to_ascii_lowercase()
}

pub struct ClientSession {
    peer: Mac,
    conn: u8,
    esc: u8,
    wait: Duration,
    snd_seq: u8,
    rcv_seq: Option<u8>,
    /// Encoded wire frame awaiting its ack; re-sent verbatim on timeout.
    unacked: Option<Vec<u8>>,
    retries: u32,
}

impl ClientSession {
    pub fn new(peer: Mac, esc: u8, wait: Duration) -> ClientSession {
        ClientSession {
            peer,
            conn: conn_tag(),
            esc,
            wait,
            snd_seq: 0,
            rcv_seq: None,
            unacked: None,
            retries: 0,
        }
    }

    pub fn escape_byte(&self) -> u8 {
        self.esc
    }

    /// Three-way handshake: InitA, wait for InitB, answer InitC.
    /// `Ok(false)` means every attempt timed out.
    pub fn connect(&mut self, link: &mut dyn LinkIo) -> Result<bool> {
        for attempt in 0..HANDSHAKE_ATTEMPTS {
            if attempt > 0 {
                debug!("handshake attempt {}", attempt + 1);
            }
            link.send(&Frame::control(FrameType::InitA, self.peer, self.conn).encode())?;
            let deadline = Instant::now() + self.wait;
            while let Some(raw) = link.recv_deadline(Some(deadline))? {
                let Ok(frame) = Frame::decode(&raw) else { continue };
                if frame.ftype == FrameType::InitB {
                    link.send(&Frame::control(FrameType::InitC, self.peer, self.conn).encode())?;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Tell the peer we are gone. Safe to call on any exit path.
    pub fn close(&mut self, link: &mut dyn LinkIo) -> Result<()> {
        link.send(&Frame::control(FrameType::Reset, self.peer, self.conn).encode())?;
        Ok(())
    }

    /// Connected-mode loop. Returns when the session ends; the caller
    /// still owes the peer a `Reset` via [`close`](Self::close).
    pub fn run(
        &mut self,
        link: &mut dyn LinkIo,
        tty: &mut dyn UserTty,
        stop: &AtomicBool,
    ) -> Result<SessionEnd> {
        loop {
            if stop.load(Ordering::SeqCst) {
                return Ok(SessionEnd::Signal);
            }
            // stop-and-wait: the terminal is only watched while nothing
            // is in flight
            let mut fds = vec![link.raw_fd()];
            let waiting_for_ack = self.unacked.is_some();
            if !waiting_for_ack {
                fds.push(tty.input_fd());
            }
            let timeout = waiting_for_ack.then_some(RETRANSMIT_TIMER);

            match poll_read(&fds, timeout)? {
                Readiness::Interrupted => continue,
                Readiness::TimedOut => {
                    if let Some(end) = self.on_ack_timeout(link)? {
                        return Ok(end);
                    }
                }
                Readiness::Ready(ready) => {
                    if ready[0] {
                        if let Some(raw) = link.recv_deadline(Some(Instant::now()))? {
                            if let Some(end) = self.handle_net(&raw, link, tty)? {
                                return Ok(end);
                            }
                        }
                    }
                    if ready.get(1).copied().unwrap_or(false) && self.unacked.is_none() {
                        if let Some(end) = self.handle_user(link, tty)? {
                            return Ok(end);
                        }
                    }
                }
            }
        }
    }

    /// The 1-second ack timer fired: burn one attempt, re-send the saved
    /// frame at its original wire length.
    fn on_ack_timeout(&mut self, link: &mut dyn LinkIo) -> Result<Option<SessionEnd>> {
        self.retries = self.retries.saturating_sub(1);
        if self.retries == 0 {
            eprint!("Connection timed out\r\n");
            return Ok(Some(SessionEnd::TimedOut));
        }
        if let Some(wire) = &self.unacked {
            trace!("retransmit seq {}", self.snd_seq);
            link.send(wire)?;
        }
        Ok(None)
    }

    fn handle_net(
        &mut self,
        raw: &[u8],
        link: &mut dyn LinkIo,
        tty: &mut dyn UserTty,
    ) -> Result<Option<SessionEnd>> {
        let frame = match Frame::decode(raw) {
            Ok(f) => f,
            Err(e) => {
                trace!("drop: {}", e);
                return Ok(None);
            }
        };
        if frame.src != self.peer {
            return Ok(None);
        }
        match frame.ftype {
            FrameType::Data => {
                if frame.conn != self.conn {
                    return Ok(None);
                }
                if Some(frame.seq) == self.rcv_seq {
                    trace!("duplicate seq {}", frame.seq);
                    return Ok(None);
                }
                tty.write_output(&frame.payload)?;
                self.rcv_seq = Some(frame.seq);
                let mut ack = Frame::control(FrameType::Ack, self.peer, self.conn);
                ack.seq = frame.seq;
                link.send(&ack.encode())?;
                Ok(None)
            }
            FrameType::Ack => {
                if frame.seq == self.snd_seq {
                    self.unacked = None;
                }
                Ok(None)
            }
            FrameType::Reset => Ok(Some(SessionEnd::RemoteReset)),
            FrameType::Offer => {
                // the peer restarted; run the handshake again in place
                debug!("offer mid-session, re-syncing");
                self.connect(link)?;
                Ok(None)
            }
            FrameType::InitA | FrameType::InitB | FrameType::InitC | FrameType::Discover => {
                Ok(None)
            }
        }
    }

    fn handle_user(
        &mut self,
        link: &mut dyn LinkIo,
        tty: &mut dyn UserTty,
    ) -> Result<Option<SessionEnd>> {
        let mut byte = [0u8; 1];
        if tty.read_input(&mut byte)? == 0 {
            return Ok(Some(SessionEnd::UserQuit));
        }
        if byte[0] == self.esc {
            match self.escape_menu(tty)? {
                EscapeAction::Quit => return Ok(Some(SessionEnd::UserQuit)),
                EscapeAction::Resume => return Ok(None),
                EscapeAction::SendEscape => {} // fall through with the escape byte itself
            }
        }
        self.send_byte(byte[0], link)?;
        Ok(None)
    }

    fn send_byte(&mut self, c: u8, link: &mut dyn LinkIo) -> Result<()> {
        self.snd_seq = self.snd_seq.wrapping_add(1);
        let wire = Frame::data(self.peer, self.conn, self.snd_seq, &[c]).encode();
        link.send(&wire)?;
        self.unacked = Some(wire);
        self.retries = SEND_ATTEMPTS;
        Ok(())
    }

    fn escape_menu(&mut self, tty: &mut dyn UserTty) -> Result<EscapeAction> {
        loop {
            let line = tty.read_line(">>> ")?;
            match line.bytes().next() {
                None => return Ok(EscapeAction::Resume), // EOF at the prompt
                Some(b'q') => return Ok(EscapeAction::Quit),
                Some(b'i') => return Ok(EscapeAction::SendEscape),
                Some(b'.') => return Ok(EscapeAction::Resume),
                _ => eprint!("\t(q)uit, (i)nterrupt, (.)continue\r\n"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::MockLink;
    use std::collections::VecDeque;

    const LOCAL: Mac = [0x02, 0, 0, 0, 0, 0x01];
    const PEER: Mac = [0x00, 0x30, 0x48, 0x86, 0x5f, 0x1e];
    const OTHER: Mac = [0x00, 0x30, 0x48, 0x86, 0x5f, 0x1f];

    struct MockTty {
        input: VecDeque<u8>,
        lines: VecDeque<String>,
        output: Vec<u8>,
    }

    impl MockTty {
        fn new() -> MockTty {
            MockTty { input: VecDeque::new(), lines: VecDeque::new(), output: Vec::new() }
        }
    }

    impl UserTty for MockTty {
        fn input_fd(&self) -> RawFd {
            -1
        }

        fn read_input(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.input.pop_front() {
                Some(b) => {
                    buf[0] = b;
                    Ok(1)
                }
                None => Ok(0),
            }
        }

        fn write_output(&mut self, buf: &[u8]) -> io::Result<()> {
            self.output.extend_from_slice(buf);
            Ok(())
        }

        fn read_line(&mut self, _prompt: &str) -> io::Result<String> {
            Ok(self.lines.pop_front().unwrap_or_default())
        }
    }

    fn session() -> ClientSession {
        ClientSession::new(PEER, DEFAULT_ESCAPE, Duration::from_secs(2))
    }

    fn from_peer(ftype: FrameType, conn: u8, seq: u8, payload: &[u8]) -> Frame {
        let mut f = Frame::data(LOCAL, conn, seq, payload);
        f.ftype = ftype;
        f.src = PEER;
        f
    }

    #[test]
    fn test_handshake_success() {
        let mut s = session();
        let mut link = MockLink::new(LOCAL);
        link.queue(&from_peer(FrameType::InitB, s.conn, 0, b""));
        assert!(s.connect(&mut link).unwrap());
        let sent = link.sent_frames();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].ftype, FrameType::InitA);
        assert_eq!(sent[0].dst, PEER);
        assert_eq!(sent[0].conn, s.conn);
        assert_eq!(sent[1].ftype, FrameType::InitC);
    }

    #[test]
    fn test_handshake_ignores_other_frames() {
        let mut s = session();
        let mut link = MockLink::new(LOCAL);
        link.queue(&from_peer(FrameType::Data, s.conn, 1, b"x"));
        link.queue(&from_peer(FrameType::InitB, s.conn, 0, b""));
        assert!(s.connect(&mut link).unwrap());
    }

    #[test]
    fn test_handshake_exhausts_attempts() {
        let mut s = session();
        let mut link = MockLink::new(LOCAL);
        assert!(!s.connect(&mut link).unwrap());
        let sent = link.sent_frames();
        assert_eq!(sent.len(), HANDSHAKE_ATTEMPTS as usize);
        assert!(sent.iter().all(|f| f.ftype == FrameType::InitA));
    }

    #[test]
    fn test_data_written_and_acked() {
        let mut s = session();
        let mut link = MockLink::new(LOCAL);
        let mut tty = MockTty::new();
        let end = s
            .handle_net(&from_peer(FrameType::Data, s.conn, 1, b"$ ").encode(), &mut link, &mut tty)
            .unwrap();
        assert!(end.is_none());
        assert_eq!(tty.output, b"$ ".to_vec());
        let sent = link.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].ftype, FrameType::Ack);
        assert_eq!(sent[0].seq, 1);
        assert!(sent[0].payload.is_empty());
    }

    #[test]
    fn test_duplicate_data_dropped_silently() {
        let mut s = session();
        let mut link = MockLink::new(LOCAL);
        let mut tty = MockTty::new();
        let data = from_peer(FrameType::Data, s.conn, 1, b"a").encode();
        s.handle_net(&data, &mut link, &mut tty).unwrap();
        s.handle_net(&data, &mut link, &mut tty).unwrap();
        assert_eq!(tty.output, b"a".to_vec());
        assert_eq!(link.sent_frames().len(), 1); // one ack, no re-ack
    }

    #[test]
    fn test_wrong_conn_and_wrong_src_dropped() {
        let mut s = session();
        let mut link = MockLink::new(LOCAL);
        let mut tty = MockTty::new();
        let wrong_conn = from_peer(FrameType::Data, s.conn.wrapping_add(1), 1, b"x");
        s.handle_net(&wrong_conn.encode(), &mut link, &mut tty).unwrap();
        let mut wrong_src = from_peer(FrameType::Data, s.conn, 2, b"y");
        wrong_src.src = OTHER;
        s.handle_net(&wrong_src.encode(), &mut link, &mut tty).unwrap();
        assert!(tty.output.is_empty());
        assert!(link.sent_frames().is_empty());
    }

    #[test]
    fn test_keystroke_sends_data_and_blocks() {
        let mut s = session();
        let mut link = MockLink::new(LOCAL);
        let mut tty = MockTty::new();
        tty.input.push_back(b'x');
        assert!(s.handle_user(&mut link, &mut tty).unwrap().is_none());
        let sent = link.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].ftype, FrameType::Data);
        assert_eq!(sent[0].seq, 1);
        assert_eq!(sent[0].payload, b"x".to_vec());
        assert!(s.unacked.is_some());
        assert_eq!(s.retries, SEND_ATTEMPTS);
    }

    #[test]
    fn test_ack_clears_unacked() {
        let mut s = session();
        let mut link = MockLink::new(LOCAL);
        let mut tty = MockTty::new();
        tty.input.push_back(b'x');
        s.handle_user(&mut link, &mut tty).unwrap();
        // wrong seq leaves the frame in flight
        s.handle_net(&from_peer(FrameType::Ack, s.conn, 9, b"").encode(), &mut link, &mut tty)
            .unwrap();
        assert!(s.unacked.is_some());
        s.handle_net(&from_peer(FrameType::Ack, s.conn, 1, b"").encode(), &mut link, &mut tty)
            .unwrap();
        assert!(s.unacked.is_none());
    }

    #[test]
    fn test_retransmit_same_frame_then_timeout() {
        let mut s = session();
        let mut link = MockLink::new(LOCAL);
        let mut tty = MockTty::new();
        tty.input.push_back(b'x');
        s.handle_user(&mut link, &mut tty).unwrap();
        let first = link.tx[0].clone();

        assert!(s.on_ack_timeout(&mut link).unwrap().is_none());
        assert!(s.on_ack_timeout(&mut link).unwrap().is_none());
        assert_eq!(link.tx.len(), 3);
        assert_eq!(link.tx[1], first); // byte-identical retransmits
        assert_eq!(link.tx[2], first);

        let end = s.on_ack_timeout(&mut link).unwrap();
        assert_eq!(end, Some(SessionEnd::TimedOut));
        assert_eq!(link.tx.len(), 3);
    }

    #[test]
    fn test_reset_ends_session() {
        let mut s = session();
        let mut link = MockLink::new(LOCAL);
        let mut tty = MockTty::new();
        let end = s
            .handle_net(&from_peer(FrameType::Reset, s.conn, 0, b"").encode(), &mut link, &mut tty)
            .unwrap();
        assert_eq!(end, Some(SessionEnd::RemoteReset));
    }

    #[test]
    fn test_escape_quit() {
        let mut s = session();
        let mut link = MockLink::new(LOCAL);
        let mut tty = MockTty::new();
        tty.input.push_back(DEFAULT_ESCAPE);
        tty.lines.push_back("q\n".into());
        let end = s.handle_user(&mut link, &mut tty).unwrap();
        assert_eq!(end, Some(SessionEnd::UserQuit));
        assert!(link.sent_frames().is_empty()); // caller's close() owes the Reset
    }

    #[test]
    fn test_escape_interrupt_sends_escape_byte() {
        let mut s = session();
        let mut link = MockLink::new(LOCAL);
        let mut tty = MockTty::new();
        tty.input.push_back(DEFAULT_ESCAPE);
        tty.lines.push_back("i\n".into());
        assert!(s.handle_user(&mut link, &mut tty).unwrap().is_none());
        let sent = link.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, vec![DEFAULT_ESCAPE]);
    }

    #[test]
    fn test_escape_resume_sends_nothing() {
        let mut s = session();
        let mut link = MockLink::new(LOCAL);
        let mut tty = MockTty::new();
        tty.input.push_back(DEFAULT_ESCAPE);
        tty.lines.push_back(".\n".into());
        assert!(s.handle_user(&mut link, &mut tty).unwrap().is_none());
        assert!(link.sent_frames().is_empty());
    }

    #[test]
    fn test_escape_menu_reprompts_on_unknown() {
        let mut s = session();
        let mut link = MockLink::new(LOCAL);
        let mut tty = MockTty::new();
        tty.input.push_back(DEFAULT_ESCAPE);
        tty.lines.push_back("z\n".into());
        tty.lines.push_back("q\n".into());
        let end = s.handle_user(&mut link, &mut tty).unwrap();
        assert_eq!(end, Some(SessionEnd::UserQuit));
    }

    #[test]
    fn test_close_sends_reset() {
        let mut s = session();
        let mut link = MockLink::new(LOCAL);
        s.close(&mut link).unwrap();
        let sent = link.sent_frames();
        assert_eq!(sent[0].ftype, FrameType::Reset);
        assert_eq!(sent[0].dst, PEER);
        assert_eq!(sent[0].conn, s.conn);
    }

    #[test]
    fn test_escape_letter_mapping() {
        assert_eq!(escape_from_letter('e'), Some(5));
        assert_eq!(escape_from_letter('A'), Some(1));
        assert_eq!(escape_from_letter('y'), Some(25));
        assert_eq!(escape_from_letter('z'), None);
        assert_eq!(escape_from_letter('!'), None);
        assert_eq!(escape_display(DEFAULT_ESCAPE), ']');
        assert_eq!(escape_display(5), 'e');
    }
}
