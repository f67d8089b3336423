//! Server-side session table and frame multiplexer.
//!
//! One `ConsoleServer` owns the client slots and the ring backscroll. The
//! event loop around it feeds in link frames (`handle_frame`), local
//! output bursts (`fan_out`), and the clock (`evict_idle`); keystrokes
//! from clients land on the local sink it is handed.
//!
//! Reliability is asymmetric by design: clients ack-gate their own input
//! and retransmit, while the server fans output out exactly once and only
//! uses incoming `Ack`s to refresh the idle clock.

use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, trace};

use crate::frame::{Frame, FrameType, MAX_PAYLOAD};
use crate::link::LinkIo;
use crate::mac::{format_mac, Mac};
use crate::ring::Backscroll;

/// We are not too ambitious.
pub const MAX_CLIENTS: usize = 4;
/// Default idle eviction threshold.
pub const IDLE_TIMER: Duration = Duration::from_secs(300);

const CONNECT_BANNER: &[u8] = b"[Connected]\r\n";

struct ClientSlot {
    mac: Mac,
    conn: u8,
    last: Instant,
    out_seq: u8,
    /// Sequence of the last payload delivered to the local sink; a
    /// retransmit with the same seq is acked but not re-delivered.
    last_in: Option<u8>,
}

impl ClientSlot {
    fn next_seq(&mut self) -> u8 {
        self.out_seq = self.out_seq.wrapping_add(1);
        self.out_seq
    }
}

pub struct ConsoleServer {
    shelf: i32,
    /// Free-form host description carried in `Offer` replies.
    desc: String,
    idle: Duration,
    slots: [Option<ClientSlot>; MAX_CLIENTS],
    ring: Backscroll,
}

impl ConsoleServer {
    pub fn new(shelf: i32, desc: String, idle: Duration) -> ConsoleServer {
        ConsoleServer {
            shelf,
            desc,
            idle,
            slots: Default::default(),
            ring: Backscroll::new(),
        }
    }

    pub fn shelf(&self) -> i32 {
        self.shelf
    }

    pub fn active_clients(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Dispatch one received buffer. Undecodable frames are dropped
    /// silently; valid frames follow the protocol table.
    pub fn handle_frame(
        &mut self,
        raw: &[u8],
        link: &mut dyn LinkIo,
        sink: &mut dyn Write,
        now: Instant,
    ) -> Result<()> {
        let frame = match Frame::decode(raw) {
            Ok(f) => f,
            Err(e) => {
                trace!("drop: {}", e);
                return Ok(());
            }
        };
        trace!("rx {}", frame.describe());

        match frame.ftype {
            FrameType::InitA => {
                // always say yes; state is created on InitC
                let mut reply = Frame::control(FrameType::InitB, frame.src, frame.conn);
                reply.seq = frame.seq;
                link.send(&reply.encode())?;
            }
            FrameType::InitC => self.handle_initc(&frame, link, now)?,
            FrameType::Data => self.handle_data(&frame, link, sink, now)?,
            FrameType::Ack => {
                if let Some(i) = self.find_slot(&frame.src, frame.conn) {
                    self.slots[i].as_mut().unwrap().last = now;
                }
            }
            FrameType::Reset => self.handle_reset(&frame, link)?,
            FrameType::Discover => {
                let payload = format!("{}\t{}", self.shelf, self.desc);
                let mut offer = Frame::data(frame.src, 0, 0, payload.as_bytes());
                offer.ftype = FrameType::Offer;
                link.send(&offer.encode())?;
            }
            // client-side frame types; nothing for a server to do
            FrameType::InitB | FrameType::Offer => {}
        }
        Ok(())
    }

    fn handle_initc(&mut self, frame: &Frame, link: &mut dyn LinkIo, now: Instant) -> Result<()> {
        if let Some(i) = self.find_slot(&frame.src, frame.conn) {
            // duplicate InitC: our banner never arrived, send it again
            let seq = self.slots[i].as_mut().unwrap().next_seq();
            let banner = Frame::data(frame.src, frame.conn, seq, CONNECT_BANNER);
            link.send(&banner.encode())?;
            return Ok(());
        }

        let Some(free) = self.slots.iter().position(Option::is_none) else {
            info!("refusing {}: no free ports", format_mac(&frame.src));
            let mut reset = Frame::data(frame.src, frame.conn, 0, b"no free ports");
            reset.ftype = FrameType::Reset;
            link.send(&reset.encode())?;
            return Ok(());
        };

        let notice = format!(
            "\r\n[New console {} attached ({}-{})]\r\n",
            free,
            format_mac(&frame.src),
            frame.conn
        );
        info!("{}", notice.trim());
        self.broadcast_notice(link, &notice)?;

        self.slots[free] = Some(ClientSlot {
            mac: frame.src,
            conn: frame.conn,
            last: now,
            out_seq: frame.seq,
            last_in: None,
        });

        // banner plus the newest backscroll that still fits one frame
        let mut payload = CONNECT_BANNER.to_vec();
        payload.extend_from_slice(&self.ring.tail(MAX_PAYLOAD - payload.len()));
        let seq = self.slots[free].as_mut().unwrap().next_seq();
        let reply = Frame::data(frame.src, frame.conn, seq, &payload);
        link.send(&reply.encode())?;
        Ok(())
    }

    fn handle_data(
        &mut self,
        frame: &Frame,
        link: &mut dyn LinkIo,
        sink: &mut dyn Write,
        now: Instant,
    ) -> Result<()> {
        let Some(i) = self.find_slot(&frame.src, frame.conn) else {
            let mut reset = Frame::data(frame.src, frame.conn, 0, b"connection closed");
            reset.ftype = FrameType::Reset;
            link.send(&reset.encode())?;
            return Ok(());
        };
        let slot = self.slots[i].as_mut().unwrap();
        slot.last = now;
        if slot.last_in == Some(frame.seq) {
            trace!("duplicate seq {} from {}", frame.seq, format_mac(&frame.src));
        } else {
            sink.write_all(&frame.payload)?;
            sink.flush()?;
            slot.last_in = Some(frame.seq);
        }
        let mut ack = Frame::control(FrameType::Ack, frame.src, frame.conn);
        ack.seq = frame.seq;
        link.send(&ack.encode())?;
        Ok(())
    }

    fn handle_reset(&mut self, frame: &Frame, link: &mut dyn LinkIo) -> Result<()> {
        let Some(i) = self.find_slot(&frame.src, frame.conn) else {
            return Ok(());
        };
        let conn = self.slots[i].as_ref().unwrap().conn;
        self.slots[i] = None;
        let notice = format!(
            "\r\n[Console ({}) disconnected ({}-{})]\r\n",
            i,
            format_mac(&frame.src),
            conn
        );
        info!("{}", notice.trim());
        self.broadcast_notice(link, &notice)?;
        Ok(())
    }

    /// One burst of local output: remember it for late joiners and send a
    /// `Data` frame to every active client with that client's own tag and
    /// sequence. No retransmit bookkeeping happens here.
    pub fn fan_out(&mut self, chunk: &[u8], link: &mut dyn LinkIo) -> Result<()> {
        self.ring.write(chunk);
        for slot in self.slots.iter_mut().flatten() {
            let seq = slot.next_seq();
            let f = Frame::data(slot.mac, slot.conn, seq, chunk);
            link.send(&f.encode())?;
        }
        Ok(())
    }

    /// The local source is gone: tell every client and drop the table.
    pub fn shutdown(&mut self, link: &mut dyn LinkIo) -> Result<()> {
        for slot in self.slots.iter_mut().flatten() {
            let seq = slot.next_seq();
            let data = Frame::data(slot.mac, slot.conn, seq, b"[System shutdown]");
            link.send(&data.encode())?;
            let reset = Frame::control(FrameType::Reset, slot.mac, slot.conn);
            link.send(&reset.encode())?;
        }
        self.slots = Default::default();
        Ok(())
    }

    /// Reset and free every slot idle past the threshold. Returns the
    /// time until the next pending eviction, for use as the poll timeout.
    pub fn evict_idle(&mut self, now: Instant, link: &mut dyn LinkIo) -> Result<Option<Duration>> {
        let mut next: Option<Duration> = None;
        for i in 0..MAX_CLIENTS {
            let Some(slot) = &self.slots[i] else { continue };
            let idle_for = now.saturating_duration_since(slot.last);
            if idle_for > self.idle {
                debug!("evicting idle client {} ({})", i, format_mac(&slot.mac));
                let reset = Frame::control(FrameType::Reset, slot.mac, slot.conn);
                link.send(&reset.encode())?;
                self.slots[i] = None;
            } else {
                let remain = self.idle - idle_for;
                next = Some(next.map_or(remain, |n| n.min(remain)));
            }
        }
        Ok(next)
    }

    fn find_slot(&self, mac: &Mac, conn: u8) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.mac == *mac && s.conn == conn))
    }

    fn broadcast_notice(&mut self, link: &mut dyn LinkIo, msg: &str) -> Result<()> {
        for slot in self.slots.iter_mut().flatten() {
            let seq = slot.next_seq();
            let f = Frame::data(slot.mac, slot.conn, seq, msg.as_bytes());
            link.send(&f.encode())?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
