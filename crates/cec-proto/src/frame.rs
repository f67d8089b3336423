//! CEC frame codec.
//!
//! A frame is an 18-byte header (dst, src, ethertype, type, conn, seq, len)
//! followed by up to 255 payload bytes. On the wire every frame is padded to
//! the 60-byte Ethernet minimum; anything shorter is rejected on receive.

use std::fmt;

use crate::mac::{format_mac, Mac};

/// CEC runs directly over Ethernet with its own ethertype.
pub const ETHERTYPE: u16 = 0xBCBC;
/// Fixed header: dst(6) + src(6) + ethertype(2) + type/conn/seq/len(4).
pub const HDR_SIZE: usize = 18;
/// Payload length field is one byte.
pub const MAX_PAYLOAD: usize = 255;
/// Minimum wire length (Ethernet minimum frame, zero-padded).
pub const MIN_FRAME: usize = 60;

pub const BROADCAST: Mac = [0xff; 6];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    InitA = 0,
    InitB = 1,
    InitC = 2,
    Data = 3,
    Ack = 4,
    Discover = 5,
    Offer = 6,
    Reset = 7,
}

impl FrameType {
    fn from_wire(b: u8) -> Option<FrameType> {
        Some(match b {
            0 => FrameType::InitA,
            1 => FrameType::InitB,
            2 => FrameType::InitC,
            3 => FrameType::Data,
            4 => FrameType::Ack,
            5 => FrameType::Discover,
            6 => FrameType::Offer,
            7 => FrameType::Reset,
            _ => return None,
        })
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FrameType::InitA => "InitA",
            FrameType::InitB => "InitB",
            FrameType::InitC => "InitC",
            FrameType::Data => "Data",
            FrameType::Ack => "Ack",
            FrameType::Discover => "Discover",
            FrameType::Offer => "Offer",
            FrameType::Reset => "Reset",
        };
        f.write_str(s)
    }
}

/// A parsed CEC frame. `payload.len()` never exceeds [`MAX_PAYLOAD`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub dst: Mac,
    pub src: Mac,
    pub ftype: FrameType,
    pub conn: u8,
    pub seq: u8,
    pub payload: Vec<u8>,
}

/// Why an incoming buffer was not a CEC frame. These are all silent
/// protocol rejects; callers log them at trace level and move on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Shorter than the 60-byte wire minimum.
    Runt(usize),
    WrongEthertype(u16),
    UnknownType(u8),
    /// `len` field points past the end of the received buffer.
    Truncated { len: usize, have: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Runt(n) => write!(f, "runt frame ({} bytes)", n),
            DecodeError::WrongEthertype(e) => write!(f, "ethertype {:#06x}", e),
            DecodeError::UnknownType(t) => write!(f, "unknown frame type {}", t),
            DecodeError::Truncated { len, have } => {
                write!(f, "payload length {} but only {} bytes on wire", len, have)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl Frame {
    /// Control frame with an empty payload.
    pub fn control(ftype: FrameType, dst: Mac, conn: u8) -> Frame {
        Frame { dst, src: [0; 6], ftype, conn, seq: 0, payload: Vec::new() }
    }

    /// Data frame carrying `payload` (truncated to [`MAX_PAYLOAD`]).
    pub fn data(dst: Mac, conn: u8, seq: u8, payload: &[u8]) -> Frame {
        let n = payload.len().min(MAX_PAYLOAD);
        Frame {
            dst,
            src: [0; 6],
            ftype: FrameType::Data,
            conn,
            seq,
            payload: payload[..n].to_vec(),
        }
    }

    /// Serialize to wire bytes, zero-padded to the 60-byte minimum.
    ///
    /// The source MAC is whatever `self.src` holds; the link layer stamps
    /// its own address over it on transmit.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.payload.len() <= MAX_PAYLOAD);
        let wire = (HDR_SIZE + self.payload.len()).max(MIN_FRAME);
        let mut buf = vec![0u8; wire];
        buf[0..6].copy_from_slice(&self.dst);
        buf[6..12].copy_from_slice(&self.src);
        buf[12..14].copy_from_slice(&ETHERTYPE.to_be_bytes());
        buf[14] = self.ftype as u8;
        buf[15] = self.conn;
        buf[16] = self.seq;
        buf[17] = self.payload.len() as u8;
        buf[HDR_SIZE..HDR_SIZE + self.payload.len()].copy_from_slice(&self.payload);
        buf
    }

    /// Parse wire bytes. Padding past `len` is ignored.
    pub fn decode(buf: &[u8]) -> Result<Frame, DecodeError> {
        if buf.len() < MIN_FRAME {
            return Err(DecodeError::Runt(buf.len()));
        }
        let etype = u16::from_be_bytes([buf[12], buf[13]]);
        if etype != ETHERTYPE {
            return Err(DecodeError::WrongEthertype(etype));
        }
        let ftype = FrameType::from_wire(buf[14]).ok_or(DecodeError::UnknownType(buf[14]))?;
        let len = buf[17] as usize;
        if HDR_SIZE + len > buf.len() {
            return Err(DecodeError::Truncated { len, have: buf.len() - HDR_SIZE });
        }
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&buf[0..6]);
        src.copy_from_slice(&buf[6..12]);
        Ok(Frame {
            dst,
            src,
            ftype,
            conn: buf[15],
            seq: buf[16],
            payload: buf[HDR_SIZE..HDR_SIZE + len].to_vec(),
        })
    }

    pub fn is_broadcast(&self) -> bool {
        self.dst == BROADCAST
    }

    /// One-line summary for debug logging.
    pub fn describe(&self) -> String {
        format!(
            "{} {}->{} conn={} seq={} len={}",
            self.ftype,
            format_mac(&self.src),
            format_mac(&self.dst),
            self.conn,
            self.seq,
            self.payload.len()
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
