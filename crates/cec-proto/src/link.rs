//! Raw Ethernet link access.
//!
//! The protocol engines talk to the wire through [`LinkIo`]; the real
//! implementation is an `AF_PACKET`/`SOCK_RAW` socket bound to one
//! interface with the CEC ethertype. The link layer owns the source
//! address (it stamps the local MAC on every transmit) and the 60-byte
//! wire minimum.

use std::io;
use std::mem::size_of;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use socket2::Socket;
use tracing::{debug, trace};

use crate::frame::{ETHERTYPE, MIN_FRAME};
use crate::mac::{hexdump, Mac};

// Comfortably larger than any CEC frame; matches typical link MTUs.
const RECV_CAP: usize = 1 << 14;

pub trait LinkIo {
    fn local_mac(&self) -> Mac;

    /// Transmit one frame. The source MAC field is overwritten with the
    /// local address and the buffer is padded to [`MIN_FRAME`] if short.
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Receive one frame, waiting until `deadline` (`None` = wait
    /// forever). Returns `Ok(None)` once the deadline has passed. EINTR
    /// wakes are absorbed; event loops check their own signal flags
    /// around the outer poll instead.
    fn recv_deadline(&mut self, deadline: Option<Instant>) -> io::Result<Option<Vec<u8>>>;

    /// Descriptor for multiplexed event loops.
    fn raw_fd(&self) -> RawFd;
}

// ─── poll(2) helper ──────────────────────────────────────────────────────────

/// Outcome of waiting on a set of descriptors.
pub enum Readiness {
    /// Readable flags, one per descriptor passed in.
    Ready(Vec<bool>),
    TimedOut,
    /// A signal interrupted the wait; the caller re-checks its flags.
    Interrupted,
}

/// Wait for readability on `fds`. `timeout` of `None` waits forever.
pub fn poll_read(fds: &[RawFd], timeout: Option<Duration>) -> io::Result<Readiness> {
    let mut pfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd { fd, events: libc::POLLIN, revents: 0 })
        .collect();
    let ms: libc::c_int = match timeout {
        // round up so a sub-millisecond remainder doesn't spin
        Some(t) => {
            let extra = u128::from(t.subsec_nanos() % 1_000_000 != 0);
            (t.as_millis() + extra).min(i32::MAX as u128) as libc::c_int
        }
        None => -1,
    };
    let n = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, ms) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Readiness::Interrupted);
        }
        return Err(err);
    }
    if n == 0 {
        return Ok(Readiness::TimedOut);
    }
    Ok(Readiness::Ready(
        pfds.iter()
            .map(|p| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
            .collect(),
    ))
}

// ─── AF_PACKET link ──────────────────────────────────────────────────────────

/// Raw link bound to one Ethernet interface, CEC ethertype only.
pub struct RawLink {
    socket: Socket,
    iface: String,
    mac: Mac,
}

impl RawLink {
    pub fn open(iface: &str) -> Result<RawLink> {
        let (socket, mac) = open_packet_socket(iface)
            .with_context(|| format!("can't open raw link on {}", iface))?;
        debug!("link {} open, mac {}", iface, crate::mac::format_mac(&mac));
        Ok(RawLink { socket, iface: iface.to_string(), mac })
    }

    /// Re-open the capture socket after the interface bounced.
    pub fn reopen(&mut self) -> Result<()> {
        let (socket, mac) = open_packet_socket(&self.iface)
            .with_context(|| format!("can't reopen raw link on {}", self.iface))?;
        self.socket = socket;
        self.mac = mac;
        Ok(())
    }

    pub fn interface(&self) -> &str {
        &self.iface
    }
}

impl LinkIo for RawLink {
    fn local_mac(&self) -> Mac {
        self.mac
    }

    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        let mut buf = frame.to_vec();
        if buf.len() < MIN_FRAME {
            buf.resize(MIN_FRAME, 0);
        }
        if buf.len() >= 12 {
            buf[6..12].copy_from_slice(&self.mac);
        }
        trace!("send {} bytes\n{}", buf.len(), hexdump(&buf));
        self.socket.send(&buf)?;
        Ok(())
    }

    fn recv_deadline(&mut self, deadline: Option<Instant>) -> io::Result<Option<Vec<u8>>> {
        loop {
            let timeout = match deadline {
                Some(d) => Some(d.saturating_duration_since(Instant::now())),
                None => None,
            };
            if let Some(t) = timeout {
                if t.is_zero() {
                    // one nonblocking check, then give up
                    match poll_read(&[self.raw_fd()], Some(Duration::ZERO))? {
                        Readiness::Ready(_) => {}
                        _ => return Ok(None),
                    }
                    return self.read_one().map(Some);
                }
            }
            match poll_read(&[self.raw_fd()], timeout)? {
                Readiness::Ready(_) => return self.read_one().map(Some),
                Readiness::TimedOut => return Ok(None),
                Readiness::Interrupted => continue,
            }
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl RawLink {
    fn read_one(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; RECV_CAP];
        let uninit: &mut [std::mem::MaybeUninit<u8>] =
            unsafe { std::slice::from_raw_parts_mut(buf.as_mut_ptr() as _, buf.len()) };
        let n = self.socket.recv(uninit)?;
        buf.truncate(n);
        trace!("recv {} bytes\n{}", n, hexdump(&buf));
        Ok(buf)
    }
}

#[cfg(target_os = "linux")]
fn open_packet_socket(iface: &str) -> Result<(Socket, Mac)> {
    use socket2::{Domain, Protocol, Type};

    let proto = (ETHERTYPE as u16).to_be() as libc::c_int;
    let socket = Socket::new(Domain::PACKET, Type::RAW, Some(Protocol::from(proto)))
        .context("packet socket (are you root?)")?;
    let fd = socket.as_raw_fd();

    let mut req = ifreq_for(iface)?;
    if unsafe { libc::ioctl(fd, libc::SIOCGIFINDEX as _, &mut req) } == -1 {
        return Err(io::Error::last_os_error()).context("SIOCGIFINDEX");
    }
    let ifindex = unsafe { req.ifr_ifru.ifru_ifindex };

    let mut sa: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    sa.sll_family = libc::AF_PACKET as libc::sa_family_t;
    sa.sll_protocol = (ETHERTYPE as u16).to_be();
    sa.sll_ifindex = ifindex;
    let rc = unsafe {
        libc::bind(
            fd,
            &sa as *const libc::sockaddr_ll as *const libc::sockaddr,
            size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error()).context("bind to interface");
    }

    let mut req = ifreq_for(iface)?;
    if unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR as _, &mut req) } == -1 {
        return Err(io::Error::last_os_error()).context("SIOCGIFHWADDR");
    }
    let mut mac = [0u8; 6];
    for (i, b) in mac.iter_mut().enumerate() {
        *b = unsafe { req.ifr_ifru.ifru_hwaddr.sa_data[i] } as u8;
    }
    Ok((socket, mac))
}

#[cfg(not(target_os = "linux"))]
fn open_packet_socket(_iface: &str) -> Result<(Socket, Mac)> {
    anyhow::bail!("raw Ethernet link access requires Linux")
}

/// Bring the interface up if it is not already `UP|RUNNING`.
#[cfg(target_os = "linux")]
pub fn bring_up(iface: &str) -> Result<()> {
    let socket = Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, None)
        .context("control socket")?;
    let fd = socket.as_raw_fd();
    let mut req = ifreq_for(iface)?;
    if unsafe { libc::ioctl(fd, libc::SIOCGIFFLAGS as _, &mut req) } == -1 {
        return Err(io::Error::last_os_error()).context("SIOCGIFFLAGS");
    }
    let up = (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
    let flags = unsafe { req.ifr_ifru.ifru_flags };
    if flags & up == up {
        return Ok(());
    }
    req.ifr_ifru.ifru_flags = flags | up;
    if unsafe { libc::ioctl(fd, libc::SIOCSIFFLAGS as _, &mut req) } == -1 {
        return Err(io::Error::last_os_error()).context("SIOCSIFFLAGS");
    }
    debug!("brought {} up", iface);
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn bring_up(_iface: &str) -> Result<()> {
    anyhow::bail!("interface control requires Linux")
}

#[cfg(target_os = "linux")]
fn ifreq_for(iface: &str) -> Result<libc::ifreq> {
    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    if iface.len() >= req.ifr_name.len() {
        anyhow::bail!("interface name too long: {}", iface);
    }
    for (dst, src) in req.ifr_name.iter_mut().zip(iface.bytes()) {
        *dst = src as libc::c_char;
    }
    Ok(req)
}

// ─── In-memory link for tests ────────────────────────────────────────────────
