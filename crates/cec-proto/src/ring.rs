//! Ring backscroll — the last [`MAX_PAYLOAD`] bytes of local output,
//! replayed to clients when they connect.

use crate::frame::MAX_PAYLOAD;

/// Fixed-size byte ring with a monotonically increasing write pointer.
/// The logical content is the newest `min(written, capacity)` bytes in
/// chronological order.
pub struct Backscroll {
    buf: [u8; MAX_PAYLOAD],
    ptr: u64,
}

impl Default for Backscroll {
    fn default() -> Self {
        Backscroll { buf: [0; MAX_PAYLOAD], ptr: 0 }
    }
}

impl Backscroll {
    pub fn new() -> Backscroll {
        Backscroll::default()
    }

    /// Bytes of logical content currently held.
    pub fn len(&self) -> usize {
        (self.ptr as usize).min(MAX_PAYLOAD)
    }

    pub fn is_empty(&self) -> bool {
        self.ptr == 0
    }

    /// Append bytes. A chunk larger than the capacity keeps only its tail
    /// (older bytes would be overwritten within the same call anyway).
    pub fn write(&mut self, bytes: &[u8]) {
        let n = self.buf.len();
        let start = bytes.len().saturating_sub(n);
        let src = &bytes[start..];
        // each byte of `bytes` logically lands at (ptr + offset) % n; the
        // dropped prefix of an oversize chunk still advances the pointer
        let at = ((self.ptr + start as u64) % n as u64) as usize;
        if at + src.len() > n {
            // crosses the end: head copy then tail copy
            let head = n - at;
            self.buf[at..].copy_from_slice(&src[..head]);
            self.buf[..src.len() - head].copy_from_slice(&src[head..]);
        } else {
            self.buf[at..at + src.len()].copy_from_slice(src);
        }
        self.ptr += bytes.len() as u64;
    }

    /// Newest content, oldest byte first.
    pub fn snapshot(&self) -> Vec<u8> {
        let n = self.buf.len();
        if (self.ptr as usize) <= n {
            return self.buf[..self.ptr as usize].to_vec();
        }
        let at = (self.ptr as usize) % n;
        let mut out = Vec::with_capacity(n);
        out.extend_from_slice(&self.buf[at..]);
        out.extend_from_slice(&self.buf[..at]);
        out
    }

    /// Newest `limit` bytes of content, oldest byte first. Used when the
    /// replay shares a frame with a banner and must fit [`MAX_PAYLOAD`].
    pub fn tail(&self, limit: usize) -> Vec<u8> {
        let snap = self.snapshot();
        let start = snap.len().saturating_sub(limit);
        snap[start..].to_vec()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
