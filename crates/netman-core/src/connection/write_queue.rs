//! Pending-write queue for one non-blocking socket.
//!
//! A socket may accept only part of a buffer.  The queue keeps whatever the
//! kernel refused, in order, and tells the caller when the connection's
//! interest has to flip between read and write.

use std::collections::VecDeque;
use std::io::{self, Write};

/// The single readiness interest a live connection is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// Outbound bytes not yet accepted by the socket.
#[derive(Debug)]
pub struct WriteQueue {
    chunks: VecDeque<Vec<u8>>,
    /// Bytes of the front chunk already written.
    offset: usize,
    interest: Interest,
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteQueue {
    pub fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            offset: 0,
            interest: Interest::Read,
        }
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total bytes still waiting to be written.
    pub fn pending_bytes(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum::<usize>() - self.offset
    }

    /// Sends `bytes`, queueing whatever the writer does not take.
    ///
    /// With an empty queue one write is attempted straight away; otherwise
    /// the bytes go behind the queued ones so ordering is kept.  Returns
    /// `Some(Interest::Write)` when the queue just became non-empty and the
    /// registration has to be switched.
    ///
    /// # Errors
    ///
    /// Any write error other than `WouldBlock` / `Interrupted`.
    pub fn submit<W: Write>(&mut self, writer: &mut W, bytes: Vec<u8>) -> io::Result<Option<Interest>> {
        if bytes.is_empty() {
            return Ok(None);
        }
        if !self.chunks.is_empty() {
            self.chunks.push_back(bytes);
            return Ok(None);
        }

        let written = write_some(writer, &bytes)?;
        if written == bytes.len() {
            return Ok(None);
        }

        self.chunks.push_back(bytes);
        self.offset = written;
        Ok(self.set_interest(Interest::Write))
    }

    /// Writes queued bytes until the queue is empty or the writer would
    /// block.
    ///
    /// Returns `Some(Interest::Read)` once everything has been written and
    /// the registration has to be switched back.
    ///
    /// # Errors
    ///
    /// Any write error other than `WouldBlock` / `Interrupted`.
    pub fn drain<W: Write>(&mut self, writer: &mut W) -> io::Result<Option<Interest>> {
        while let Some(front) = self.chunks.front() {
            let written = write_some(writer, &front[self.offset..])?;
            if written == 0 {
                return Ok(None);
            }
            self.offset += written;
            if self.offset == front.len() {
                self.chunks.pop_front();
                self.offset = 0;
            }
        }
        Ok(self.set_interest(Interest::Read))
    }

    /// Drops everything still queued.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.offset = 0;
        self.interest = Interest::Read;
    }

    fn set_interest(&mut self, interest: Interest) -> Option<Interest> {
        if self.interest == interest {
            None
        } else {
            self.interest = interest;
            Some(interest)
        }
    }
}

/// Writes as much of `buf` as the writer takes before it would block.
///
/// Returns the number of bytes written; `0` means the writer would block
/// before taking anything.
fn write_some<W: Write>(writer: &mut W, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match writer.write(&buf[written..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket accepted zero bytes",
                ))
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
