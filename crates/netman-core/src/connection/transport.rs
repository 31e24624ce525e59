//! The socket under a connection, optionally wrapped in a rustls session.
//!
//! The transport only moves bytes.  Reads pull everything the socket has
//! (until `WouldBlock`) into the caller's accumulation buffer; writes are
//! done by the connection's [`WriteQueue`](super::write_queue::WriteQueue)
//! directly on [`Transport::socket`], so every byte handed to the queue must
//! already be wire bytes.  [`Transport::seal`] turns application bytes into
//! wire bytes.

use std::io::{self, Read, Write};

use bytes::BytesMut;
use mio::net::TcpStream;
use rustls::ServerConnection;

use super::ReadError;

const READ_CHUNK: usize = 16 * 1024;

pub struct Transport {
    stream: TcpStream,
    tls: Option<Box<ServerConnection>>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("stream", &self.stream)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl Transport {
    pub fn plain(stream: TcpStream) -> Self {
        Self { stream, tls: None }
    }

    pub fn tls(stream: TcpStream, session: ServerConnection) -> Self {
        Self {
            stream,
            tls: Some(Box::new(session)),
        }
    }

    pub fn socket(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// True while a TLS handshake is still in progress.
    pub fn is_handshaking(&self) -> bool {
        self.tls.as_ref().is_some_and(|tls| tls.is_handshaking())
    }

    /// Reads everything currently available into `buf`.
    ///
    /// Returns `true` when the peer has closed its side.  With TLS, `buf`
    /// receives decrypted application data only; handshake records are
    /// consumed by the session and its replies become available from
    /// [`Transport::take_tls_output`].
    ///
    /// # Errors
    ///
    /// [`ReadError::Io`] for socket failures and [`ReadError::Tls`] when the
    /// peer's records are rejected.
    pub fn read_into(&mut self, buf: &mut BytesMut) -> Result<bool, ReadError> {
        match self.tls.as_deref_mut() {
            None => read_plain(&mut self.stream, buf),
            Some(tls) => read_tls(&mut self.stream, tls, buf),
        }
    }

    /// Converts application bytes into wire bytes.
    ///
    /// Without TLS this is the identity.  With TLS the bytes are encrypted;
    /// before the handshake finishes rustls buffers them and they come out
    /// of a later call to [`Transport::take_tls_output`].
    ///
    /// # Errors
    ///
    /// Returns the I/O error rustls reports when its plaintext buffer is
    /// full.
    pub fn seal(&mut self, plain: Vec<u8>) -> io::Result<Vec<u8>> {
        match self.tls.as_deref_mut() {
            None => Ok(plain),
            Some(tls) => {
                tls.writer().write_all(&plain)?;
                Ok(drain_tls(tls))
            }
        }
    }

    /// Collects ciphertext the TLS session wants to send (handshake
    /// messages, alerts, buffered application data).  Empty without TLS.
    pub fn take_tls_output(&mut self) -> Vec<u8> {
        match self.tls.as_deref_mut() {
            None => Vec::new(),
            Some(tls) => drain_tls(tls),
        }
    }

    /// Queues a TLS `close_notify` alert; the caller sends it with
    /// [`Transport::take_tls_output`].
    pub fn send_close_notify(&mut self) {
        if let Some(tls) = self.tls.as_deref_mut() {
            tls.send_close_notify();
        }
    }
}

fn drain_tls(tls: &mut ServerConnection) -> Vec<u8> {
    let mut out = Vec::new();
    while tls.wants_write() {
        // Writing into a Vec cannot fail.
        if tls.write_tls(&mut out).is_err() {
            break;
        }
    }
    out
}

fn read_plain(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<bool, ReadError> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return Ok(true),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ReadError::Io(e)),
        }
    }
}

fn read_tls(
    stream: &mut TcpStream,
    tls: &mut ServerConnection,
    buf: &mut BytesMut,
) -> Result<bool, ReadError> {
    loop {
        match tls.read_tls(stream) {
            Ok(0) => {
                tls.process_new_packets().map_err(ReadError::Tls)?;
                read_plaintext(tls, buf)?;
                return Ok(true);
            }
            Ok(_) => {
                tls.process_new_packets().map_err(ReadError::Tls)?;
                if read_plaintext(tls, buf)? {
                    return Ok(true);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ReadError::Io(e)),
        }
    }
}

/// Moves decrypted bytes into `buf`; returns `true` once the peer has sent
/// `close_notify` or dropped the connection without one.
fn read_plaintext(tls: &mut ServerConnection, buf: &mut BytesMut) -> Result<bool, ReadError> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match tls.reader().read(&mut chunk) {
            Ok(0) => return Ok(true),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(true),
            Err(e) => return Err(ReadError::Io(e)),
        }
    }
}
