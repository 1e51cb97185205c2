//! Blocking typed message channel
//!
//! All integers travel big-endian; strings and byte blobs are u32
//! length-prefixed. Sends accumulate in an output buffer until
//! [`Channel::flush`]. The same channel can be upgraded to TLS in place (see
//! `tls.rs`) and later downgraded; the typed surface is identical either way.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};

use bytes::{BufMut, BytesMut};

use crate::error::{Result, WireError};
use crate::tls::TlsState;

pub(crate) enum Transport<S> {
    Plain(S),
    Tls(TlsState<S>),
    /// Transient state while the transport is being transformed.
    Dead,
}

pub struct Channel<S: Read + Write + AsRawFd> {
    pub(crate) transport: Transport<S>,
    wbuf: BytesMut,
}

fn eof_mapped(e: std::io::Error) -> WireError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        WireError::UnexpectedEof
    } else {
        WireError::Io(e)
    }
}

impl<S: Read + Write + AsRawFd> Channel<S> {
    pub fn new(sock: S) -> Channel<S> {
        Channel {
            transport: Transport::Plain(sock),
            wbuf: BytesMut::new(),
        }
    }

    pub fn fd(&self) -> RawFd {
        match &self.transport {
            Transport::Plain(s) => s.as_raw_fd(),
            Transport::Tls(t) => t.sock.as_raw_fd(),
            Transport::Dead => -1,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.transport, Transport::Tls(_))
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match &mut self.transport {
            Transport::Plain(s) => s.read_exact(buf).map_err(eof_mapped),
            Transport::Tls(t) => t.read_exact(buf).map_err(eof_mapped),
            Transport::Dead => Err(WireError::Protocol("channel transport is gone".into())),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match &mut self.transport {
            Transport::Plain(s) => s.write_all(buf).map_err(WireError::Io),
            Transport::Tls(t) => t.write_all(buf).map_err(WireError::Io),
            Transport::Dead => Err(WireError::Protocol("channel transport is gone".into())),
        }
    }

    /// Write out everything queued by the send calls.
    pub fn flush(&mut self) -> Result<()> {
        if self.wbuf.is_empty() {
            return Ok(());
        }
        let buf = self.wbuf.split();
        self.write_all(&buf)?;
        match &mut self.transport {
            Transport::Plain(s) => s.flush().map_err(WireError::Io),
            Transport::Tls(t) => t.flush().map_err(WireError::Io),
            Transport::Dead => Ok(()),
        }
    }

    pub fn send_i32(&mut self, v: i32) {
        self.wbuf.put_i32(v);
    }

    pub fn send_u32(&mut self, v: u32) {
        self.wbuf.put_u32(v);
    }

    pub fn send_string(&mut self, s: &str) {
        self.wbuf.put_u32(s.len() as u32);
        self.wbuf.put_slice(s.as_bytes());
    }

    pub fn send_bytes(&mut self, b: &[u8]) {
        self.wbuf.put_u32(b.len() as u32);
        self.wbuf.put_slice(b);
    }

    pub fn recv_i32(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    pub fn recv_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Receive a length-prefixed blob of at most `limit` bytes.
    pub fn recv_bytes_bounded(&mut self, limit: usize) -> Result<Vec<u8>> {
        let len = self.recv_u32()? as usize;
        if len > limit {
            return Err(WireError::TooLarge { got: len, limit });
        }
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Receive a length-prefixed blob that must be exactly `len` bytes.
    pub fn recv_bytes_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let got = self.recv_u32()? as usize;
        if got != len {
            return Err(WireError::Protocol(format!(
                "expected a {len} byte blob, peer sent {got}"
            )));
        }
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn recv_string_bounded(&mut self, limit: usize) -> Result<String> {
        let buf = self.recv_bytes_bounded(limit)?;
        Ok(String::from_utf8(buf)?)
    }
}
