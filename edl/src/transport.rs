// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Byte-stream channel to a device in EDL mode.
//!
//! Two implementations: [`SerialTransport`] over a COM-port-like device node,
//! and [`ScriptedTransport`], an in-memory double used by protocol tests and
//! log replay. Everything above this layer talks through the [`Transport`]
//! trait and stays oblivious to which one it got.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::debug;

use crate::error::TransportError;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Queue depth once a large-payload transfer mode has been negotiated.
pub const HIGH_THROUGHPUT_BUF: usize = 2 * 1024 * 1024;

/// A full-duplex byte stream with bounded reads.
///
/// `read` returns `Ok(0)` when the timeout expired with nothing to deliver;
/// protocol loops use that as their polling tick. A transport that has been
/// force-closed (see [`TransportGuard`]) fails every subsequent call with
/// [`TransportError::Closed`], including calls already blocked in `read`,
/// which return within one timeout.
pub trait Transport: Send {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError>;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
    fn purge(&mut self) -> Result<(), TransportError>;
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), TransportError>;
    fn read_timeout(&self) -> Duration;
    /// Switch to the large-payload profile (2 MiB staging, 3 s timeouts).
    /// No-op for transports that don't distinguish.
    fn set_high_throughput(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
    fn close(&mut self);
    fn is_open(&self) -> bool;
    /// A cloneable handle that can close this transport from another thread.
    fn guard(&self) -> TransportGuard;
}

/// Force-close handle. Tripping it is the session's one and only
/// cancellation mechanism: any reader blocked on the transport unwinds with
/// [`TransportError::Closed`].
#[derive(Clone)]
pub struct TransportGuard {
    open: Arc<AtomicBool>,
}

impl TransportGuard {
    pub fn force_close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(feature = "serial")]
pub use self::serial::SerialTransport;

#[cfg(feature = "serial")]
mod serial {
    use super::*;
    use serial2::SerialPort;

    /// OS serial port channel. 115200 8-N-1 with DTR/RTS asserted; the rate
    /// is nominal, USB-CDC ignores it.
    pub struct SerialTransport {
        port: SerialPort,
        open: Arc<AtomicBool>,
        read_timeout: Duration,
        // Drain-first read buffer, grown for high-throughput mode
        buf: Vec<u8>,
        pos: usize,
        cap: usize,
    }

    impl SerialTransport {
        pub fn open(dev_path: &str) -> Result<Self, TransportError> {
            let mut port = SerialPort::open(dev_path, |mut settings: serial2::Settings| {
                settings.set_raw();
                settings.set_baud_rate(115200)?;
                Ok(settings)
            })
            .map_err(|e| TransportError::Open(dev_path.to_owned(), e))?;

            port.set_dtr(true)
                .and_then(|()| port.set_rts(true))
                .map_err(|e| TransportError::Open(dev_path.to_owned(), e))?;
            port.set_read_timeout(DEFAULT_READ_TIMEOUT)
                .map_err(|e| TransportError::Open(dev_path.to_owned(), e))?;

            debug!("opened {dev_path} at 115200 8-N-1");
            Ok(SerialTransport {
                port,
                open: Arc::new(AtomicBool::new(true)),
                read_timeout: DEFAULT_READ_TIMEOUT,
                buf: vec![0u8; 1024 * 1024],
                pos: 0,
                cap: 0,
            })
        }

        fn check_open(&self) -> Result<(), TransportError> {
            if self.open.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(TransportError::Closed)
            }
        }
    }

    impl Transport for SerialTransport {
        fn write_all(&mut self, mut buf: &[u8]) -> Result<(), TransportError> {
            self.check_open()?;
            while !buf.is_empty() {
                let n = self.port.write(buf).map_err(TransportError::Write)?;
                if n == 0 {
                    return Err(TransportError::Write(std::io::ErrorKind::WriteZero.into()));
                }
                buf = &buf[n..];
            }
            Ok(())
        }

        fn read(&mut self, out: &mut [u8]) -> Result<usize, TransportError> {
            self.check_open()?;

            // Drain staged bytes first
            if self.pos < self.cap {
                let n = std::cmp::min(out.len(), self.cap - self.pos);
                out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }

            // Small reads (protocol headers) go through the staging buffer
            // so the OS hands us whole bursts; big rawmode reads go direct
            let res = if out.len() >= self.buf.len() {
                self.port.read(out)
            } else {
                self.port.read(&mut self.buf)
            };
            // Re-check after a potentially long block, so that a force-close
            // during the read is not swallowed by a lucky last buffer
            self.check_open()?;
            match res {
                Ok(n) if out.len() >= self.buf.len() => Ok(n),
                Ok(n) => {
                    self.pos = 0;
                    self.cap = n;
                    let take = std::cmp::min(out.len(), n);
                    out[..take].copy_from_slice(&self.buf[..take]);
                    self.pos = take;
                    Ok(take)
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    Ok(0)
                }
                Err(e) => Err(TransportError::Read(e)),
            }
        }

        fn purge(&mut self) -> Result<(), TransportError> {
            self.check_open()?;
            self.pos = 0;
            self.cap = 0;
            self.port.discard_buffers().map_err(TransportError::Read)
        }

        fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
            self.read_timeout = timeout;
            self.port
                .set_read_timeout(timeout)
                .map_err(TransportError::Read)
        }

        fn read_timeout(&self) -> Duration {
            self.read_timeout
        }

        /// Large-payload profile: 2 MiB staging buffer, 3 s read/write
        /// timeouts. Called once `<configure>` lands on a payload size worth
        /// batching.
        fn set_high_throughput(&mut self) -> Result<(), TransportError> {
            self.buf = vec![0u8; HIGH_THROUGHPUT_BUF];
            self.pos = 0;
            self.cap = 0;
            self.read_timeout = Duration::from_secs(3);
            self.port
                .set_read_timeout(self.read_timeout)
                .and_then(|()| self.port.set_write_timeout(Duration::from_secs(3)))
                .map_err(TransportError::Read)
        }

        fn close(&mut self) {
            self.open.store(false, Ordering::SeqCst);
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn guard(&self) -> TransportGuard {
            TransportGuard {
                open: self.open.clone(),
            }
        }
    }
}

/// In-memory transport driven by a canned read script. Each pushed slice is
/// delivered as one `read` return; an empty slice models a timeout tick.
/// Everything written lands in `written`, which tests inspect afterwards.
pub struct ScriptedTransport {
    reads: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    open: Arc<AtomicBool>,
    read_timeout: Duration,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        ScriptedTransport {
            reads: VecDeque::new(),
            written: Vec::new(),
            open: Arc::new(AtomicBool::new(true)),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn push_read(&mut self, bytes: &[u8]) -> &mut Self {
        self.reads.push_back(bytes.to_vec());
        self
    }

    /// One `read` returning 0 bytes, as if the timeout lapsed.
    pub fn push_timeout(&mut self) -> &mut Self {
        self.reads.push_back(Vec::new());
        self
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }

    pub fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.written)
    }

    pub fn remaining_reads(&self) -> usize {
        self.reads.len()
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for ScriptedTransport {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.written.extend_from_slice(buf);
        Ok(())
    }

    fn read(&mut self, out: &mut [u8]) -> Result<usize, TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        match self.reads.front_mut() {
            None => Ok(0),
            Some(chunk) if chunk.is_empty() => {
                self.reads.pop_front();
                Ok(0)
            }
            Some(chunk) => {
                let n = std::cmp::min(out.len(), chunk.len());
                out[..n].copy_from_slice(&chunk[..n]);
                if n == chunk.len() {
                    self.reads.pop_front();
                } else {
                    chunk.drain(..n);
                }
                Ok(n)
            }
        }
    }

    fn purge(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.read_timeout = timeout;
        Ok(())
    }

    fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn guard(&self) -> TransportGuard {
        TransportGuard {
            open: self.open.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_reads_split_across_small_buffers() {
        let mut t = ScriptedTransport::new();
        t.push_read(b"abcdef");
        let mut buf = [0u8; 4];
        assert_eq!(t.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(t.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(t.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn guard_close_fails_blocked_side() {
        let mut t = ScriptedTransport::new();
        t.push_read(b"data");
        let guard = t.guard();
        guard.force_close();
        let mut buf = [0u8; 4];
        assert!(matches!(t.read(&mut buf), Err(TransportError::Closed)));
        assert!(matches!(t.write_all(b"x"), Err(TransportError::Closed)));
        assert!(!t.is_open());
    }
}
