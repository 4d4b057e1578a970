// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures at the byte-stream level, below any protocol framing.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("couldn't open {0}: {1}")]
    Open(String, std::io::Error),

    #[error("write failed: {0}")]
    Write(std::io::Error),

    #[error("read failed: {0}")]
    Read(std::io::Error),

    #[error("read timed out after {0:?}")]
    ReadTimeout(Duration),

    /// The channel was closed underneath a blocked operation. This is the
    /// cancellation path: tripping a [`crate::CancelToken`] force-closes the
    /// transport and every in-flight call unwinds with this error.
    #[error("channel closed during I/O")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SaharaError {
    #[error("timed out waiting for a HELLO packet, is the device in EDL mode?")]
    HelloTimeout,

    #[error("malformed Sahara packet header")]
    BadHeader,

    #[error("unexpected Sahara command 0x{got:02x} (expected 0x{expected:02x})")]
    UnexpectedCommand { expected: u32, got: u32 },

    #[error("device rejected the loader image, status 0x{0:08x}")]
    LoaderRejected(u32),

    #[error("transport closed mid-handshake")]
    TransportClosed,
}

/// The library-wide error type. Variants map 1:1 onto the failure kinds the
/// engine can surface; anything not listed here terminates a session as a
/// plain [`std::io::Error`] passthrough.
#[derive(Debug, Error)]
pub enum EdlError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("sahara: {0}")]
    Sahara(#[from] SaharaError),

    #[error("malformed response: {0}")]
    BadResponse(String),

    #[error("couldn't parse XML: {0}")]
    XmlParse(String),

    /// The device NAKed a command. `logs` carries the last `<log>` lines seen
    /// on the wire, which usually contain the actual reason.
    #[error("device NAKed: {reason}")]
    Nak { reason: String, logs: Vec<String> },

    #[error("expected rawmode=\"true\" on the response, but it wasn't there")]
    RawmodeMissing,

    #[error("bad status code {0}")]
    BadStatus(u32),

    /// The device wants a vendor authentication exchange before it will
    /// accept storage commands.
    #[error("device requires authentication before storage commands")]
    NeedsAuth,

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("no VIP digest/signature pair found under {0}")]
    MissingVipFiles(PathBuf),

    #[error("unsupported auth strategy: {0}")]
    UnsupportedStrategy(String),

    #[error("storage type not supported by this programmer: {0}")]
    MemoryNotSupported(String),

    #[error("sector size mismatch: host asked {host}, device wants {device}")]
    SectorSizeMismatch { host: u64, device: u64 },

    #[error("storage init failed: {0}")]
    StorageInitFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("bad {what} magic: 0x{value:x}")]
    BadMagic { what: &'static str, value: u64 },

    #[error("no known key decrypts this image")]
    UnknownKey,

    #[error("key search exhausted after {tried} candidates in {elapsed:?}")]
    BruteForceExhausted { tried: u64, elapsed: Duration },

    #[error("corrupt metadata: {0}")]
    CorruptMetadata(String),

    /// Not a failure per se: the engine stopped at a point where only the
    /// operator can supply what's missing (typically a loader binary). The
    /// device is left in a receptive state.
    #[error("{0}")]
    RequiresUserAction(String),

    #[error("cancelled")]
    Cancelled,
}

impl EdlError {
    /// Whether this error is the cooperative-cancellation exit. Sessions
    /// report it as a clean `false`, not as a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            EdlError::Cancelled | EdlError::Transport(TransportError::Closed)
        )
    }
}

pub type Result<T> = std::result::Result<T, EdlError>;
