/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The stream engine seam: a pluggable handshake/encode/decode state machine layered
//! between a socket's file descriptor and the bytes the socket's user sees.
//!
//! The default engine is [`IdentityEngine`], which passes bytes through unchanged. A TLS
//! engine implements the same contract, multiplexing its own protocol flow (handshake
//! records, renegotiation) over the same edge-triggered readiness notifications without
//! the reactor caring which scheme is in use: whenever an engine call returns
//! [`WantRead`](EngineStatus::WantRead) or [`WantWrite`](EngineStatus::WantWrite), the
//! reactor re-invokes it when the underlying socket next becomes readable or writable.

use std::fmt::{self, Display, Formatter};
use std::io::{self, Read, Write};

/// Result of a single stream engine invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    /// The operation completed.
    Success,
    /// The engine needs the socket to become readable before it can make progress.
    WantRead,
    /// The engine needs the socket to become writable before it can make progress.
    WantWrite,
    /// The peer closed the stream.
    Eof,
    /// The engine failed; [`StreamEngine::last_error`] has the underlying code.
    Error,
}

/// The error-code type surfaced by sockets and engines. Carries a POSIX errno or an
/// engine-defined code. `eof` is distinguished from other errors because upstream state
/// machines treat an orderly peer close differently from a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoErrorCode {
    kind: IoErrorKind,
    errno: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoErrorKind {
    /// Orderly close by the peer.
    Eof,
    /// A second concurrent operation was started while one was in flight.
    Busy,
    /// The socket is not (or no longer) connected.
    NotConnected,
    /// The connection attempt was refused or reset.
    ConnectionFailed,
    /// A failure inside the stream engine (e.g., a TLS alert).
    Engine,
    /// Any other OS-level error; `errno` carries the code.
    Os,
}

impl IoErrorCode {
    pub const fn new(kind: IoErrorKind, errno: i32) -> Self {
        Self { kind, errno }
    }

    pub const fn eof() -> Self {
        Self::new(IoErrorKind::Eof, 0)
    }

    pub const fn busy() -> Self {
        Self::new(IoErrorKind::Busy, 0)
    }

    pub const fn not_connected() -> Self {
        Self::new(IoErrorKind::NotConnected, 0)
    }

    pub const fn connection_failed(errno: i32) -> Self {
        Self::new(IoErrorKind::ConnectionFailed, errno)
    }

    pub const fn engine(code: i32) -> Self {
        Self::new(IoErrorKind::Engine, code)
    }

    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Self::eof(),
            io::ErrorKind::NotConnected => Self::not_connected(),
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => {
                Self::connection_failed(err.raw_os_error().unwrap_or(0))
            }
            _ => Self::new(IoErrorKind::Os, err.raw_os_error().unwrap_or(0)),
        }
    }

    pub const fn kind(&self) -> IoErrorKind {
        self.kind
    }

    pub const fn errno(&self) -> i32 {
        self.errno
    }

    pub const fn is_eof(&self) -> bool {
        matches!(self.kind, IoErrorKind::Eof)
    }

    pub const fn is_busy(&self) -> bool {
        matches!(self.kind, IoErrorKind::Busy)
    }
}

impl Display for IoErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.kind {
            IoErrorKind::Eof => write!(f, "end of stream"),
            IoErrorKind::Busy => write!(f, "operation already in flight"),
            IoErrorKind::NotConnected => write!(f, "not connected"),
            IoErrorKind::ConnectionFailed => write!(f, "connection failed (errno {})", self.errno),
            IoErrorKind::Engine => write!(f, "stream engine error (code {})", self.errno),
            IoErrorKind::Os => write!(f, "i/o error (errno {})", self.errno),
        }
    }
}

/// The raw byte stream an engine reads from and writes to. Implemented by non-blocking
/// TCP streams; reads and writes may fail with [`io::ErrorKind::WouldBlock`].
pub trait RawStream: Read + Write {}

impl<T: Read + Write> RawStream for T {}

/// A handshake/encode/decode state machine layered over a raw socket.
///
/// Engine calls never block: when the underlying stream would block, the engine returns
/// `WantRead`/`WantWrite` and the reactor re-invokes the same call once the socket is
/// ready again.
pub trait StreamEngine: Send {
    /// Drive the client side of the handshake one step.
    fn client_handshake(&mut self, io: &mut dyn RawStream) -> EngineStatus;

    /// Drive the server side of the handshake one step.
    fn server_handshake(&mut self, io: &mut dyn RawStream) -> EngineStatus;

    /// Read up to `buf.len()` decoded bytes. Returns the status and the number of bytes
    /// placed into `buf` (meaningful only on `Success`).
    fn read(&mut self, io: &mut dyn RawStream, buf: &mut [u8]) -> (EngineStatus, usize);

    /// Write `buf`, encoded. Returns the status and the number of input bytes consumed.
    /// A short write returns `Success` with the partial count; the caller re-issues the
    /// remainder.
    fn write(&mut self, io: &mut dyn RawStream, buf: &[u8]) -> (EngineStatus, usize);

    /// The most recent underlying error, valid after a call returned
    /// [`EngineStatus::Error`].
    fn last_error(&self) -> IoErrorCode;
}

/// The default engine: a transparent byte pipe with a no-op handshake.
pub struct IdentityEngine {
    last_error: IoErrorCode,
}

impl IdentityEngine {
    pub fn new() -> Self {
        Self {
            last_error: IoErrorCode::new(IoErrorKind::Os, 0),
        }
    }

    fn record(&mut self, err: &io::Error) -> EngineStatus {
        let code = IoErrorCode::from_io(err);
        if code.is_eof() {
            return EngineStatus::Eof;
        }
        self.last_error = code;
        EngineStatus::Error
    }
}

impl Default for IdentityEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamEngine for IdentityEngine {
    fn client_handshake(&mut self, _io: &mut dyn RawStream) -> EngineStatus {
        EngineStatus::Success
    }

    fn server_handshake(&mut self, _io: &mut dyn RawStream) -> EngineStatus {
        EngineStatus::Success
    }

    fn read(&mut self, io: &mut dyn RawStream, buf: &mut [u8]) -> (EngineStatus, usize) {
        match io.read(buf) {
            Ok(0) => (EngineStatus::Eof, 0),
            Ok(n) => (EngineStatus::Success, n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => (EngineStatus::WantRead, 0),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => (EngineStatus::WantRead, 0),
            Err(err) => (self.record(&err), 0),
        }
    }

    fn write(&mut self, io: &mut dyn RawStream, buf: &[u8]) -> (EngineStatus, usize) {
        match io.write(buf) {
            Ok(n) => (EngineStatus::Success, n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => (EngineStatus::WantWrite, 0),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => (EngineStatus::WantWrite, 0),
            Err(err) => (self.record(&err), 0),
        }
    }

    fn last_error(&self) -> IoErrorCode {
        self.last_error
    }
}

/// Constructor for the engine attached to each accepted or dialed socket.
pub type EngineFactory = Box<dyn Fn() -> Box<dyn StreamEngine> + Send>;

/// The factory for the default, transparent engine.
pub fn identity_engine_factory() -> EngineFactory {
    Box::new(|| Box::new(IdentityEngine::new()))
}
