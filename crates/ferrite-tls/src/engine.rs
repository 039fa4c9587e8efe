//! The TLS engine seam.
//!
//! The core never implements TLS; it drives an engine through this trait.
//! The interface mirrors what a non-blocking record engine naturally
//! offers: negotiation that reports which direction it is blocked on,
//! recv/send that either make progress or report blocked, a best-effort
//! close alert, and an explicit wipe that releases I/O buffers ahead of
//! drop. [`rustls_backend`] is the production engine; a scripted mock
//! lives beside it for tests that need exact control of the blocked paths.
//!
//! Engines never sleep. Timing-attack blinding that delays the caller is
//! unacceptable in a single-threaded reactor, so any such defense must be
//! self-service (surfaced as an error, not a stall).

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

use crate::config::{ClientTlsConfig, ServerTlsConfig};
use crate::options::PerformanceMode;

pub mod rustls_backend;

#[cfg(test)]
pub(crate) mod mock;

/// Which end of the TLS conversation a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Outcome of a negotiation step that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Handshake complete; the session is ready for application data.
    Done,
    /// Blocked until the socket is readable again.
    WantRead,
    /// Blocked until the socket is writable again.
    WantWrite,
}

/// Result of a successful plaintext read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plaintext {
    /// Bytes copied into the caller's buffer. Zero means end of stream.
    pub len: usize,
    /// True when the engine still holds decrypted data the socket will
    /// never signal again; the caller must arrange a synthetic re-read.
    pub more_buffered: bool,
}

/// Broad classification of an engine failure, used to decide how the
/// error surfaces upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The operation would block; retry on the reported readiness.
    Blocked,
    /// The underlying socket operation failed; `errno` is authoritative.
    Io,
    /// A TLS protocol failure (bad record, alert, verification).
    Protocol,
    /// The peer closed the connection.
    Closed,
    /// The engine was misused or is in an unusable state.
    Internal,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct EngineError {
    pub class: ErrorClass,
    pub message: String,
    /// Raw OS error when `class` is [`ErrorClass::Io`].
    pub errno: Option<i32>,
}

impl EngineError {
    pub fn blocked_read() -> Self {
        EngineError {
            class: ErrorClass::Blocked,
            message: "operation blocked waiting for socket readability".to_string(),
            errno: None,
        }
    }

    pub fn blocked_write() -> Self {
        EngineError {
            class: ErrorClass::Blocked,
            message: "operation blocked waiting for socket writability".to_string(),
            errno: None,
        }
    }

    pub fn io(err: &io::Error, during: &str) -> Self {
        EngineError {
            class: ErrorClass::Io,
            message: format!("{during}: {err}"),
            errno: err.raw_os_error(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        EngineError {
            class: ErrorClass::Protocol,
            message: message.into(),
            errno: None,
        }
    }

    pub fn closed(message: impl Into<String>) -> Self {
        EngineError {
            class: ErrorClass::Closed,
            message: message.into(),
            errno: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        EngineError {
            class: ErrorClass::Internal,
            message: message.into(),
            errno: None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.class == ErrorClass::Blocked
    }

    /// Map onto OS error conventions so upstream can treat TLS I/O exactly
    /// like a plain socket: blocked becomes `WouldBlock`, socket failures
    /// keep their errno, everything else is opaque.
    pub fn to_io_error(&self) -> io::Error {
        match self.class {
            ErrorClass::Blocked => io::Error::from(io::ErrorKind::WouldBlock),
            ErrorClass::Io => match self.errno {
                Some(errno) => io::Error::from_raw_os_error(errno),
                None => io::Error::new(io::ErrorKind::Other, self.clone()),
            },
            _ => io::Error::new(io::ErrorKind::Other, self.clone()),
        }
    }
}

/// A per-connection TLS engine bound to one file descriptor.
pub trait TlsEngine {
    fn role(&self) -> Role;

    /// Advance the handshake as far as the socket allows.
    fn negotiate(&mut self) -> Result<Progress, EngineError>;

    /// Read decrypted application data. Blocked means nothing was
    /// available and no ciphertext could be pulled from the socket.
    fn recv(&mut self, buf: &mut [u8]) -> Result<Plaintext, EngineError>;

    /// Write application data. An engine reports Blocked only when none of
    /// `buf` was accepted; once any byte is accepted the engine owns the
    /// record and will finish flushing it on later calls.
    fn send(&mut self, buf: &[u8]) -> Result<usize, EngineError>;

    /// Queue a close alert and push it toward the socket, best effort.
    fn shutdown(&mut self);

    /// Release I/O buffers. The engine is unusable afterwards; callers
    /// wipe immediately before dropping.
    fn wipe(&mut self);

    /// True when decrypted application data is sitting in the engine with
    /// no socket event left to announce it. The negotiation driver checks
    /// this at handshake completion: the peer's first request may ride in
    /// the same segment as its final flight.
    fn buffered_plaintext(&self) -> bool;

    /// True once a ClientHello has been observed on this session. Gates
    /// the close alert: a session that never started a handshake (or that
    /// initiated one as a client) must not emit alerts at teardown.
    fn client_hello_seen(&self) -> bool;

    /// Negotiated cipher suite, once the handshake is complete.
    fn cipher_name(&self) -> Option<String>;
}

/// Builds engines for new sessions. One factory serves the whole process;
/// swapping it out is how tests substitute the scripted engine.
pub trait EngineFactory {
    fn server(
        &self,
        config: &ServerTlsConfig,
        fd: RawFd,
        mode: PerformanceMode,
    ) -> Result<Box<dyn TlsEngine>, EngineError>;

    fn client(
        &self,
        config: &ClientTlsConfig,
        fd: RawFd,
        mode: PerformanceMode,
        server_name: Option<&str>,
    ) -> Result<Box<dyn TlsEngine>, EngineError>;
}
