//! rustls-backed TLS engine.
//!
//! Pumps rustls' record machine over a raw non-blocking descriptor:
//! `read_tls`/`process_new_packets` on the way in, `write_tls` on the way
//! out, with `WouldBlock` from the socket translated into the engine's
//! blocked classes. rustls never sleeps on failure paths, which is exactly
//! the blinding behavior the single-threaded loop requires.

use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;

use super::{EngineError, EngineFactory, Plaintext, Progress, Role, TlsEngine};
use crate::config::{ClientTlsConfig, ServerTlsConfig};
use crate::options::PerformanceMode;

/// Raw-descriptor reader/writer handed to rustls. The descriptor is owned
/// by the connection upstream; this wrapper never closes it.
struct FdIo(RawFd);

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.0, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct RustlsEngine {
    /// `None` once wiped.
    conn: Option<rustls::Connection>,
    fd: RawFd,
    role: Role,
    client_hello_seen: bool,
    /// Decrypted bytes waiting in the engine after the last record pass.
    pending_plaintext: usize,
}

impl RustlsEngine {
    fn conn_mut(&mut self) -> Result<&mut rustls::Connection, EngineError> {
        self.conn
            .as_mut()
            .ok_or_else(|| EngineError::internal("engine used after wipe"))
    }

    /// Push queued TLS records to the socket until drained or blocked.
    fn flush_tls(conn: &mut rustls::Connection, fd: RawFd) -> Result<(), EngineError> {
        while conn.wants_write() {
            match conn.write_tls(&mut FdIo(fd)) {
                Ok(0) => {
                    return Err(EngineError::io(
                        &io::Error::from(io::ErrorKind::WriteZero),
                        "socket write",
                    ))
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(EngineError::blocked_write())
                }
                Err(e) => return Err(EngineError::io(&e, "socket write")),
            }
        }
        Ok(())
    }

    /// Run `process_new_packets`, flushing any alert rustls queued before
    /// surfacing the failure.
    fn process(conn: &mut rustls::Connection, fd: RawFd) -> Result<rustls::IoState, EngineError> {
        match conn.process_new_packets() {
            Ok(state) => Ok(state),
            Err(e) => {
                let _ = conn.write_tls(&mut FdIo(fd));
                Err(EngineError::protocol(e.to_string()))
            }
        }
    }
}

impl TlsEngine for RustlsEngine {
    fn role(&self) -> Role {
        self.role
    }

    fn negotiate(&mut self) -> Result<Progress, EngineError> {
        let fd = self.fd;
        if self.conn.is_none() {
            return Err(EngineError::internal("engine used after wipe"));
        }
        loop {
            let pending;
            {
                let conn = self.conn.as_mut().expect("checked above");
                if conn.wants_write() {
                    match Self::flush_tls(conn, fd) {
                        Ok(()) => {}
                        Err(e) if e.is_blocked() => return Ok(Progress::WantWrite),
                        Err(e) => return Err(e),
                    }
                }
                if !conn.is_handshaking() {
                    return Ok(Progress::Done);
                }
                match conn.read_tls(&mut FdIo(fd)) {
                    Ok(0) => return Err(EngineError::closed("peer closed during negotiation")),
                    Ok(_) => {
                        let state = Self::process(conn, fd)?;
                        pending = state.plaintext_bytes_to_read();
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(Progress::WantRead)
                    }
                    Err(e) => return Err(EngineError::io(&e, "socket read")),
                }
            }
            // a ciphertext chunk was read and processed; it may have
            // carried early application data along with the handshake
            self.pending_plaintext = pending;
            if self.role == Role::Server {
                self.client_hello_seen = true;
            }
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Plaintext, EngineError> {
        enum Step {
            Delivered(usize, usize),
            Eof,
            Pulled(usize),
        }

        let fd = self.fd;
        if self.conn.is_none() {
            return Err(EngineError::internal("engine used after wipe"));
        }
        loop {
            let step = {
                let conn = self.conn.as_mut().expect("checked above");
                match conn.reader().read(buf) {
                    Ok(len) => {
                        // Whether more decrypted data is waiting decides if
                        // the caller schedules a synthetic re-read.
                        let remaining = conn
                            .process_new_packets()
                            .map(|s| s.plaintext_bytes_to_read())
                            .unwrap_or(0);
                        Step::Delivered(len, remaining)
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        match conn.read_tls(&mut FdIo(fd)) {
                            Ok(0) => {
                                tracing::debug!(fd, "peer closed connection");
                                Step::Eof
                            }
                            Ok(_) => {
                                let state = Self::process(conn, fd)?;
                                Step::Pulled(state.plaintext_bytes_to_read())
                            }
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                return Err(EngineError::blocked_read())
                            }
                            Err(e) => return Err(EngineError::io(&e, "socket read")),
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        tracing::debug!(fd, "peer closed without close alert");
                        Step::Eof
                    }
                    Err(e) => return Err(EngineError::io(&e, "tls read")),
                }
            };
            match step {
                Step::Delivered(len, remaining) => {
                    self.pending_plaintext = remaining;
                    return Ok(Plaintext {
                        len,
                        more_buffered: len > 0 && remaining > 0,
                    });
                }
                Step::Eof => {
                    self.pending_plaintext = 0;
                    return Ok(Plaintext {
                        len: 0,
                        more_buffered: false,
                    });
                }
                Step::Pulled(pending) => {
                    self.pending_plaintext = pending;
                }
            }
        }
    }

    fn send(&mut self, buf: &[u8]) -> Result<usize, EngineError> {
        let fd = self.fd;
        let conn = self.conn_mut()?;

        // Earlier records must reach the socket before new plaintext is
        // committed, otherwise "blocked" could be reported for data the
        // engine already owns.
        if conn.wants_write() {
            Self::flush_tls(conn, fd)?;
        }

        let accepted = conn
            .writer()
            .write(buf)
            .map_err(|e| EngineError::io(&e, "tls write"))?;
        if accepted == 0 && !buf.is_empty() {
            return Err(EngineError::blocked_write());
        }

        // Push toward the socket; the data is committed either way and
        // later calls finish the flush.
        match Self::flush_tls(conn, fd) {
            Ok(()) => {}
            Err(e) if e.is_blocked() => {}
            Err(e) => return Err(e),
        }
        Ok(accepted)
    }

    fn shutdown(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.send_close_notify();
            let _ = conn.write_tls(&mut FdIo(self.fd));
        }
    }

    fn wipe(&mut self) {
        self.conn = None;
    }

    fn buffered_plaintext(&self) -> bool {
        self.pending_plaintext > 0
    }

    fn client_hello_seen(&self) -> bool {
        self.client_hello_seen
    }

    fn cipher_name(&self) -> Option<String> {
        self.conn
            .as_ref()?
            .negotiated_cipher_suite()
            .map(|suite| format!("{:?}", suite.suite()))
    }
}

/// Default engine factory.
pub struct RustlsFactory;

impl EngineFactory for RustlsFactory {
    fn server(
        &self,
        config: &ServerTlsConfig,
        fd: RawFd,
        mode: PerformanceMode,
    ) -> Result<Box<dyn TlsEngine>, EngineError> {
        let conn = rustls::ServerConnection::new(config.shared())
            .map_err(|e| EngineError::protocol(format!("creating server session: {e}")))?;
        tracing::debug!(fd, mode = mode.as_str(), "tls server engine bound");
        Ok(Box::new(RustlsEngine {
            conn: Some(conn.into()),
            fd,
            role: Role::Server,
            client_hello_seen: false,
            pending_plaintext: 0,
        }))
    }

    fn client(
        &self,
        config: &ClientTlsConfig,
        fd: RawFd,
        mode: PerformanceMode,
        server_name: Option<&str>,
    ) -> Result<Box<dyn TlsEngine>, EngineError> {
        // Peer verification keys off the expected certificate name, so the
        // SNI value is advisory; without one, fall back to the name the
        // config carries.
        let name = server_name.unwrap_or_else(|| config.fallback_server_name());
        let server_name = rustls::pki_types::ServerName::try_from(name.to_string())
            .map_err(|e| EngineError::internal(format!("invalid server name {name:?}: {e}")))?;
        let conn = rustls::ClientConnection::new(config.shared(), server_name)
            .map_err(|e| EngineError::protocol(format!("creating client session: {e}")))?;
        tracing::debug!(fd, mode = mode.as_str(), sni = name, "tls client engine bound");
        Ok(Box::new(RustlsEngine {
            conn: Some(conn.into()),
            fd,
            role: Role::Client,
            client_hello_seen: false,
            pending_plaintext: 0,
        }))
    }
}
