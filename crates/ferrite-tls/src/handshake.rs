//! Event-driven TLS negotiation.
//!
//! One state machine drives every handshake in the process. Each call
//! site (client command traffic, cluster bus in either role, replication)
//! contributes a small capability record: what to install once the
//! handshake completes, what to do on failure, and whether the descriptor
//! needs an SO_ERROR check first because it came from a non-blocking
//! connect. The driver itself only ever does one thing: step the engine,
//! then move the reactor interest to whichever direction the engine is
//! blocked on.
//!
//! A synchronous variant exists for deliberately blocking startup paths;
//! it waits on the descriptor with poll(2) instead of the reactor, each
//! round bounded by the caller's timeout.

use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use ferrite_events::{wait_readiness, FileProc, Interest, Reactor, ReactorError};
use thiserror::Error;

use crate::core::TlsCore;
use crate::engine::{EngineError, Progress};

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to create tls session: {0}")]
    Engine(#[from] EngineError),
    #[error("event loop refused registration: {0}")]
    Reactor(#[from] ReactorError),
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("timed out waiting for socket readiness")]
    Timeout,
    #[error("readiness wait failed: {0}")]
    Wait(io::Error),
    #[error("negotiation failed: {0}")]
    Engine(EngineError),
}

/// Outcome of one negotiation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    Done,
    Retry,
    Failed,
}

/// Invoked when the handshake completes, after the post-handshake handler
/// is installed.
pub type DoneHook = Rc<dyn Fn(&mut dyn Reactor, RawFd)>;
/// Invoked when the handshake fails; performs the call site's recovery.
pub type FailHook = Rc<dyn Fn(&mut dyn Reactor, RawFd)>;
/// Invoked on every blocked round; call sites use it to refresh liveness
/// timestamps while a long handshake is in flight.
pub type ProgressHook = Rc<dyn Fn(RawFd)>;

/// What one call site wants from the shared driver.
pub struct HandshakeSite {
    pub(crate) name: &'static str,
    /// Handler to install once negotiation completes. `None` leaves the
    /// descriptor quiescent until a later step drives it.
    pub(crate) post: Option<(Interest, FileProc)>,
    pub(crate) on_done: Option<DoneHook>,
    pub(crate) on_retry: Option<ProgressHook>,
    pub(crate) on_failed: FailHook,
    /// The descriptor came from a non-blocking connect; check SO_ERROR
    /// before negotiating.
    pub(crate) check_socket_error: bool,
}

impl HandshakeSite {
    /// Command traffic from an ordinary client. On completion the query
    /// handler takes over reads; on failure the client is freed.
    pub fn client(post_read: FileProc, on_failed: FailHook) -> Rc<Self> {
        Rc::new(HandshakeSite {
            name: "negotiate-with-client",
            post: Some((Interest::READABLE, post_read)),
            on_done: None,
            on_retry: None,
            on_failed,
            check_socket_error: false,
        })
    }

    /// Cluster bus, accepting side.
    pub fn cluster_as_server(post_read: FileProc, on_failed: FailHook) -> Rc<Self> {
        Rc::new(HandshakeSite {
            name: "negotiate-with-cluster-as-server",
            post: Some((Interest::READABLE, post_read)),
            on_done: None,
            on_retry: None,
            on_failed,
            check_socket_error: false,
        })
    }

    /// Cluster bus, connecting side. The descriptor comes from a
    /// non-blocking connect, so socket errors are surfaced before the
    /// first negotiation step; `on_done` finishes link setup.
    pub fn cluster_as_client(
        post_read: FileProc,
        on_done: DoneHook,
        on_failed: FailHook,
    ) -> Rc<Self> {
        Rc::new(HandshakeSite {
            name: "negotiate-with-cluster-as-client",
            post: Some((Interest::READABLE, post_read)),
            on_done: Some(on_done),
            on_retry: None,
            on_failed,
            check_socket_error: true,
        })
    }

    /// Replication client connecting to its primary. The sync state
    /// machine wants both directions once the session is up.
    pub fn replication_with_primary(
        post: FileProc,
        on_done: DoneHook,
        on_failed: FailHook,
    ) -> Rc<Self> {
        Rc::new(HandshakeSite {
            name: "negotiate-with-primary",
            post: Some((Interest::BOTH, post)),
            on_done: Some(on_done),
            on_retry: None,
            on_failed,
            check_socket_error: true,
        })
    }
}

impl TlsCore {
    /// Full TLS setup for a freshly accepted client: server-role session,
    /// generation accounting, and the negotiation handler on both
    /// directions. No-op when TLS is disabled.
    pub fn setup_client(
        &self,
        reactor: &mut dyn Reactor,
        fd: RawFd,
        site: Rc<HandshakeSite>,
    ) -> Result<(), SetupError> {
        if !self.is_enabled() {
            return Ok(());
        }
        {
            let mut state = self.state_mut();
            state.new_server_session(fd)?;
            state.connections_to_current += 1;
            state.registry.get_mut(fd).client_origin = true;
        }
        if let Err(e) = self.begin_handshake(reactor, fd, site, Interest::BOTH) {
            self.cleanup_for_fd(fd);
            return Err(e);
        }
        Ok(())
    }

    /// Server-role session without the client bookkeeping; used by the
    /// accepting side of the cluster bus.
    pub fn setup_server_session(&self, fd: RawFd) -> Result<(), SetupError> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.state_mut().new_server_session(fd)?;
        Ok(())
    }

    /// Client-role session, optionally with the peer name for SNI; used
    /// by the connecting side of the cluster bus and by replication.
    pub fn setup_client_session(
        &self,
        fd: RawFd,
        server_name: Option<&str>,
    ) -> Result<(), SetupError> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.state_mut().new_client_session(fd, server_name)?;
        Ok(())
    }

    /// Register the negotiation handler for an existing session.
    pub fn begin_handshake(
        &self,
        reactor: &mut dyn Reactor,
        fd: RawFd,
        site: Rc<HandshakeSite>,
        initial: Interest,
    ) -> Result<(), SetupError> {
        let proc = self.negotiation_proc(site);
        reactor.register(fd, initial, proc)?;
        Ok(())
    }

    pub(crate) fn negotiation_proc(&self, site: Rc<HandshakeSite>) -> FileProc {
        let weak = self.downgrade();
        Rc::new(move |reactor, fd, fired| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let core = TlsCore::from_rc(inner);
            let Some(source) = current_proc(reactor, fd, fired) else {
                return;
            };
            core.drive_handshake(reactor, fd, &site, &source);
        })
    }

    /// One step of the shared negotiation state machine.
    pub(crate) fn drive_handshake(
        &self,
        reactor: &mut dyn Reactor,
        fd: RawFd,
        site: &HandshakeSite,
        source: &FileProc,
    ) -> Negotiation {
        if site.check_socket_error {
            if let Some(err) = socket_error(fd) {
                tracing::warn!(site = site.name, fd, error = %err,
                    "socket error before tls negotiation");
                reactor.unregister(fd, Interest::BOTH);
                (site.on_failed)(reactor, fd);
                return Negotiation::Failed;
            }
        }

        tracing::debug!(site = site.name, fd, "resuming tls negotiation");
        let outcome = {
            let mut state = self.state_mut();
            state.registry.get_mut(fd).engine.negotiate()
        };

        match outcome {
            Ok(Progress::Done) => {
                let (cipher, buffered) = {
                    let state = self.state();
                    let engine = &state.registry.get(fd).engine;
                    (engine.cipher_name(), engine.buffered_plaintext())
                };
                reactor.unregister(fd, Interest::BOTH);
                if let Some((interest, handler)) = &site.post {
                    if reactor.register(fd, *interest, handler.clone()).is_err() {
                        (site.on_failed)(reactor, fd);
                        return Negotiation::Failed;
                    }
                }
                if buffered {
                    // the peer's first request rode in with its final
                    // handshake flight; the socket will not signal again
                    self.add_repeated_read(reactor, fd);
                }
                tracing::debug!(site = site.name, fd, cipher = cipher.as_deref(),
                    "tls negotiation complete");
                if let Some(done) = &site.on_done {
                    done(reactor, fd);
                }
                Negotiation::Done
            }
            Ok(Progress::WantRead) => self.rearm(reactor, fd, Interest::READABLE, site, source),
            Ok(Progress::WantWrite) => self.rearm(reactor, fd, Interest::WRITABLE, site, source),
            Err(e) => {
                tracing::warn!(site = site.name, fd, error = %e, "tls negotiation failed");
                self.state_mut().last_error = Some(e);
                reactor.unregister(fd, Interest::BOTH);
                (site.on_failed)(reactor, fd);
                Negotiation::Failed
            }
        }
    }

    /// Move reactor interest to the blocked direction: drop the opposite,
    /// and only add the needed direction if nothing is registered (the
    /// handler may already be listening there).
    fn rearm(
        &self,
        reactor: &mut dyn Reactor,
        fd: RawFd,
        needed: Interest,
        site: &HandshakeSite,
        source: &FileProc,
    ) -> Negotiation {
        reactor.unregister(fd, needed.opposite());
        if reactor.interest(fd).is_empty() {
            if reactor.register(fd, needed, source.clone()).is_err() {
                (site.on_failed)(reactor, fd);
                return Negotiation::Failed;
            }
        }
        if let Some(retry) = &site.on_retry {
            retry(fd);
        }
        Negotiation::Retry
    }

    /// Blocking negotiation for startup paths. Each blocked round waits on
    /// the descriptor with poll(2), bounded by `timeout`; the whole call
    /// can therefore take several timeouts on a slow network.
    pub fn sync_negotiate(&self, fd: RawFd, timeout: Duration) -> Result<(), HandshakeError> {
        loop {
            tracing::debug!(fd, "stepping synchronous tls negotiation");
            let outcome = {
                let mut state = self.state_mut();
                state.registry.get_mut(fd).engine.negotiate()
            };
            let needed = match outcome {
                Ok(Progress::Done) => {
                    let cipher = self.state().registry.get(fd).engine.cipher_name();
                    tracing::debug!(fd, cipher = cipher.as_deref(),
                        "synchronous tls negotiation complete");
                    return Ok(());
                }
                Ok(Progress::WantRead) => Interest::READABLE,
                Ok(Progress::WantWrite) => Interest::WRITABLE,
                Err(e) => return Err(HandshakeError::Engine(e)),
            };
            let ready = wait_readiness(fd, needed, timeout).map_err(HandshakeError::Wait)?;
            if !ready.contains(needed) {
                tracing::debug!(fd, needed = ?needed,
                    "synchronous tls negotiation timed out");
                return Err(HandshakeError::Timeout);
            }
        }
    }
}

/// The handler currently registered for the direction that fired; this is
/// how a negotiation handler finds itself to rearm.
pub(crate) fn current_proc(
    reactor: &mut dyn Reactor,
    fd: RawFd,
    fired: Interest,
) -> Option<FileProc> {
    let slot = if fired.contains(Interest::READABLE) {
        Interest::READABLE
    } else {
        Interest::WRITABLE
    };
    reactor.file_proc(fd, slot)
}

fn socket_error(fd: RawFd) -> Option<io::Error> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let sock = socket2::SockRef::from(&borrowed);
    match sock.take_error() {
        Ok(Some(e)) => Some(e),
        Ok(None) => None,
        Err(e) => Some(e),
    }
}
