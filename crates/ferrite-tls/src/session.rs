//! Per-connection TLS state.
//!
//! A session is the engine bound to one descriptor plus the bookkeeping
//! the core needs around it: which certificate generation it belongs to,
//! whether a best-effort ping is stuck mid-record, whether the replication
//! load notification went out, and where it sits in the repeated-reads
//! list. Sessions are created and destroyed by [`crate::core::TlsCore`];
//! nothing here touches the registry or counters directly.

use std::os::unix::io::RawFd;

use crate::cached::NodeHandle;
use crate::engine::{Role, TlsEngine};

pub struct Session {
    fd: RawFd,
    role: Role,
    pub(crate) engine: Box<dyn TlsEngine>,

    /// Counted against the current/previous certificate generation.
    pub(crate) client_origin: bool,
    /// Set by rotation; decides which generation counter drops at teardown.
    pub(crate) old_generation: bool,
    /// A single '\n' ping was accepted by us but not yet by the engine;
    /// until it flushes, no other plaintext may be written.
    pub(crate) ping_in_progress: bool,
    /// The '+' load-completion byte has been accepted by the transport.
    pub(crate) load_notification_sent: bool,
    /// Position in the repeated-reads list; `Some` iff the engine holds
    /// buffered data for this session.
    pub(crate) cached_node: Option<NodeHandle>,
}

impl Session {
    pub(crate) fn from_parts(fd: RawFd, role: Role, engine: Box<dyn TlsEngine>) -> Self {
        Session {
            fd,
            role,
            engine,
            client_origin: false,
            old_generation: false,
            ping_in_progress: false,
            load_notification_sent: false,
            cached_node: None,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_client_origin(&self) -> bool {
        self.client_origin
    }

    pub fn is_old_generation(&self) -> bool {
        self.old_generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockFactory;

    #[test]
    fn new_sessions_carry_no_flags() {
        let factory = MockFactory::new();
        let session = Session::from_parts(9, Role::Server, factory.server_for_test(9));
        assert_eq!(session.fd(), 9);
        assert_eq!(session.role(), Role::Server);
        assert!(!session.is_client_origin());
        assert!(!session.is_old_generation());
        assert!(!session.ping_in_progress);
        assert!(!session.load_notification_sent);
        assert!(session.cached_node.is_none());
    }
}
