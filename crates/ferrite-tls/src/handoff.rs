//! TLS re-establishment after a socket RDB transfer.
//!
//! To ship a snapshot the server forks; the child inherits the replica's
//! TLS engine and writes the bulk stream through it, so when the child
//! exits the parent's write state no longer matches the wire. The read
//! state is fine (the child never read), which is what makes the protocol
//! below possible: the replica keeps pinging '\n' while it loads, sends a
//! single '+' when done, and then both ends tear their sessions down
//! without close alerts (an alert would be encrypted with the dead write
//! state) and run a full handshake on the same TCP connection.
//!
//! Before the fork, replicas waiting on the snapshot get their read
//! handlers removed; otherwise a replica that starts renegotiating first
//! would feed handshake bytes to the command handler.

use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use ferrite_events::{FileProc, Interest, Reactor};

use crate::core::TlsCore;
use crate::handshake::{current_proc, DoneHook, FailHook, HandshakeSite, ProgressHook};

/// Callbacks for the primary-side sequence (our replica just received the
/// snapshot from a forked child).
pub struct ReplicaRdbHooks {
    /// Command handler reinstalled once the renegotiation completes.
    pub command_handler: FileProc,
    /// Refreshes the replica's ack timestamp; runs for every byte seen
    /// while waiting and on every blocked negotiation round.
    pub on_ack: ProgressHook,
    /// Runs after the renegotiation completes.
    pub on_done: Option<DoneHook>,
    /// Frees the replica.
    pub on_failed: FailHook,
}

/// Callbacks for the replica-side sequence (we just finished loading the
/// snapshot and must tell the primary, then renegotiate).
pub struct PrimaryRdbHooks {
    /// Primary hostname, passed to the fresh session for SNI.
    pub primary_host: String,
    /// Refreshes the transfer timestamp on blocked negotiation rounds.
    pub on_progress: ProgressHook,
    /// Resume normal replication consumption.
    pub on_done: DoneHook,
    /// Cancel the replication handshake.
    pub on_failed: FailHook,
}

impl TlsCore {
    /// Primary side, step 1: after the child has streamed the snapshot,
    /// watch the replica socket for liveness pings ('\n') or the load
    /// completion byte ('+'). Anything else, or a transport error, frees
    /// the replica.
    pub fn start_wait_for_replica_rdb_load(
        &self,
        reactor: &mut dyn Reactor,
        fd: RawFd,
        hooks: Rc<ReplicaRdbHooks>,
    ) {
        reactor.unregister(fd, Interest::BOTH);
        let proc = self.replica_wait_proc(hooks.clone());
        if reactor.register(fd, Interest::READABLE, proc).is_err() {
            (hooks.on_failed)(reactor, fd);
        }
    }

    fn replica_wait_proc(&self, hooks: Rc<ReplicaRdbHooks>) -> FileProc {
        let weak = self.downgrade();
        Rc::new(move |reactor, fd, _fired| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let core = TlsCore::from_rc(inner);
            tracing::debug!(fd, "checking whether replica finished loading the rdb");

            let mut byte = [0u8; 1];
            match core.read(reactor, fd, &mut byte) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    tracing::debug!(fd, error = %e, "error while waiting for replica rdb load");
                    (hooks.on_failed)(reactor, fd);
                }
                Ok(0) => {
                    tracing::debug!(fd, "replica closed while loading rdb");
                    (hooks.on_failed)(reactor, fd);
                }
                Ok(_) => {
                    (hooks.on_ack)(fd);
                    match byte[0] {
                        b'+' => {
                            core.start_handshake_with_replica_after_rdb(reactor, fd, hooks.clone())
                        }
                        b'\n' => {}
                        other => {
                            tracing::warn!(fd, byte = other,
                                "unexpected byte while waiting for replica to finish rdb load");
                            (hooks.on_failed)(reactor, fd);
                        }
                    }
                }
            }
        })
    }

    /// Primary side, step 2: the replica said '+'. Tear the stale session
    /// down with no close alert, build a fresh server-role session on the
    /// same descriptor, and drive the renegotiation; on completion the
    /// command handler takes over reads again.
    pub fn start_handshake_with_replica_after_rdb(
        &self,
        reactor: &mut dyn Reactor,
        fd: RawFd,
        hooks: Rc<ReplicaRdbHooks>,
    ) {
        tracing::debug!(fd, "rebuilding tls session for replica after rdb transfer");
        self.cleanup_for_fd_without_shutdown(fd);
        let created = { self.state_mut().new_server_session(fd) };
        if let Err(e) = created {
            tracing::warn!(fd, error = %e, "failed to rebuild tls session for replica");
            (hooks.on_failed)(reactor, fd);
            return;
        }
        reactor.unregister(fd, Interest::BOTH);

        let site = Rc::new(HandshakeSite {
            name: "negotiate-with-replica-after-rdb",
            post: Some((Interest::READABLE, hooks.command_handler.clone())),
            on_done: hooks.on_done.clone(),
            on_retry: Some(hooks.on_ack.clone()),
            on_failed: hooks.on_failed.clone(),
            check_socket_error: false,
        });
        if self
            .begin_handshake(reactor, fd, site, Interest::BOTH)
            .is_err()
        {
            (hooks.on_failed)(reactor, fd);
        }
    }

    /// Replica side: after loading the snapshot, send '+' through the old
    /// session (our write state is intact; only the primary's died), then
    /// rebuild as a client-role session and renegotiate. No post-handshake
    /// handler: the descriptor stays quiescent until `on_done` resumes
    /// replication.
    pub fn start_handshake_with_primary_after_rdb_load(
        &self,
        reactor: &mut dyn Reactor,
        fd: RawFd,
        hooks: Rc<PrimaryRdbHooks>,
    ) {
        tracing::debug!(fd, "rebuilding tls session with primary after rdb load");
        reactor.unregister(fd, Interest::BOTH);
        let proc = self.primary_after_rdb_proc(hooks.clone());
        if reactor.register(fd, Interest::WRITABLE, proc).is_err() {
            tracing::warn!(fd, "failed to register load-notification handler");
            (hooks.on_failed)(reactor, fd);
        }
    }

    fn primary_after_rdb_proc(&self, hooks: Rc<PrimaryRdbHooks>) -> FileProc {
        let weak = self.downgrade();
        Rc::new(move |reactor, fd, fired| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let core = TlsCore::from_rc(inner);

            let notified = core.state().registry.get(fd).load_notification_sent;
            if !notified {
                match core.write(fd, b"+") {
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                    Err(e) => {
                        tracing::warn!(fd, error = %e,
                            "failed to write load-completion byte to primary");
                        (hooks.on_failed)(reactor, fd);
                        return;
                    }
                    Ok(_) => {}
                }

                core.cleanup_for_fd_without_shutdown(fd);
                let created = {
                    core.state_mut()
                        .new_client_session(fd, Some(&hooks.primary_host))
                };
                if let Err(e) = created {
                    tracing::warn!(fd, error = %e, "failed to rebuild tls session with primary");
                    (hooks.on_failed)(reactor, fd);
                    return;
                }
                core.state_mut().registry.get_mut(fd).load_notification_sent = true;
                tracing::debug!(fd, "sent load-completion byte and rebuilt tls session");
            }

            let Some(source) = current_proc(reactor, fd, fired) else {
                return;
            };
            let site = HandshakeSite {
                name: "negotiate-with-primary-after-rdb-load",
                post: None,
                on_done: Some(hooks.on_done.clone()),
                on_retry: Some(hooks.on_progress.clone()),
                on_failed: hooks.on_failed.clone(),
                check_socket_error: false,
            };
            core.drive_handshake(reactor, fd, &site, &source);
        })
    }

    /// Pre-fork preparation: replicas that are waiting for the snapshot
    /// lose their read handlers so a replica-initiated renegotiation
    /// cannot reach the command handler. The caller passes the
    /// descriptors of every replica in that state.
    pub fn drop_read_handlers_for_pending_replicas(
        &self,
        reactor: &mut dyn Reactor,
        fds: &[RawFd],
    ) {
        if !self.is_enabled() {
            return;
        }
        for &fd in fds {
            tracing::debug!(fd, "removing read handler for replica awaiting rdb completion");
            reactor.unregister(fd, Interest::READABLE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testutil::core_with_mock;
    use crate::engine::mock::{MockFactory, MockScript, RecvStep, SendStep};
    use crate::engine::{Progress, Role};
    use ferrite_events::testing::TestReactor;
    use std::cell::Cell;
    use std::collections::VecDeque;

    struct Recorded {
        acks: Rc<Cell<u32>>,
        done: Rc<Cell<bool>>,
        failed: Rc<Cell<bool>>,
        commands: Rc<Cell<u32>>,
    }

    fn replica_hooks() -> (Rc<ReplicaRdbHooks>, Recorded) {
        let acks = Rc::new(Cell::new(0));
        let done = Rc::new(Cell::new(false));
        let failed = Rc::new(Cell::new(false));
        let commands = Rc::new(Cell::new(0));

        let a = acks.clone();
        let d = done.clone();
        let f = failed.clone();
        let c = commands.clone();
        let hooks = Rc::new(ReplicaRdbHooks {
            command_handler: Rc::new(move |_, _, _| c.set(c.get() + 1)),
            on_ack: Rc::new(move |_| a.set(a.get() + 1)),
            on_done: Some(Rc::new(move |_, _| d.set(true))),
            on_failed: Rc::new(move |_, _| f.set(true)),
        });
        (
            hooks,
            Recorded {
                acks,
                done,
                failed,
                commands,
            },
        )
    }

    #[test]
    fn replica_pings_then_completion_byte_trigger_renegotiation() {
        let factory = MockFactory::new();
        let core = core_with_mock(&factory);
        let mut reactor = TestReactor::new();

        // stale post-transfer session: write state is poisoned, and it has
        // seen a ClientHello, which must NOT produce a close alert
        let mut script = MockScript::default();
        script.client_hello_seen = true;
        script.recv = VecDeque::from([
            RecvStep::Data(b"\n".to_vec(), false),
            RecvStep::Data(b"+".to_vec(), false),
        ]);
        factory.push_script(script);
        core.state_mut().new_server_session(9).unwrap();

        let (hooks, recorded) = replica_hooks();
        core.start_wait_for_replica_rdb_load(&mut reactor, 9, hooks);
        assert_eq!(reactor.interest(9), Interest::READABLE);

        // liveness ping refreshes the ack time and nothing else
        reactor.fire(9, Interest::READABLE);
        assert_eq!(recorded.acks.get(), 1);
        assert_eq!(factory.created_count(), 1);

        // completion byte: stale session torn down without a close alert,
        // fresh server session negotiates
        let mut renegotiation = MockScript::default();
        renegotiation.negotiate = VecDeque::from([Ok(Progress::WantRead), Ok(Progress::Done)]);
        factory.push_script(renegotiation);
        reactor.fire(9, Interest::READABLE);

        assert_eq!(recorded.acks.get(), 2);
        assert_eq!(factory.created_count(), 2);
        let old = factory.handle(0);
        assert!(old.borrow().wiped);
        assert_eq!(old.borrow().shutdown_calls, 0, "no close alert on poisoned write state");
        assert_eq!(reactor.interest(9), Interest::BOTH);

        // blocked round refreshes the ack time too
        reactor.fire(9, Interest::READABLE);
        assert_eq!(recorded.acks.get(), 3);
        assert_eq!(reactor.interest(9), Interest::READABLE);

        // completion installs the command handler again
        reactor.fire(9, Interest::READABLE);
        assert!(recorded.done.get());
        assert_eq!(reactor.interest(9), Interest::READABLE);
        reactor.fire(9, Interest::READABLE);
        assert_eq!(recorded.commands.get(), 1);
        assert!(!recorded.failed.get());
    }

    #[test]
    fn unexpected_byte_frees_the_replica() {
        let factory = MockFactory::new();
        let core = core_with_mock(&factory);
        let mut reactor = TestReactor::new();

        let mut script = MockScript::default();
        script.recv = VecDeque::from([RecvStep::Data(b"x".to_vec(), false)]);
        factory.push_script(script);
        core.state_mut().new_server_session(9).unwrap();

        let (hooks, recorded) = replica_hooks();
        core.start_wait_for_replica_rdb_load(&mut reactor, 9, hooks);
        reactor.fire(9, Interest::READABLE);
        assert!(recorded.failed.get());
    }

    #[test]
    fn transport_error_while_waiting_frees_the_replica() {
        let factory = MockFactory::new();
        let core = core_with_mock(&factory);
        let mut reactor = TestReactor::new();

        let mut script = MockScript::default();
        script.recv = VecDeque::from([
            RecvStep::Block,
            RecvStep::Fail(crate::engine::EngineError::protocol("bad record mac")),
        ]);
        factory.push_script(script);
        core.state_mut().new_server_session(9).unwrap();

        let (hooks, recorded) = replica_hooks();
        core.start_wait_for_replica_rdb_load(&mut reactor, 9, hooks);

        // a blocked read just waits
        reactor.fire(9, Interest::READABLE);
        assert!(!recorded.failed.get());
        assert_eq!(recorded.acks.get(), 0);

        // a hard engine error frees the replica
        reactor.fire(9, Interest::READABLE);
        assert!(recorded.failed.get());
    }

    #[test]
    fn replica_side_sends_plus_then_renegotiates_as_client() {
        let factory = MockFactory::new();
        let core = core_with_mock(&factory);
        let mut reactor = TestReactor::new();

        // old session to the primary; '+' blocks once, then goes through
        let mut script = MockScript::default();
        script.client_hello_seen = true;
        script.send = VecDeque::from([SendStep::Block, SendStep::Accept]);
        factory.push_script(script);
        core.state_mut()
            .new_client_session(9, Some("primary.example.com"))
            .unwrap();

        let progress = Rc::new(Cell::new(0));
        let done = Rc::new(Cell::new(false));
        let failed = Rc::new(Cell::new(false));
        let p = progress.clone();
        let d = done.clone();
        let f = failed.clone();
        let hooks = Rc::new(PrimaryRdbHooks {
            primary_host: "primary.example.com".to_string(),
            on_progress: Rc::new(move |_| p.set(p.get() + 1)),
            on_done: Rc::new(move |_, _| d.set(true)),
            on_failed: Rc::new(move |_, _| f.set(true)),
        });

        core.start_handshake_with_primary_after_rdb_load(&mut reactor, 9, hooks);
        assert_eq!(reactor.interest(9), Interest::WRITABLE);

        // first writable round: '+' blocked, session unchanged
        reactor.fire(9, Interest::WRITABLE);
        assert_eq!(factory.created_count(), 1);
        assert!(!core.state().registry.get(9).load_notification_sent);

        // second round: '+' accepted, old session torn down without an
        // alert, fresh client session starts negotiating
        let mut renegotiation = MockScript::default();
        renegotiation.negotiate = VecDeque::from([Ok(Progress::WantRead), Ok(Progress::Done)]);
        factory.push_script(renegotiation);
        reactor.fire(9, Interest::WRITABLE);

        let old = factory.handle(0);
        assert_eq!(old.borrow().sent, b"+");
        assert!(old.borrow().wiped);
        assert_eq!(old.borrow().shutdown_calls, 0);
        assert_eq!(factory.created_count(), 2);
        let fresh = factory.handle(1);
        assert_eq!(fresh.borrow().fd, 9);
        assert!(matches!(fresh.borrow().role, Some(Role::Client)));
        assert_eq!(
            fresh.borrow().server_name.as_deref(),
            Some("primary.example.com")
        );
        assert!(core.state().registry.get(9).load_notification_sent);
        assert_eq!(progress.get(), 1);
        assert_eq!(reactor.interest(9), Interest::READABLE);

        // final round: negotiation completes, no handler is reinstalled
        reactor.fire(9, Interest::READABLE);
        assert!(done.get());
        assert!(!failed.get());
        assert!(reactor.interest(9).is_empty());
    }

    #[test]
    fn pre_fork_removes_only_read_handlers() {
        let factory = MockFactory::new();
        let core = core_with_mock(&factory);
        let mut reactor = TestReactor::new();

        let noop: FileProc = Rc::new(|_, _, _| {});
        reactor.register(3, Interest::BOTH, noop.clone()).unwrap();
        reactor.register(4, Interest::READABLE, noop).unwrap();

        core.drop_read_handlers_for_pending_replicas(&mut reactor, &[3, 4]);
        assert_eq!(reactor.interest(3), Interest::WRITABLE);
        assert!(reactor.interest(4).is_empty());
    }

    #[test]
    fn pre_fork_is_a_noop_when_disabled() {
        let core = TlsCore::disabled();
        let mut reactor = TestReactor::new();
        let noop: FileProc = Rc::new(|_, _, _| {});
        reactor.register(3, Interest::READABLE, noop).unwrap();
        core.drop_read_handlers_for_pending_replicas(&mut reactor, &[3]);
        assert_eq!(reactor.interest(3), Interest::READABLE);
    }
}
