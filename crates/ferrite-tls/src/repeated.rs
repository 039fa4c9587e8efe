//! Synthetic reads for buffered engine data.
//!
//! TLS records are bigger than the kernel's "data available" edge. When a
//! read drains the socket into the engine but leaves a decrypted record
//! (or part of one) buffered, the reactor will never fire another
//! readable event for it. Sessions in that state are queued here, and a
//! zero-delay periodic task re-invokes their read handlers until the
//! engine is drained. The task schedules itself lazily and terminates
//! itself when the queue empties.

use std::os::unix::io::RawFd;
use std::rc::Rc;

use ferrite_events::{Interest, Reactor, Tick, TimeProc};

use crate::core::{State, TlsCore};

impl TlsCore {
    /// Queue `fd` for synthetic reads. Idempotent: a session already
    /// queued keeps its position.
    pub(crate) fn add_repeated_read(&self, reactor: &mut dyn Reactor, fd: RawFd) {
        let mut state = self.state_mut();
        let State {
            registry,
            cached,
            repeated_task,
            ..
        } = &mut *state;

        let session = registry.get_mut(fd);
        if session.cached_node.is_some() {
            return;
        }
        session.cached_node = Some(cached.push_back(fd));
        tracing::debug!(fd, backlog = cached.len(), "queued session for repeated reads");

        if repeated_task.is_none() {
            let weak = self.downgrade();
            let tick: TimeProc = Rc::new(move |reactor| match weak.upgrade() {
                Some(inner) => TlsCore::from_rc(inner).repeated_reads_tick(reactor),
                None => Tick::Stop,
            });
            *repeated_task = Some(reactor.schedule_periodic(tick));
        }
    }

    /// Drop `fd` from the queue if present. The task notices an empty
    /// queue on its next tick and stops itself.
    pub(crate) fn remove_repeated_read(&self, fd: RawFd) {
        let mut state = self.state_mut();
        let State {
            registry, cached, ..
        } = &mut *state;
        let Some(session) = registry.session_mut(fd) else {
            return;
        };
        if let Some(handle) = session.cached_node.take() {
            cached.remove(handle);
        }
    }

    fn repeated_reads_tick(&self, reactor: &mut dyn Reactor) -> Tick {
        let snapshot = {
            let mut state = self.state_mut();
            if !state.enabled || state.cached.is_empty() {
                state.repeated_task = None;
                return Tick::Stop;
            }
            let snapshot = state.cached.fds();
            if snapshot.len() > state.max_repeated_read_len {
                state.max_repeated_read_len = snapshot.len();
            }
            snapshot
        };

        for fd in snapshot {
            // A session whose fd has no READABLE interest is not ready to
            // consume data yet; it stays queued for the next tick.
            if !reactor.interest(fd).contains(Interest::READABLE) {
                continue;
            }
            // The handler is looked up at call time, so one installed by
            // an earlier invocation in this same tick is what runs.
            let Some(proc) = reactor.file_proc(fd, Interest::READABLE) else {
                continue;
            };
            proc(reactor, fd, Interest::READABLE);
            self.state_mut().total_repeated_reads += 1;
        }

        let mut state = self.state_mut();
        if state.cached.is_empty() {
            state.repeated_task = None;
            Tick::Stop
        } else {
            Tick::Continue
        }
    }
}
