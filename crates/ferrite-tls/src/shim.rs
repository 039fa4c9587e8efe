//! Socket I/O shims.
//!
//! Drop-in replacements for read/write/strerror with plain-socket error
//! conventions: blocked is `WouldBlock` (EAGAIN), transport failures keep
//! their errno, and with TLS disabled every call falls straight through
//! to the OS. Upstream code stays byte-stream-shaped either way.
//!
//! The one piece of genuinely new behavior is the ping path. Upstream
//! pings are best effort: write one '\n', never retry. The engine,
//! however, requires that a record it started accepting be retried with
//! the same bytes until it is through. A blocked ping therefore marks the
//! session, and the next write flushes that '\n' before touching the
//! caller's buffer, keeping the record stream linear.

use std::io;
use std::os::unix::io::RawFd;

use ferrite_events::Reactor;

use crate::core::{State, TlsCore};
use crate::engine::ErrorClass;

impl TlsCore {
    /// Read decrypted bytes from `fd`. Needs the reactor because a read
    /// that leaves data buffered in the engine schedules a synthetic
    /// follow-up.
    pub fn read(&self, reactor: &mut dyn Reactor, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        if !self.is_enabled() {
            return os_read(fd, buf);
        }

        let result = {
            let mut state = self.state_mut();
            state.registry.get_mut(fd).engine.recv(buf)
        };

        match result {
            Ok(plain) if plain.len > 0 && plain.more_buffered => {
                // A whole record came out and the engine still holds data
                // the socket will never signal; arrange to be called again.
                self.add_repeated_read(reactor, fd);
                Ok(plain.len)
            }
            Ok(plain) => {
                self.remove_repeated_read(fd);
                Ok(plain.len)
            }
            Err(e) => {
                self.remove_repeated_read(fd);
                let io_err = e.to_io_error();
                if !e.is_blocked() {
                    self.state_mut().last_error = Some(e);
                }
                Err(io_err)
            }
        }
    }

    /// Write plaintext to `fd`. A pending ping byte is flushed first; if
    /// it still blocks, the caller's buffer is untouched.
    pub fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        if !self.is_enabled() {
            return os_write(fd, buf);
        }

        let mut state = self.state_mut();
        let State {
            registry,
            last_error,
            ..
        } = &mut *state;
        let session = registry.get_mut(fd);

        if session.ping_in_progress {
            match session.engine.send(b"\n") {
                Ok(_) => {
                    tracing::debug!(fd, "pending ping flushed");
                    session.ping_in_progress = false;
                }
                Err(e) if e.is_blocked() => return Err(e.to_io_error()),
                Err(e) => {
                    let io_err = e.to_io_error();
                    *last_error = Some(e);
                    return Err(io_err);
                }
            }
        }

        match session.engine.send(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                let io_err = e.to_io_error();
                if !e.is_blocked() {
                    *last_error = Some(e);
                }
                Err(io_err)
            }
        }
    }

    /// Best-effort liveness ping: one '\n', no retry by the caller. If
    /// the engine blocks mid-record the session is marked so the next
    /// write completes the ping first.
    pub fn ping(&self, fd: RawFd) {
        let result = self.write(fd, b"\n");
        if !self.is_enabled() {
            return;
        }
        if let Err(e) = result {
            if e.kind() == io::ErrorKind::WouldBlock {
                tracing::debug!(fd, "ping blocked mid-record, holding writes until it flushes");
                self.state_mut().registry.get_mut(fd).ping_in_progress = true;
            }
        }
    }

    /// Human-readable description of the last failure, following the
    /// strerror contract: OS message for socket-level failures (and
    /// whenever TLS is disabled), engine message otherwise.
    pub fn last_error_string(&self) -> String {
        let state = self.state();
        if !state.enabled {
            return io::Error::last_os_error().to_string();
        }
        match &state.last_error {
            Some(e) if e.class == ErrorClass::Io => match e.errno {
                Some(errno) => io::Error::from_raw_os_error(errno).to_string(),
                None => e.to_string(),
            },
            Some(e) => e.to_string(),
            None => io::Error::last_os_error().to_string(),
        }
    }
}

fn os_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn os_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testutil::core_with_mock;
    use crate::engine::mock::{MockFactory, MockScript, RecvStep, SendStep};
    use crate::engine::EngineError;
    use ferrite_events::testing::TestReactor;
    use std::collections::VecDeque;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn disabled_core_passes_straight_through() {
        let core = TlsCore::disabled();
        let mut reactor = TestReactor::new();
        let (a, mut b) = UnixStream::pair().unwrap();

        assert_eq!(core.write(a.as_raw_fd(), b"hello").unwrap(), 5);
        let mut buf = [0u8; 8];
        b.read_exact(&mut buf[..5]).unwrap();
        assert_eq!(&buf[..5], b"hello");

        b.write_all(b"world").unwrap();
        let n = core.read(&mut reactor, a.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"world");

        core.ping(a.as_raw_fd());
        let mut one = [0u8; 1];
        b.read_exact(&mut one).unwrap();
        assert_eq!(one[0], b'\n');
    }

    #[test]
    fn read_queues_session_while_engine_holds_data() {
        let factory = MockFactory::new();
        let core = core_with_mock(&factory);
        let mut reactor = TestReactor::new();

        let mut script = MockScript::default();
        script.recv = VecDeque::from([
            RecvStep::Data(b"abcd".to_vec(), true),
            RecvStep::Data(b"efgh".to_vec(), false),
        ]);
        factory.push_script(script);
        core.state_mut().new_server_session(6).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(core.read(&mut reactor, 6, &mut buf).unwrap(), 4);
        assert!(core.state().registry.get(6).cached_node.is_some());
        assert!(reactor.has_tasks());

        // second read drains the engine; the session leaves the queue
        assert_eq!(core.read(&mut reactor, 6, &mut buf).unwrap(), 4);
        assert!(core.state().registry.get(6).cached_node.is_none());
    }

    #[test]
    fn blocked_read_surfaces_as_would_block() {
        let factory = MockFactory::new();
        let core = core_with_mock(&factory);
        let mut reactor = TestReactor::new();
        factory.push_script(MockScript::default()); // recv defaults to Block
        core.state_mut().new_server_session(6).unwrap();

        let mut buf = [0u8; 16];
        let err = core.read(&mut reactor, 6, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn end_of_stream_reads_as_zero() {
        let factory = MockFactory::new();
        let core = core_with_mock(&factory);
        let mut reactor = TestReactor::new();

        let mut script = MockScript::default();
        script.recv = VecDeque::from([RecvStep::Eof]);
        factory.push_script(script);
        core.state_mut().new_server_session(6).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(core.read(&mut reactor, 6, &mut buf).unwrap(), 0);
        assert!(core.state().registry.get(6).cached_node.is_none());
    }

    #[test]
    fn blocked_ping_linearizes_with_the_next_write() {
        let factory = MockFactory::new();
        let core = core_with_mock(&factory);

        let mut script = MockScript::default();
        script.send = VecDeque::from([
            SendStep::Block,  // the ping itself
            SendStep::Accept, // retried '\n' from the next write
            SendStep::Accept, // the caller's payload
        ]);
        factory.push_script(script);
        core.state_mut().new_server_session(6).unwrap();

        core.ping(6);
        assert!(core.state().registry.get(6).ping_in_progress);

        assert_eq!(core.write(6, b"GET x\r\n").unwrap(), 7);
        assert!(!core.state().registry.get(6).ping_in_progress);
        // the ping byte reached the engine before any payload byte
        assert_eq!(factory.handle(0).borrow().sent, b"\nGET x\r\n");
    }

    #[test]
    fn write_backs_off_while_ping_is_still_stuck() {
        let factory = MockFactory::new();
        let core = core_with_mock(&factory);

        let mut script = MockScript::default();
        script.send = VecDeque::from([SendStep::Block, SendStep::Block]);
        factory.push_script(script);
        core.state_mut().new_server_session(6).unwrap();

        core.ping(6);
        let err = core.write(6, b"GET x\r\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        // nothing of the caller's buffer went anywhere
        assert!(factory.handle(0).borrow().sent.is_empty());
        assert!(core.state().registry.get(6).ping_in_progress);
    }

    #[test]
    fn repeated_pings_do_not_stack() {
        let factory = MockFactory::new();
        let core = core_with_mock(&factory);

        let mut script = MockScript::default();
        script.send = VecDeque::from([
            SendStep::Block,  // first ping blocks
            SendStep::Accept, // second ping flushes the pending '\n'
            SendStep::Accept, // and then sends its own
        ]);
        factory.push_script(script);
        core.state_mut().new_server_session(6).unwrap();

        core.ping(6);
        core.ping(6);
        assert!(!core.state().registry.get(6).ping_in_progress);
        assert_eq!(factory.handle(0).borrow().sent, b"\n\n");
    }

    #[test]
    fn error_strings_follow_the_strerror_contract() {
        let factory = MockFactory::new();
        let core = core_with_mock(&factory);

        let os = io::Error::from_raw_os_error(libc::ECONNRESET);
        let mut script = MockScript::default();
        script.send = VecDeque::from([
            SendStep::Fail(EngineError::io(&os, "socket write")),
            SendStep::Fail(EngineError::protocol("bad record mac")),
        ]);
        factory.push_script(script);
        core.state_mut().new_server_session(6).unwrap();

        let os_message = io::Error::from_raw_os_error(libc::ECONNRESET).to_string();
        assert!(core.write(6, b"x").is_err());
        assert_eq!(core.last_error_string(), os_message);

        assert!(core.write(6, b"x").is_err());
        assert_eq!(core.last_error_string(), "bad record mac");
    }
}
