//! ferrite-events — the event-loop interface the TLS core is driven by.
//!
//! The reactor itself lives in the server binary; this crate only defines
//! the surface the TLS core needs from it: readiness interest sets, file
//! event callbacks, periodic tasks, and a poll(2)-based readiness wait for
//! the rare call sites that block on a single descriptor.
//!
//! Everything here assumes the single-threaded cooperative model: one
//! thread owns every descriptor, callbacks run to completion, and the only
//! suspension points are returns into the reactor.

use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use thiserror::Error;

pub mod testing;

// ── Readiness interest ────────────────────────────────────────────────────────

/// A set of readiness directions on a file descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(1);
    pub const WRITABLE: Interest = Interest(2);
    pub const BOTH: Interest = Interest(3);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every direction in `other` is present in `self`.
    /// The empty set is contained in everything.
    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    /// The direction whose readiness would unblock the opposite operation.
    pub fn opposite(self) -> Interest {
        match self {
            Interest::READABLE => Interest::WRITABLE,
            Interest::WRITABLE => Interest::READABLE,
            other => other,
        }
    }
}

impl BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Interest::NONE => write!(f, "none"),
            Interest::READABLE => write!(f, "readable"),
            Interest::WRITABLE => write!(f, "writable"),
            Interest::BOTH => write!(f, "readable|writable"),
            other => write!(f, "interest({})", other.0),
        }
    }
}

// ── Callbacks ─────────────────────────────────────────────────────────────────

/// A file-event handler. Invoked with the reactor, the descriptor, and the
/// directions that fired. Handlers are `Rc` so the reactor can be asked for
/// the currently installed handler and re-invoke it synthetically.
pub type FileProc = Rc<dyn Fn(&mut dyn Reactor, RawFd, Interest)>;

/// What a periodic task wants next: run again on the next loop iteration,
/// or stop and be removed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Tick {
    Continue,
    Stop,
}

/// A periodic task handler.
pub type TimeProc = Rc<dyn Fn(&mut dyn Reactor) -> Tick>;

/// Handle for a scheduled periodic task.
pub type TaskId = u64;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("descriptor {0} cannot be registered with the event loop")]
    Register(RawFd),
}

// ── Reactor ───────────────────────────────────────────────────────────────────

/// The slice of the event loop the TLS core consumes.
///
/// `register` adds `proc` for every direction in `interest`; registering a
/// direction that already has a handler replaces it. `unregister` removes
/// directions and is a no-op for directions that are not set. `file_proc`
/// returns the handler currently installed for a single direction, which is
/// how synthetic re-invocation (repeated reads) and self-rearming handlers
/// find their own callback.
pub trait Reactor {
    fn register(
        &mut self,
        fd: RawFd,
        interest: Interest,
        proc: FileProc,
    ) -> Result<(), ReactorError>;

    fn unregister(&mut self, fd: RawFd, interest: Interest);

    /// The directions currently registered for `fd`.
    fn interest(&self, fd: RawFd) -> Interest;

    /// The handler installed for exactly one direction, if any.
    fn file_proc(&self, fd: RawFd, interest: Interest) -> Option<FileProc>;

    /// Schedule a task that runs once per loop iteration until it returns
    /// [`Tick::Stop`] or is cancelled.
    fn schedule_periodic(&mut self, proc: TimeProc) -> TaskId;

    fn cancel_task(&mut self, id: TaskId);
}

// ── Blocking readiness wait ───────────────────────────────────────────────────

/// Wait for `fd` to become ready in any of the requested directions,
/// bounded by `timeout`. Returns the directions that are ready, or the
/// empty set on timeout.
///
/// This is a plain poll(2) on one descriptor and is independent of any
/// reactor; it exists for call sites that do deliberately blocking startup
/// I/O. Error and hangup conditions are reported as writable so the caller
/// retries the operation and surfaces the socket error.
pub fn wait_readiness(fd: RawFd, interest: Interest, timeout: Duration) -> io::Result<Interest> {
    let mut events: libc::c_short = 0;
    if interest.contains(Interest::READABLE) {
        events |= libc::POLLIN;
    }
    if interest.contains(Interest::WRITABLE) {
        events |= libc::POLLOUT;
    }

    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);

    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if rc == 0 {
        return Ok(Interest::NONE);
    }

    let mut ready = Interest::NONE;
    if pfd.revents & libc::POLLIN != 0 {
        ready |= Interest::READABLE;
    }
    if pfd.revents & (libc::POLLOUT | libc::POLLERR | libc::POLLHUP) != 0 {
        ready |= Interest::WRITABLE;
    }
    Ok(ready)
}
