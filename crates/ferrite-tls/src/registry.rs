//! The fd → session map.
//!
//! A dense vector indexed by descriptor. The OS allocates descriptors as
//! small integers from the lowest free slot, so a vector sized for
//! maxclients plus headroom wastes little and makes every lookup an index.
//! Bounds and occupancy violations are bugs in connection ownership, not
//! runtime conditions, and fail hard.

use std::os::unix::io::RawFd;

use thiserror::Error;

use crate::session::Session;

/// Extra slots beyond maxclients for listeners, pipes, and log files.
pub const FD_HEADROOM: usize = 128;

#[derive(Debug, Error)]
#[error("cannot resize session registry to {requested}: fd {live_fd} is still attached")]
pub struct ResizeError {
    pub requested: usize,
    pub live_fd: RawFd,
}

#[derive(Default)]
pub struct SessionRegistry {
    slots: Vec<Option<Session>>,
}

impl SessionRegistry {
    pub fn with_capacity(size: usize) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(size, || None);
        Self { slots }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Store a session under its descriptor. The slot must be vacant and
    /// in bounds.
    pub fn attach(&mut self, session: Session) {
        let fd = session.fd();
        let index = usize::try_from(fd).expect("negative fd attached to registry");
        assert!(
            index < self.slots.len(),
            "fd {fd} out of registry bounds ({})",
            self.slots.len()
        );
        assert!(
            self.slots[index].is_none(),
            "fd {fd} already has a tls session attached"
        );
        self.slots[index] = Some(session);
    }

    /// Remove and return the session for a descriptor, if any.
    pub fn detach(&mut self, fd: RawFd) -> Option<Session> {
        let index = self.index(fd);
        self.slots[index].take()
    }

    pub fn session(&self, fd: RawFd) -> Option<&Session> {
        let index = self.index(fd);
        self.slots[index].as_ref()
    }

    pub fn session_mut(&mut self, fd: RawFd) -> Option<&mut Session> {
        let index = self.index(fd);
        self.slots[index].as_mut()
    }

    /// Lookup that asserts presence; used on paths where a missing session
    /// means the reactor invoked us for a descriptor we do not own.
    pub fn get(&self, fd: RawFd) -> &Session {
        self.session(fd)
            .unwrap_or_else(|| panic!("no tls session attached to fd {fd}"))
    }

    pub fn get_mut(&mut self, fd: RawFd) -> &mut Session {
        self.session_mut(fd)
            .unwrap_or_else(|| panic!("no tls session attached to fd {fd}"))
    }

    /// Highest descriptor with a live session.
    pub fn highest_live_fd(&self) -> Option<RawFd> {
        self.slots
            .iter()
            .enumerate()
            .rev()
            .find(|(_, slot)| slot.is_some())
            .map(|(index, _)| index as RawFd)
    }

    /// Grow or shrink the registry. Shrinking below a live descriptor
    /// would silently orphan its session, so that is refused.
    pub fn resize(&mut self, new_size: usize) -> Result<(), ResizeError> {
        if new_size == self.slots.len() {
            return Ok(());
        }
        if let Some(live_fd) = self.highest_live_fd() {
            if live_fd as usize >= new_size {
                return Err(ResizeError {
                    requested: new_size,
                    live_fd,
                });
            }
        }
        self.slots.resize_with(new_size, || None);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }

    fn index(&self, fd: RawFd) -> usize {
        let index = usize::try_from(fd).expect("negative fd queried in registry");
        assert!(
            index < self.slots.len(),
            "fd {fd} out of registry bounds ({})",
            self.slots.len()
        );
        index
    }
}
