//! A deterministic single-threaded reactor for tests.
//!
//! `TestReactor` keeps full registration bookkeeping, can fire readiness
//! events by hand, and can optionally poll real descriptors so loopback
//! tests run against live sockets. It also counts interest-table edits so
//! tests can assert how many reactor mutations an operation performed.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::{wait_readiness, FileProc, Interest, Reactor, ReactorError, TaskId, Tick, TimeProc};

#[derive(Default)]
struct FdSlot {
    read: Option<FileProc>,
    write: Option<FileProc>,
}

impl FdSlot {
    fn interest(&self) -> Interest {
        let mut i = Interest::NONE;
        if self.read.is_some() {
            i |= Interest::READABLE;
        }
        if self.write.is_some() {
            i |= Interest::WRITABLE;
        }
        i
    }
}

/// Test reactor with manual event injection and optional real polling.
#[derive(Default)]
pub struct TestReactor {
    slots: BTreeMap<RawFd, FdSlot>,
    tasks: Vec<(TaskId, TimeProc)>,
    next_task: TaskId,
    /// Number of interest-table mutations that actually changed state.
    pub edits: u64,
}

impl TestReactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire a readiness event by hand. Invokes the handler for each fired
    /// direction that is currently registered, readable first.
    pub fn fire(&mut self, fd: RawFd, fired: Interest) {
        for dir in [Interest::READABLE, Interest::WRITABLE] {
            if !fired.contains(dir) {
                continue;
            }
            let proc = self.file_proc(fd, dir);
            if let Some(proc) = proc {
                proc(self, fd, dir);
            }
        }
    }

    /// Run every scheduled periodic task once, dropping the ones that
    /// return [`Tick::Stop`]. Returns the number of tasks still scheduled.
    pub fn run_tasks_once(&mut self) -> usize {
        let ids: Vec<TaskId> = self.tasks.iter().map(|(id, _)| *id).collect();
        for id in ids {
            let proc = self
                .tasks
                .iter()
                .find(|(tid, _)| *tid == id)
                .map(|(_, p)| p.clone());
            let Some(proc) = proc else { continue };
            if proc(self) == Tick::Stop {
                self.tasks.retain(|(tid, _)| *tid != id);
            }
        }
        self.tasks.len()
    }

    pub fn has_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Poll every registered descriptor and dispatch whatever is ready.
    /// Returns the number of handler invocations.
    pub fn poll_and_dispatch(&mut self, timeout: Duration) -> usize {
        let watched: Vec<(RawFd, Interest)> = self
            .slots
            .iter()
            .map(|(fd, slot)| (*fd, slot.interest()))
            .filter(|(_, i)| !i.is_empty())
            .collect();

        let mut dispatched = 0;
        for (fd, interest) in watched {
            let Ok(ready) = wait_readiness(fd, interest, timeout) else {
                continue;
            };
            if ready.is_empty() {
                continue;
            }
            // Re-check registration before each call: handlers installed or
            // removed by earlier dispatches in this pass must be respected.
            for dir in [Interest::READABLE, Interest::WRITABLE] {
                if ready.contains(dir) {
                    if let Some(proc) = self.file_proc(fd, dir) {
                        proc(self, fd, dir);
                        dispatched += 1;
                    }
                }
            }
        }
        dispatched
    }
}

impl Reactor for TestReactor {
    fn register(
        &mut self,
        fd: RawFd,
        interest: Interest,
        proc: FileProc,
    ) -> Result<(), ReactorError> {
        let slot = self.slots.entry(fd).or_default();
        if interest.contains(Interest::READABLE) {
            slot.read = Some(proc.clone());
            self.edits += 1;
        }
        if interest.contains(Interest::WRITABLE) {
            slot.write = Some(proc);
            self.edits += 1;
        }
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd, interest: Interest) {
        let Some(slot) = self.slots.get_mut(&fd) else {
            return;
        };
        if interest.contains(Interest::READABLE) && slot.read.take().is_some() {
            self.edits += 1;
        }
        if interest.contains(Interest::WRITABLE) && slot.write.take().is_some() {
            self.edits += 1;
        }
        if slot.interest().is_empty() {
            self.slots.remove(&fd);
        }
    }

    fn interest(&self, fd: RawFd) -> Interest {
        self.slots
            .get(&fd)
            .map(FdSlot::interest)
            .unwrap_or(Interest::NONE)
    }

    fn file_proc(&self, fd: RawFd, interest: Interest) -> Option<FileProc> {
        let slot = self.slots.get(&fd)?;
        if interest.contains(Interest::READABLE) {
            if let Some(proc) = &slot.read {
                return Some(proc.clone());
            }
        }
        if interest.contains(Interest::WRITABLE) {
            return slot.write.clone();
        }
        None
    }

    fn schedule_periodic(&mut self, proc: TimeProc) -> TaskId {
        let id = self.next_task;
        self.next_task += 1;
        self.tasks.push((id, proc));
        id
    }

    fn cancel_task(&mut self, id: TaskId) {
        self.tasks.retain(|(tid, _)| *tid != id);
    }
}
