//! Scripted engine for tests.
//!
//! Real TLS stacks rarely produce blocked sends or mid-handshake rearms on
//! demand; this engine replays an exact script of outcomes so the shim,
//! driver, and handoff paths can be pinned down deterministically. Each
//! created engine shares its state with the test through a handle, so
//! tests can inspect what was sent and how teardown went.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use super::{EngineError, EngineFactory, Plaintext, Progress, Role, TlsEngine};
use crate::config::{ClientTlsConfig, ServerTlsConfig};
use crate::options::PerformanceMode;

pub(crate) enum RecvStep {
    /// Deliver bytes; the flag is the "engine still holds plaintext" signal.
    Data(Vec<u8>, bool),
    Block,
    Eof,
    Fail(EngineError),
}

pub(crate) enum SendStep {
    Accept,
    Block,
    Fail(EngineError),
}

/// Per-engine script. Empty queues fall back to: negotiate wants read,
/// recv blocks, send accepts.
#[derive(Default)]
pub(crate) struct MockScript {
    pub negotiate: VecDeque<Result<Progress, EngineError>>,
    pub recv: VecDeque<RecvStep>,
    pub send: VecDeque<SendStep>,
    pub client_hello_seen: bool,
    /// Reported by `buffered_plaintext`, as if negotiation pulled early
    /// application data into the engine.
    pub buffered_plaintext: bool,
}

impl MockScript {
    pub fn negotiate_done() -> Self {
        MockScript {
            negotiate: VecDeque::from([Ok(Progress::Done)]),
            ..Default::default()
        }
    }
}

#[derive(Default)]
pub(crate) struct MockEngineState {
    pub script: MockScript,
    pub sent: Vec<u8>,
    pub shutdown_calls: usize,
    pub wiped: bool,
    pub role: Option<Role>,
    pub server_name: Option<String>,
    pub fd: RawFd,
}

pub(crate) type MockHandle = Rc<RefCell<MockEngineState>>;

pub(crate) struct MockEngine {
    state: MockHandle,
    role: Role,
}

impl TlsEngine for MockEngine {
    fn role(&self) -> Role {
        self.role
    }

    fn negotiate(&mut self) -> Result<Progress, EngineError> {
        self.state
            .borrow_mut()
            .script
            .negotiate
            .pop_front()
            .unwrap_or(Ok(Progress::WantRead))
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Plaintext, EngineError> {
        let step = self.state.borrow_mut().script.recv.pop_front();
        match step.unwrap_or(RecvStep::Block) {
            RecvStep::Data(bytes, more_buffered) => {
                let len = bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&bytes[..len]);
                Ok(Plaintext { len, more_buffered })
            }
            RecvStep::Block => Err(EngineError::blocked_read()),
            RecvStep::Eof => Ok(Plaintext {
                len: 0,
                more_buffered: false,
            }),
            RecvStep::Fail(e) => Err(e),
        }
    }

    fn send(&mut self, buf: &[u8]) -> Result<usize, EngineError> {
        let mut state = self.state.borrow_mut();
        match state.script.send.pop_front().unwrap_or(SendStep::Accept) {
            SendStep::Accept => {
                state.sent.extend_from_slice(buf);
                Ok(buf.len())
            }
            SendStep::Block => Err(EngineError::blocked_write()),
            SendStep::Fail(e) => Err(e),
        }
    }

    fn shutdown(&mut self) {
        self.state.borrow_mut().shutdown_calls += 1;
    }

    fn wipe(&mut self) {
        self.state.borrow_mut().wiped = true;
    }

    fn buffered_plaintext(&self) -> bool {
        self.state.borrow().script.buffered_plaintext
    }

    fn client_hello_seen(&self) -> bool {
        self.state.borrow().script.client_hello_seen
    }

    fn cipher_name(&self) -> Option<String> {
        Some("TLS_MOCK_SUITE".to_string())
    }
}

#[derive(Default)]
struct FactoryInner {
    scripts: RefCell<VecDeque<MockScript>>,
    created: RefCell<Vec<MockHandle>>,
    fail_next: Cell<bool>,
}

/// Clonable factory; tests keep one clone and hand another to the core.
#[derive(Clone, Default)]
pub(crate) struct MockFactory {
    inner: Rc<FactoryInner>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the script for the next engine created. Engines created with
    /// no queued script use the defaults.
    pub fn push_script(&self, script: MockScript) {
        self.inner.scripts.borrow_mut().push_back(script);
    }

    pub fn fail_next_creation(&self) {
        self.inner.fail_next.set(true);
    }

    pub fn created_count(&self) -> usize {
        self.inner.created.borrow().len()
    }

    /// Shared state of the n-th engine created.
    pub fn handle(&self, index: usize) -> MockHandle {
        self.inner.created.borrow()[index].clone()
    }

    /// Engine without a config, for tests that exercise bookkeeping only.
    pub fn server_for_test(&self, fd: RawFd) -> Box<dyn TlsEngine> {
        self.create(Role::Server, fd, None)
    }

    fn create(&self, role: Role, fd: RawFd, server_name: Option<&str>) -> Box<dyn TlsEngine> {
        let script = self
            .inner
            .scripts
            .borrow_mut()
            .pop_front()
            .unwrap_or_default();
        let state = Rc::new(RefCell::new(MockEngineState {
            script,
            role: Some(role),
            server_name: server_name.map(String::from),
            fd,
            ..Default::default()
        }));
        self.inner.created.borrow_mut().push(state.clone());
        Box::new(MockEngine { state, role })
    }
}

impl EngineFactory for MockFactory {
    fn server(
        &self,
        _config: &ServerTlsConfig,
        fd: RawFd,
        _mode: PerformanceMode,
    ) -> Result<Box<dyn TlsEngine>, EngineError> {
        if self.inner.fail_next.take() {
            return Err(EngineError::internal("scripted creation failure"));
        }
        Ok(self.create(Role::Server, fd, None))
    }

    fn client(
        &self,
        _config: &ClientTlsConfig,
        fd: RawFd,
        _mode: PerformanceMode,
        server_name: Option<&str>,
    ) -> Result<Box<dyn TlsEngine>, EngineError> {
        if self.inner.fail_next.take() {
            return Err(EngineError::internal("scripted creation failure"));
        }
        Ok(self.create(Role::Client, fd, server_name))
    }
}
