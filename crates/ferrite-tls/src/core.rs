//! Process-wide TLS state and session lifecycle.
//!
//! One [`TlsCore`] owns everything TLS in the process: the generational
//! server configs, the client config, the certificate facts, the fd →
//! session registry, the repeated-reads machinery, and the engine factory.
//! The handle is a cheap clone over single-threaded shared state; reactor
//! callbacks capture a weak handle so sessions can never outlive the core.

use std::cell::{Ref, RefCell, RefMut};
use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::rc::{Rc, Weak};

use ferrite_events::TaskId;
use thiserror::Error;

use crate::cached::CachedList;
use crate::cert::{self, CertError, CertFacts};
use crate::config::{self, ClientTlsConfig, ConfigError, ServerTlsConfig};
use crate::engine::rustls_backend::RustlsFactory;
use crate::engine::{EngineError, EngineFactory, Role};
use crate::options::TlsOptions;
use crate::registry::{ResizeError, SessionRegistry, FD_HEADROOM};
use crate::session::Session;

#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to read {}: {source}", .path.display())]
    ReadFile {
        path: PathBuf,
        source: io::Error,
    },
    #[error("certificate inspection failed: {0}")]
    Cert(#[from] CertError),
    #[error("TLS configuration failed: {0}")]
    Config(#[from] ConfigError),
}

/// PEM material and the file names it came from, kept for rotation and
/// the stats surface.
#[derive(Default)]
pub(crate) struct Material {
    pub(crate) cert_pem: String,
    pub(crate) key_pem: String,
    pub(crate) dh_pem: String,
    pub(crate) certificate_file: PathBuf,
    pub(crate) private_key_file: PathBuf,
}

pub(crate) struct State {
    pub(crate) enabled: bool,
    pub(crate) options: TlsOptions,
    pub(crate) material: Material,
    pub(crate) server_current: Option<ServerTlsConfig>,
    pub(crate) server_previous: Option<ServerTlsConfig>,
    pub(crate) client_config: Option<ClientTlsConfig>,
    pub(crate) expected_hostname: Option<String>,
    pub(crate) cert_facts: CertFacts,
    pub(crate) registry: SessionRegistry,
    pub(crate) cached: CachedList,
    pub(crate) repeated_task: Option<TaskId>,
    pub(crate) total_repeated_reads: u64,
    pub(crate) max_repeated_read_len: usize,
    pub(crate) connections_to_current: u64,
    pub(crate) connections_to_previous: u64,
    pub(crate) factory: Box<dyn EngineFactory>,
    pub(crate) last_error: Option<EngineError>,
}

impl State {
    fn empty(options: TlsOptions, factory: Box<dyn EngineFactory>) -> Self {
        State {
            enabled: false,
            options,
            material: Material::default(),
            server_current: None,
            server_previous: None,
            client_config: None,
            expected_hostname: None,
            cert_facts: CertFacts::default(),
            registry: SessionRegistry::with_capacity(0),
            cached: CachedList::new(),
            repeated_task: None,
            total_repeated_reads: 0,
            max_repeated_read_len: 0,
            connections_to_current: 0,
            connections_to_previous: 0,
            factory,
            last_error: None,
        }
    }

    /// Create a server-role session for `fd` on the current certificate
    /// generation and attach it to the registry.
    pub(crate) fn new_server_session(&mut self, fd: RawFd) -> Result<(), EngineError> {
        let config = self
            .server_current
            .as_ref()
            .expect("tls enabled without a server config");
        let engine = self.factory.server(config, fd, self.options.performance_mode)?;
        self.registry
            .attach(Session::from_parts(fd, Role::Server, engine));
        tracing::debug!(fd, "tls session ready");
        Ok(())
    }

    /// Create a client-role session for `fd`, optionally with a peer name
    /// for SNI, and attach it to the registry.
    pub(crate) fn new_client_session(
        &mut self,
        fd: RawFd,
        server_name: Option<&str>,
    ) -> Result<(), EngineError> {
        let config = self
            .client_config
            .as_ref()
            .expect("tls enabled without a client config");
        let engine = self
            .factory
            .client(config, fd, self.options.performance_mode, server_name)?;
        self.registry
            .attach(Session::from_parts(fd, Role::Client, engine));
        tracing::debug!(fd, "tls session ready");
        Ok(())
    }
}

/// Handle to the process-wide TLS state.
#[derive(Clone)]
pub struct TlsCore {
    pub(crate) inner: Rc<RefCell<State>>,
}

/// Counters and certificate facts for the server's stats surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsStats {
    pub enabled: bool,
    pub connections_to_current_certificate: u64,
    pub connections_to_previous_certificate: u64,
    pub total_repeated_reads: u64,
    pub max_repeated_read_list_length: usize,
    pub certificate_serial: String,
    pub certificate_not_before: String,
    pub certificate_not_after: String,
    pub expected_hostname: Option<String>,
    pub performance_mode: &'static str,
}

impl TlsCore {
    /// A core with TLS off: every I/O operation passes through to the OS
    /// and no session state exists.
    pub fn disabled() -> Self {
        TlsCore {
            inner: Rc::new(RefCell::new(State::empty(
                TlsOptions::default(),
                Box::new(RustlsFactory),
            ))),
        }
    }

    /// Build the core from options, reading the PEM material the options
    /// name. Fatal errors here are configuration problems; the caller is
    /// expected to refuse to start.
    pub fn init(options: TlsOptions, maxclients: usize) -> Result<Self, InitError> {
        Self::init_with_factory(options, maxclients, Box::new(RustlsFactory))
    }

    pub fn init_with_factory(
        options: TlsOptions,
        maxclients: usize,
        factory: Box<dyn EngineFactory>,
    ) -> Result<Self, InitError> {
        if !options.enabled {
            return Ok(TlsCore {
                inner: Rc::new(RefCell::new(State::empty(options, factory))),
            });
        }

        tracing::info!("initializing TLS configuration");
        let cert_pem = read_pem(&options.certificate_file)?;
        let key_pem = read_pem(&options.private_key_file)?;
        let dh_pem = read_pem(&options.dh_params_file)?;

        // The expected hostname for peer verification comes from our own
        // certificate, so extract it before the client config captures it.
        let expected_hostname = cert::extract_cn(&cert_pem)?;
        let cert_facts = cert::extract_validity_and_serial(&cert_pem)?;

        let server_current = config::build_server(
            &cert_pem,
            &key_pem,
            &dh_pem,
            &options.cipher_prefs,
            options.performance_mode,
        )?;
        let client_config = config::build_client(
            &options.cipher_prefs,
            &cert_pem,
            &options.root_ca_certs_path,
            Some(&expected_hostname),
            options.performance_mode,
        )?;

        tracing::info!(
            %expected_hostname,
            not_after = %cert_facts.not_after,
            "TLS configuration ready"
        );

        let mut state = State::empty(options.clone(), factory);
        state.enabled = true;
        state.material = Material {
            cert_pem,
            key_pem,
            dh_pem,
            certificate_file: options.certificate_file.clone(),
            private_key_file: options.private_key_file.clone(),
        };
        state.server_current = Some(server_current);
        state.client_config = Some(client_config);
        state.expected_hostname = Some(expected_hostname);
        state.cert_facts = cert_facts;
        state.registry = SessionRegistry::with_capacity(maxclients + FD_HEADROOM);

        Ok(TlsCore {
            inner: Rc::new(RefCell::new(state)),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.state().enabled
    }

    pub fn expected_hostname(&self) -> Option<String> {
        self.state().expected_hostname.clone()
    }

    /// Match a peer-presented name against the expected hostname.
    pub fn verify_host(&self, peer_name: &str) -> bool {
        cert::verify_host(peer_name, self.state().expected_hostname.as_deref())
    }

    pub fn stats(&self) -> TlsStats {
        let state = self.state();
        TlsStats {
            enabled: state.enabled,
            connections_to_current_certificate: state.connections_to_current,
            connections_to_previous_certificate: state.connections_to_previous,
            total_repeated_reads: state.total_repeated_reads,
            max_repeated_read_list_length: state.max_repeated_read_len,
            certificate_serial: format!("{:x}", state.cert_facts.serial),
            certificate_not_before: state.cert_facts.not_before.clone(),
            certificate_not_after: state.cert_facts.not_after.clone(),
            expected_hostname: state.expected_hostname.clone(),
            performance_mode: state.options.performance_mode.as_str(),
        }
    }

    /// Certificate chain PEM currently presented to peers; the config
    /// surface reports it alongside the file names.
    pub fn certificate_pem(&self) -> Option<String> {
        let state = self.state();
        state.enabled.then(|| state.material.cert_pem.clone())
    }

    /// Private key PEM currently in use.
    pub fn private_key_pem(&self) -> Option<String> {
        let state = self.state();
        state.enabled.then(|| state.material.key_pem.clone())
    }

    /// File names the current material was loaded from.
    pub fn material_files(&self) -> Option<(PathBuf, PathBuf)> {
        let state = self.state();
        state.enabled.then(|| {
            (
                state.material.certificate_file.clone(),
                state.material.private_key_file.clone(),
            )
        })
    }

    /// Resize the fd → session map, typically after a maxclients change.
    pub fn resize_registry(&self, new_size: usize) -> Result<(), ResizeError> {
        self.state_mut().registry.resize(new_size)
    }

    /// Tear down the session for `fd`, sending a close alert when the
    /// handshake got far enough for one to be meaningful.
    pub fn cleanup_for_fd(&self, fd: RawFd) {
        self.cleanup(fd, true);
    }

    /// Tear down without the close alert. Used when the write side of the
    /// engine no longer matches the wire and an alert would inject garbage
    /// into the peer's renegotiation.
    pub fn cleanup_for_fd_without_shutdown(&self, fd: RawFd) {
        self.cleanup(fd, false);
    }

    fn cleanup(&self, fd: RawFd, send_alert: bool) {
        let mut state = self.state_mut();
        if !state.enabled {
            return;
        }
        tracing::debug!(fd, send_alert, "cleaning up tls session");
        let State {
            registry,
            cached,
            connections_to_current,
            connections_to_previous,
            ..
        } = &mut *state;

        let mut session = registry
            .detach(fd)
            .unwrap_or_else(|| panic!("no tls session attached to fd {fd}"));

        if session.client_origin {
            if session.old_generation {
                *connections_to_previous -= 1;
            } else {
                *connections_to_current -= 1;
            }
        }
        if let Some(handle) = session.cached_node.take() {
            cached.remove(handle);
        }
        if send_alert && session.engine.client_hello_seen() {
            session.engine.shutdown();
        }
        session.engine.wipe();
    }

    pub(crate) fn state(&self) -> Ref<'_, State> {
        self.inner.borrow()
    }

    pub(crate) fn state_mut(&self) -> RefMut<'_, State> {
        self.inner.borrow_mut()
    }

    pub(crate) fn downgrade(&self) -> Weak<RefCell<State>> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn from_rc(inner: Rc<RefCell<State>>) -> Self {
        TlsCore { inner }
    }
}

fn read_pem(path: &PathBuf) -> Result<String, InitError> {
    std::fs::read_to_string(path).map_err(|e| InitError::ReadFile {
        path: path.clone(),
        source: e,
    })
}
