//! Live certificate rotation.
//!
//! A renewal builds a fresh server config, then shifts generations: the
//! config that was current becomes previous and stays alive for the
//! connections that handshook under it, and at most two configs ever
//! exist. When a renewal arrives while a previous generation is still
//! populated, the clients still on it are force-disconnected first; the
//! expiring-but-current generation's clients are merely tagged and keep
//! their connections.
//!
//! Nothing about the peer-verification identity changes here: the
//! expected hostname stays whatever the certificate at startup declared.

use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::SystemTime;

use thiserror::Error;

use crate::cert::{self, CertError};
use crate::config::{self, ConfigError};
use crate::core::{State, TlsCore};

/// One connected client as the rotation sees it.
#[derive(Debug, Clone, Copy)]
pub struct RosterEntry {
    pub fd: RawFd,
    /// When the connection was established; compared against config
    /// creation times to decide which generation it belongs to.
    pub created_at: SystemTime,
}

/// The server's view of its connected clients. `clients` must not call
/// back into the TLS core; `disconnect` is expected to (it tears the
/// session down through the usual cleanup entry points).
pub trait ClientRoster {
    fn clients(&self) -> Vec<RosterEntry>;
    fn disconnect(&mut self, fd: RawFd);
}

#[derive(Debug, Error)]
pub enum RenewError {
    #[error("tls is disabled")]
    Disabled,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("new certificate rejected: {0}")]
    Cert(#[from] CertError),
}

impl TlsCore {
    /// Swap in a renewed certificate/key pair without restarting. On any
    /// error the existing state is untouched.
    pub fn renew_certificate(
        &self,
        cert_pem: String,
        key_pem: String,
        certificate_file: PathBuf,
        private_key_file: PathBuf,
        roster: &mut dyn ClientRoster,
    ) -> Result<(), RenewError> {
        tracing::info!("building tls configuration for renewed certificate");

        let (dh_pem, cipher_prefs, mode, cutoff, has_previous) = {
            let state = self.state();
            if !state.enabled {
                return Err(RenewError::Disabled);
            }
            let current = state
                .server_current
                .as_ref()
                .expect("tls enabled without a server config");
            (
                state.material.dh_pem.clone(),
                state.options.cipher_prefs.clone(),
                state.options.performance_mode,
                current.created_at(),
                state.server_previous.is_some(),
            )
        };

        // Validate everything about the new material before touching any
        // state.
        let new_config = config::build_server(&cert_pem, &key_pem, &dh_pem, &cipher_prefs, mode)?;
        let facts = cert::extract_validity_and_serial(&cert_pem)?;

        // Two generations may be live at once, never three. If a previous
        // generation still exists, every client that predates the current
        // config is still on it and has to go.
        if has_previous {
            let doomed: Vec<RawFd> = roster
                .clients()
                .into_iter()
                .filter(|client| client.created_at <= cutoff)
                .map(|client| client.fd)
                .collect();
            // Disconnects call back into session cleanup, so no borrow is
            // held across them.
            let disconnected = doomed.len();
            for fd in doomed {
                roster.disconnect(fd);
            }
            if disconnected > 0 {
                tracing::warn!(
                    disconnected,
                    "disconnected clients still on the oldest certificate"
                );
            }
        }

        let mut state = self.state_mut();
        {
            let State { registry, .. } = &mut *state;
            // Survivors belong to the generation that is about to become
            // previous.
            for session in registry.iter_mut() {
                if session.client_origin {
                    session.old_generation = true;
                }
            }
        }
        state.server_previous = state.server_current.take();
        state.server_current = Some(new_config);
        state.material.cert_pem = cert_pem;
        state.material.key_pem = key_pem;
        state.material.certificate_file = certificate_file;
        state.material.private_key_file = private_key_file;
        state.cert_facts = facts;
        state.connections_to_previous = state.connections_to_current;
        state.connections_to_current = 0;

        let serial = format!("{:x}", state.cert_facts.serial);
        tracing::info!(
            %serial,
            not_after = %state.cert_facts.not_after,
            "tls certificate renewed"
        );
        Ok(())
    }
}
