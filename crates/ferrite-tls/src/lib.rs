//! ferrite-tls — TLS for the ferrite event loop.
//!
//! Layers TLS onto the server's already-established non-blocking sockets
//! (client commands, cluster bus, replication) without changing the byte
//! stream semantics the rest of the server expects. The crate owns the
//! per-connection sessions and their fd mapping, drives handshakes across
//! reactor readiness events, schedules synthetic reads when the engine
//! holds buffered records, rotates the server certificate live, and
//! re-establishes sessions after a forked child has written through an
//! inherited engine (the post-RDB handoff).
//!
//! The event loop itself and the state machines that consume plaintext are
//! external; they reach this crate through [`TlsCore`] and the callback
//! records in [`handshake`] and [`handoff`].

pub mod cached;
pub mod cert;
pub mod config;
pub mod core;
pub mod engine;
pub mod handoff;
pub mod handshake;
pub mod options;
pub mod registry;
pub mod repeated;
pub mod rotate;
pub mod session;
pub mod shim;

pub use crate::core::{InitError, TlsCore, TlsStats};
pub use crate::handshake::{HandshakeSite, Negotiation, SetupError};
pub use crate::options::{PerformanceMode, TlsOptions};
pub use crate::rotate::{ClientRoster, RosterEntry};
