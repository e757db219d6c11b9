//! gangway - modular, configurable SSH server framework
//!
//! Connections are accepted on one or more TCP listeners, run the SSH
//! handshake through russh, and then flow through a rule-driven pipeline:
//! config matchers pick per-connection SSH parameters, authentication flows
//! resolve an account, authorizers admit the session, and actors do the
//! actual work (shell, static response, subsystem hand-off).
//!
//! The main binary is in `main.rs`; `testing` holds the SSH test client and
//! session builders used by the integration tests.

pub mod account;
pub mod actors;
pub mod adapter;
pub mod app;
pub mod ask;
pub mod authn;
pub mod authz;
pub mod config;
pub mod config_matcher;
pub mod handler;
pub mod matcher;
pub mod server;
pub mod session;
pub mod signer;
pub mod sshconf;
pub mod subsystem;
pub mod testing;

/// Error kinds that cross module seams. Most plumbing uses `anyhow` with
/// context; these exist where callers need to branch on the kind.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Provisioning-time misconfiguration. Fatal; never reached by a
    /// running session.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No authentication provider accepted the credentials, or an
    /// allow/deny list rejected the subject.
    #[error("invalid credentials")]
    InvalidCredentials,
}
