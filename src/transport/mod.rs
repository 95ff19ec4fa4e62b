//! Authenticated transport connections to target hosts.
//!
//! A [`TransportClient`] wraps one live SSH connection. Many logical sessions
//! (terminal windows) can share it; only session open/close mutate its
//! reference counts. Dialing can be direct or tunneled through a gateway
//! chain, where each candidate gateway is tried in order and the target dial
//! rides a direct-tcpip channel of the first gateway that answers.
//!
//! # Main Components
//!
//! - [`TransportClient`] - One authenticated connection with ref counting
//! - [`Session`] - A logical channel (pty + shell) over a shared transport
//! - [`ServerConnection`] - Capability set expected by the excluded adapters

use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use russh::client::{Handle, Msg};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{self, AlgorithmProfile};
use crate::error::BrokerError;

mod client;
mod handler;
mod session;

pub use session::Session;
use handler::ClientHandler;

/// One target address plus the account used to authenticate against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TargetEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl TargetEndpoint {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
        }
    }

    /// Socket address form, `host:port`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Human-readable identity, `user@host:port`.
    pub fn identity(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Credential material for transport authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum AuthCredential {
    Password(String),
    PrivateKey {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl AuthCredential {
    /// SHA-256 fingerprint used for pooled-connection parameter comparison.
    /// The raw secret is never kept on the client.
    pub(crate) fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        match self {
            AuthCredential::Password(password) => {
                hasher.update(b"password:");
                hasher.update(password.as_bytes());
            }
            AuthCredential::PrivateKey { path, passphrase } => {
                hasher.update(b"key:");
                hasher.update(path.to_string_lossy().as_bytes());
                if let Some(phrase) = passphrase {
                    hasher.update(b":");
                    hasher.update(phrase.as_bytes());
                }
            }
        }
        hasher.finalize().into()
    }
}

/// Server host key verification policy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum HostVerification {
    /// Accept any host key. Broker deployments typically pin keys upstream.
    #[default]
    NoCheck,
    /// Require an exact SHA-256 fingerprint match (`SHA256:...`).
    Fingerprint(String),
}

/// Options for one dial attempt.
#[derive(Debug, Clone)]
pub struct DialOptions {
    pub timeout: Duration,
    pub verification: HostVerification,
    pub profile: AlgorithmProfile,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            timeout: config::DEFAULT_DIAL_TIMEOUT,
            verification: HostVerification::NoCheck,
            profile: AlgorithmProfile::default(),
        }
    }
}

/// One candidate intermediate host in a gateway chain.
#[derive(Debug, Clone)]
pub struct Gateway {
    pub endpoint: TargetEndpoint,
    pub auth: AuthCredential,
}

/// Terminal parameters for pty requests and Telnet negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TerminalOptions {
    pub term_type: String,
    pub cols: u32,
    pub rows: u32,
}

impl Default for TerminalOptions {
    fn default() -> Self {
        let (cols, rows) = config::DEFAULT_WINDOW_SIZE;
        Self {
            term_type: config::DEFAULT_TERM_TYPE.to_string(),
            cols,
            rows,
        }
    }
}

/// Capability set handed back by the pool and the protocol engines.
///
/// Read/write come from the `AsyncRead`/`AsyncWrite` supertraits; the rest is
/// the control surface the thin adapters (pty wrappers, SFTP, k8s bridges)
/// rely on without knowing whether the stream is SSH or Telnet underneath.
#[allow(async_fn_in_trait)]
pub trait ServerConnection: AsyncRead + AsyncWrite + Unpin + Send {
    /// Propagate a terminal resize to the remote end. A no-op when the
    /// underlying protocol never negotiated resize support.
    async fn set_win_size(&mut self, width: u32, height: u32) -> Result<(), BrokerError>;

    /// Nudge the remote so intermediate devices keep the path open.
    async fn keep_alive(&mut self) -> Result<(), BrokerError>;

    /// Close the logical stream. Idempotent.
    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// Session/self reference counters local to one transport.
///
/// External = open, un-dropped sessions. Self = holds the pool keeps so a
/// freshly stored client is not evicted before anyone uses it. Decrements
/// saturate at zero; the counts never go negative.
#[derive(Debug, Default)]
pub(crate) struct RefCounts {
    inner: Mutex<(u32, u32)>,
}

impl RefCounts {
    pub(crate) fn acquire_external(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.0 += 1;
    }

    pub(crate) fn release_external(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.0 = guard.0.saturating_sub(1);
    }

    pub(crate) fn acquire_self(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.1 += 1;
    }

    pub(crate) fn release_self(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.1 = guard.1.saturating_sub(1);
    }

    pub(crate) fn external(&self) -> u32 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).0
    }

    pub(crate) fn self_refs(&self) -> u32 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).1
    }
}

/// Underlying connection behind a [`TransportClient`].
enum Backend {
    Ssh(Handle<ClientHandler>),
    #[cfg(test)]
    Stub,
}

/// One live authenticated transport connection.
///
/// Shared by many logical sessions via [`TransportClient::open_session`];
/// selection and eviction decisions in the pool read [`ref_count`] and
/// [`self_ref_count`].
///
/// [`ref_count`]: TransportClient::ref_count
/// [`self_ref_count`]: TransportClient::self_ref_count
pub struct TransportClient {
    backend: Backend,
    endpoint: TargetEndpoint,
    identity: String,
    auth_fingerprint: [u8; 32],
    counts: Arc<RefCounts>,
    /// Parent gateway this client is tunneled through, if any. Shared:
    /// closing this client only closes the parent when it was dialed
    /// privately as part of our own dial.
    gateway: Option<Arc<TransportClient>>,
    owns_gateway: bool,
    closed: AtomicBool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_counts_never_go_negative() {
        let counts = RefCounts::default();
        counts.release_external();
        counts.release_self();
        assert_eq!(counts.external(), 0);
        assert_eq!(counts.self_refs(), 0);

        counts.acquire_external();
        counts.acquire_external();
        counts.release_external();
        assert_eq!(counts.external(), 1);
    }

    #[test]
    fn endpoint_identity_format() {
        let endpoint = TargetEndpoint::new("10.0.0.1", 22, "alice");
        assert_eq!(endpoint.identity(), "alice@10.0.0.1:22");
        assert_eq!(endpoint.addr(), "10.0.0.1:22");
    }

    #[test]
    fn credential_fingerprints_distinguish_material() {
        let a = AuthCredential::Password("secret".to_string());
        let b = AuthCredential::Password("other".to_string());
        let c = AuthCredential::PrivateKey {
            path: PathBuf::from("/tmp/id_ed25519"),
            passphrase: None,
        };
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint(), AuthCredential::Password("secret".into()).fingerprint());
    }

    #[test]
    fn terminal_options_default_matches_config() {
        let term = TerminalOptions::default();
        assert_eq!(term.term_type, crate::config::DEFAULT_TERM_TYPE);
        assert_eq!((term.cols, term.rows), crate::config::DEFAULT_WINDOW_SIZE);
    }
}
