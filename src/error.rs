//! Error types for transport dialing, protocol handshakes, pooling, and
//! interactive privilege escalation.
//!
//! Every failure in the broker core is surfaced to the immediate caller as a
//! [`BrokerError`]; nothing is retried internally. The only swallowed case is
//! a pool release against an already-evicted group, which is handled by
//! closing the client directly and logged as an informational event.

use thiserror::Error;
use tokio::sync::mpsc::error::SendError;

/// Errors that can occur while dialing, negotiating, pooling, or escalating.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// None of the candidate gateways in the chain could be dialed.
    #[error("no available gateway in candidate chain")]
    NoAvailableGateway,

    /// A gateway was reachable, but the target dial tunneled through it failed.
    ///
    /// Distinct from [`BrokerError::NoAvailableGateway`]: the chain itself was
    /// fine, the last hop to the target was not.
    #[error("target unreachable through gateway {gateway}: {reason}")]
    GatewayTargetUnreachable { gateway: String, reason: String },

    /// Dialing the transport did not complete within the configured timeout.
    #[error("dial timeout after {0} seconds")]
    DialTimeout(u64),

    /// The remote rejected the supplied credentials during transport auth.
    #[error("authentication rejected for {user}@{host}")]
    AuthenticationRejected { user: String, host: String },

    /// The Telnet option negotiation failed or the stream closed mid-handshake.
    ///
    /// The socket is closed before this error is returned.
    #[error("protocol handshake failed: {0}")]
    HandshakeFailed(String),

    /// An explicit failure pattern matched during auto-login or switch-user.
    ///
    /// Carries the captured transcript for diagnostics.
    #[error("authentication failure: {transcript}")]
    AuthFailed { transcript: String },

    /// The switch-user dialogue exceeded its wall-clock budget.
    ///
    /// Distinguished from [`BrokerError::AuthFailed`]: no failure pattern
    /// matched, the driver simply never reached success.
    #[error("switch user timed out, transcript: {transcript}")]
    EscalateTimeout { transcript: String },

    /// An escalation policy regex failed to compile or the method name is
    /// unknown. Fatal configuration error, surfaced immediately.
    #[error("invalid escalation policy: {0}")]
    InvalidPolicy(String),

    /// The transport or channel has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// An error occurred in the russh library.
    #[error("russh error: {0}")]
    Ssh(#[from] russh::Error),

    /// An I/O error on the underlying socket or stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to send a request to the pool worker or an I/O task.
    #[error("failed to send data: {0}")]
    SendDataError(String),
}

impl<T> From<SendError<T>> for BrokerError {
    fn from(err: SendError<T>) -> Self {
        BrokerError::SendDataError(err.to_string())
    }
}
