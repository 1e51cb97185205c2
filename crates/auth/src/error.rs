//! Error types for authentication

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("transport failure: {0}")]
    Wire(#[from] wire::WireError),

    #[error("event queue failure: {0}")]
    Reactor(#[from] reactor::ReactorError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication step timed out")]
    TimedOut,

    #[error("authentication failed")]
    Authentication,

    #[error("credential expired")]
    Expired,

    #[error("authentication method not supported by peer")]
    ProtocolNotSupported,

    #[error("permission denied")]
    PermissionDenied,

    #[error("connection should be retried")]
    RetryConnection,

    #[error("peer certificate does not match the expected identity")]
    HostnameMismatch,

    #[error("shared key unavailable: {0}")]
    Credential(String),

    #[error("every authentication method is disabled for this peer")]
    MethodDisabled,

    #[error("no authentication method is usable for this peer")]
    NoMethodAvailable,
}

impl AuthError {
    /// Whether the negotiation engine moves on to the next candidate method
    /// after this failure. Anything outside this set aborts the negotiation.
    pub fn negotiation_retryable(&self) -> bool {
        matches!(
            self,
            AuthError::ProtocolNotSupported
                | AuthError::Expired
                | AuthError::PermissionDenied
                | AuthError::Authentication
        )
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
