use thiserror::Error;

use crate::types::EventId;

/// Errors surfaced by the client core.
///
/// Transport, protocol and business failures are reported once to the
/// caller of the triggering operation. `NotFound` is only produced while
/// applying notifications and never reaches a caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Connectivity failure, timeout or an HTTP status without a decodable body.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The payload could not be decoded into the expected shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered with a `nok` envelope.
    #[error("Request rejected ({error_code}): {reason}")]
    Business { error_code: String, reason: String },

    /// Local voting gate: the event's voting window is not open.
    #[error("Voting is closed for event {0}")]
    VotingClosed(EventId),

    /// A referenced event, location or vote ledger is absent from the snapshot.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The session was closed before or while the operation ran.
    #[error("Client session is closed")]
    SessionClosed,

    /// The request could not be built (bad URL, unserializable body).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ClientError {
    /// Machine readable error code, `{errorCode}` in the caller contract.
    pub fn error_code(&self) -> &str {
        match self {
            ClientError::Transport(_) => "transport",
            ClientError::Protocol(_) => "protocol",
            ClientError::Business { error_code, .. } => error_code,
            ClientError::VotingClosed(_) => "voting_closed",
            ClientError::NotFound(_) => "not_found",
            ClientError::SessionClosed => "session_closed",
            ClientError::InvalidRequest(_) => "invalid_request",
        }
    }

    /// Human readable reason, `{reason}` in the caller contract.
    pub fn reason(&self) -> String {
        match self {
            ClientError::Business { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ClientError>;
