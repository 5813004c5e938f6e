//! Error taxonomy shared by the provider and client halves.
//!
//! Each stage of the bridge has its own error type so callers can tell a
//! benign race (double close) from a broken frame or a dead relay:
//!
//! - [`FrameError`] - malformed wire framing, dropped and never guessed at
//! - [`OpenError`] - downstream dial failed, session left absent
//! - [`CloseError`] - close on a tag with no session
//! - [`ForwardError`] - downstream send failed after a session existed
//! - [`ClientError`] - everything the client façade reports, including timeouts
//! - [`TransportError`] - the local mix-client link is gone

// Rust guideline compliant 2026-02

use std::time::Duration;

use thiserror::Error;

/// Malformed wire framing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Message was empty.
    #[error("empty frame")]
    Empty,
    /// `open:` control message without a URL.
    #[error("open request without a URL")]
    MissingUrl,
    /// A field contains the reserved separator verbatim.
    #[error("{field} contains the reserved separator")]
    SeparatorInField {
        /// Name of the offending field.
        field: &'static str,
    },
    /// Frame did not contain the expected separators.
    #[error("missing frame separator")]
    MissingSeparator,
    /// Field boundaries would not survive a decode.
    #[error("ambiguous frame boundaries around {field}")]
    Ambiguous {
        /// Name of the field that touches a separator.
        field: &'static str,
    },
    /// Correlation id is not 32 lowercase hex characters.
    #[error("invalid correlation id: {0:?}")]
    InvalidCorrelationId(String),
    /// Payload is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    /// Payload is JSON but not a JSON-RPC object.
    #[error("not a JSON-RPC payload")]
    NotJsonRpc,
}

/// Downstream dial failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpenError {
    /// URL is malformed or of the wrong kind for the downstream transport.
    #[error("invalid relay URL {url}: {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
    /// Dial was attempted and failed.
    #[error("could not connect to relay {url}: {reason}")]
    DialFailed {
        /// The relay URL.
        url: String,
        /// Underlying failure.
        reason: String,
    },
    /// Another open for the same tag was abandoned before it finished.
    #[error("concurrent open was abandoned")]
    Abandoned,
}

/// Close failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloseError {
    /// No session existed for the tag.
    #[error("connection already closed")]
    AlreadyClosed,
}

/// Forwarding failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForwardError {
    /// No session and no default relay to auto-open.
    #[error("no session and no default relay configured")]
    NoSession,
    /// Auto-open failed.
    #[error(transparent)]
    Open(#[from] OpenError),
    /// Downstream rejected or dropped the payload.
    #[error("could not forward payload: {0}")]
    SendFailed(String),
}

/// The local mix-client link is closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("mix transport closed")]
pub struct TransportError;

/// Errors surfaced by the client-side connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// No correlated reply (or control acknowledgement) within the deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// `close` without an intervening `open`.
    #[error("connection already closed")]
    AlreadyClosed,
    /// `open` for a different URL while a session is up.
    #[error("already open to {0}")]
    AlreadyOpen(String),
    /// URL is not usable for this connection kind.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    /// No provider address configured.
    #[error("no service provider address configured")]
    MissingProvider,
    /// Operation requires a state the connection is not in.
    #[error("operation not allowed while {0}")]
    InvalidState(&'static str),
    /// Operation only exists for correlated (HTTP) connections.
    #[error("request/response calls need an HTTP relay URL")]
    NotCorrelated,
    /// Could not reach the local mix client.
    #[error("mix transport unavailable: {0}")]
    Transport(String),
    /// The provider reported an error.
    #[error("service provider error: {0}")]
    Remote(String),
    /// Call or open was cancelled before completion.
    #[error("cancelled: {0}")]
    Cancelled(String),
    /// Payload could not be framed.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_error_wraps_open_error() {
        let err: ForwardError = OpenError::DialFailed {
            url: "wss://relay.example/rpc".into(),
            reason: "refused".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "could not connect to relay wss://relay.example/rpc: refused"
        );
    }

    #[test]
    fn test_close_error_message_matches_relay_wording() {
        assert_eq!(
            CloseError::AlreadyClosed.to_string(),
            "connection already closed"
        );
    }

    #[test]
    fn test_transport_error_converts_to_client_error() {
        let err: ClientError = TransportError.into();
        assert!(matches!(err, ClientError::Transport(_)));
    }
}
