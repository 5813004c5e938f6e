//! Wire protocol spoken inside mix messages.
//!
//! - [`codec`] - control verbs, HTTP framing, reply classification
//! - [`jsonrpc`] - JSON-RPC payload detection and error envelopes
//! - [`TransportKind`] - which downstream transport a relay URL selects

pub mod codec;
pub mod jsonrpc;

pub use codec::{CorrelationId, HttpFrame, Reply, Request, SEPARATOR};
pub use jsonrpc::ErrorResponse;

use reqwest::Url;

/// Downstream transport selected by a relay URL's scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// `ws://` or `wss://`: one long-lived duplex session per tag.
    WebSocket,
    /// `http://` or `https://`: one-shot correlated POSTs.
    Http,
}

impl TransportKind {
    /// Classify `url`, requiring a host and a supported scheme.
    pub fn from_url(url: &str) -> Result<Self, String> {
        let parsed = Url::parse(url).map_err(|e| e.to_string())?;
        if parsed.host_str().is_none_or(str::is_empty) {
            return Err("missing host".to_string());
        }
        match parsed.scheme() {
            "ws" | "wss" => Ok(Self::WebSocket),
            "http" | "https" => Ok(Self::Http),
            other => Err(format!("unsupported scheme {other:?}")),
        }
    }
}

/// Whether `url` is a well-formed WebSocket URL.
pub fn is_ws_url(url: &str) -> bool {
    TransportKind::from_url(url) == Ok(TransportKind::WebSocket)
}

/// Whether `url` is a well-formed HTTP URL.
pub fn is_http_url(url: &str) -> bool {
    TransportKind::from_url(url) == Ok(TransportKind::Http)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_from_url() {
        assert_eq!(
            TransportKind::from_url("wss://relay.example/rpc"),
            Ok(TransportKind::WebSocket)
        );
        assert_eq!(
            TransportKind::from_url("http://127.0.0.1:8545"),
            Ok(TransportKind::Http)
        );
        assert!(TransportKind::from_url("ftp://relay.example").is_err());
        assert!(TransportKind::from_url("not a url").is_err());
    }

    #[test]
    fn test_url_helpers() {
        assert!(is_ws_url("ws://localhost:1978"));
        assert!(!is_ws_url("https://relay.example"));
        assert!(is_http_url("https://relay.example"));
        assert!(!is_http_url("wss://relay.example"));
    }
}
