//! Boundary to the local mix-network client.
//!
//! The mix client is a separate process that speaks a small JSON protocol,
//! tagged by `type`. The bridge only ever needs three requests (send
//! anonymously, reply to a sender tag, ask for our own address) and three
//! responses (a received message, our address, an error).
//!
//! A [`MixLink`] is one connection to a mix client: a cloneable
//! [`MixSender`] for outbound requests and a receiver of
//! [`ServerResponse`]s. [`MixConnector`] produces links; the real one talks
//! WebSocket ([`WebSocketConnector`]), the in-process one
//! ([`MemoryMixnet`]) routes between links in the same process.

// Rust guideline compliant 2026-02

pub mod memory;
pub mod websocket;

pub use memory::MemoryMixnet;
pub use websocket::WebSocketConnector;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Anonymous reply handle assigned by the mix network to one sender.
///
/// Opaque to the bridge. `Display` shows only a prefix so logs never carry
/// the full handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SenderTag(String);

impl SenderTag {
    /// Wrap a raw tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Raw tag as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SenderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(8).collect();
        if prefix.len() < self.0.len() {
            write!(f, "{prefix}...")
        } else {
            f.write_str(&prefix)
        }
    }
}

/// Request to the local mix client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientRequest {
    /// Send to `recipient`, attaching `reply_surbs` anonymous return paths.
    #[serde(rename_all = "camelCase")]
    SendAnonymous {
        /// Message text.
        message: String,
        /// Recipient mix address.
        recipient: String,
        /// Number of single-use reply blocks to attach.
        reply_surbs: u32,
    },
    /// Reply to whoever sent with `sender_tag`.
    #[serde(rename_all = "camelCase")]
    Reply {
        /// Message text.
        message: String,
        /// Tag of the original sender.
        sender_tag: SenderTag,
    },
    /// Ask for our own mix address.
    SelfAddress,
}

/// Response from the local mix client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerResponse {
    /// A message arrived.
    #[serde(rename_all = "camelCase")]
    Received {
        /// Message text.
        message: String,
        /// Present when the sender attached reply blocks.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_tag: Option<SenderTag>,
    },
    /// Answer to [`ClientRequest::SelfAddress`].
    SelfAddress {
        /// Our mix address.
        address: String,
    },
    /// The mix client rejected a request.
    Error {
        /// Description from the mix client.
        message: String,
    },
}

/// Cloneable, non-blocking handle for outbound mix requests.
#[derive(Debug, Clone)]
pub struct MixSender {
    tx: mpsc::UnboundedSender<ClientRequest>,
}

impl MixSender {
    /// Create a sender and the receiver a link driver drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ClientRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Send `message` to `recipient` with `reply_surbs` reply blocks.
    pub fn send_anonymous(
        &self,
        message: impl Into<String>,
        recipient: impl Into<String>,
        reply_surbs: u32,
    ) -> Result<(), TransportError> {
        self.send(ClientRequest::SendAnonymous {
            message: message.into(),
            recipient: recipient.into(),
            reply_surbs,
        })
    }

    /// Reply to the sender behind `sender_tag`.
    pub fn reply(
        &self,
        message: impl Into<String>,
        sender_tag: &SenderTag,
    ) -> Result<(), TransportError> {
        self.send(ClientRequest::Reply {
            message: message.into(),
            sender_tag: sender_tag.clone(),
        })
    }

    /// Ask the mix client for our address; the answer arrives inbound.
    pub fn request_self_address(&self) -> Result<(), TransportError> {
        self.send(ClientRequest::SelfAddress)
    }

    /// Whether the link driver has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, request: ClientRequest) -> Result<(), TransportError> {
        self.tx.send(request).map_err(|_closed| TransportError)
    }
}

/// One connection to a mix client.
#[derive(Debug)]
pub struct MixLink {
    /// Outbound requests.
    pub sender: MixSender,
    /// Inbound responses; ends when the link drops.
    pub inbound: mpsc::UnboundedReceiver<ServerResponse>,
}

/// Produces links to a mix client.
#[async_trait]
pub trait MixConnector: Send + Sync {
    /// Establish a new link.
    async fn connect(&self) -> anyhow::Result<MixLink>;
}
