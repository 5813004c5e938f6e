//! In-process mix network.
//!
//! Routes [`ClientRequest`]s between links registered under plain string
//! addresses, the way a mix network would, minus the mixing: each link is
//! assigned one random sender tag, anonymous sends arrive at the recipient
//! carrying that tag, and replies addressed to the tag come back to the
//! originating link without one.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use data_encoding::HEXLOWER;
use tokio::sync::mpsc;

use super::{ClientRequest, MixConnector, MixLink, MixSender, SenderTag, ServerResponse};

#[derive(Debug, Default)]
struct Routes {
    endpoints: HashMap<String, mpsc::UnboundedSender<ServerResponse>>,
    tags: HashMap<SenderTag, String>,
}

/// In-process mix network shared by every link created from it.
#[derive(Debug, Clone, Default)]
pub struct MemoryMixnet {
    routes: Arc<Mutex<Routes>>,
}

impl MemoryMixnet {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a link under `address`, replacing any previous link there.
    ///
    /// Must be called from inside a Tokio runtime; routing runs on a
    /// spawned task that ends when every sender clone is dropped.
    pub fn link(&self, address: &str) -> MixLink {
        let (sender, outbound) = MixSender::channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        let tag = SenderTag::new(HEXLOWER.encode(&rand::random::<[u8; 16]>()));
        {
            let mut routes = self.lock();
            routes.endpoints.insert(address.to_string(), inbound_tx.clone());
            routes.tags.insert(tag.clone(), address.to_string());
        }
        log::debug!("[MemoryMixnet] Linked {address} as {tag}");

        tokio::spawn(route(
            self.clone(),
            address.to_string(),
            tag,
            outbound,
            inbound_tx,
        ));

        MixLink { sender, inbound }
    }

    /// Connector that links under `address` on every `connect`.
    pub fn connector(&self, address: &str) -> MemoryConnector {
        MemoryConnector {
            mixnet: self.clone(),
            address: address.to_string(),
        }
    }

    /// Whether a live link is registered under `address`.
    pub fn is_linked(&self, address: &str) -> bool {
        self.lock()
            .endpoints
            .get(address)
            .is_some_and(|tx| !tx.is_closed())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Routes> {
        // Routing state stays consistent even if a holder panicked.
        self.routes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn endpoint(&self, address: &str) -> Option<mpsc::UnboundedSender<ServerResponse>> {
        self.lock().endpoints.get(address).cloned()
    }

    fn address_for(&self, tag: &SenderTag) -> Option<String> {
        self.lock().tags.get(tag).cloned()
    }

    fn unlink(&self, address: &str, tag: &SenderTag, own: &mpsc::UnboundedSender<ServerResponse>) {
        let mut routes = self.lock();
        if routes
            .endpoints
            .get(address)
            .is_some_and(|tx| tx.same_channel(own))
        {
            routes.endpoints.remove(address);
        }
        routes.tags.remove(tag);
    }
}

async fn route(
    mixnet: MemoryMixnet,
    address: String,
    tag: SenderTag,
    mut outbound: mpsc::UnboundedReceiver<ClientRequest>,
    own: mpsc::UnboundedSender<ServerResponse>,
) {
    while let Some(request) = outbound.recv().await {
        match request {
            ClientRequest::SendAnonymous {
                message,
                recipient,
                reply_surbs,
            } => {
                let Some(endpoint) = mixnet.endpoint(&recipient) else {
                    let _ = own.send(ServerResponse::Error {
                        message: format!("unknown recipient {recipient}"),
                    });
                    continue;
                };
                let sender_tag = (reply_surbs > 0).then(|| tag.clone());
                if endpoint
                    .send(ServerResponse::Received {
                        message,
                        sender_tag,
                    })
                    .is_err()
                {
                    log::debug!("[MemoryMixnet] Recipient {recipient} went away");
                }
            }
            ClientRequest::Reply {
                message,
                sender_tag,
            } => {
                let endpoint = mixnet
                    .address_for(&sender_tag)
                    .and_then(|addr| mixnet.endpoint(&addr));
                match endpoint {
                    Some(endpoint) => {
                        let _ = endpoint.send(ServerResponse::Received {
                            message,
                            sender_tag: None,
                        });
                    }
                    None => {
                        log::debug!("[MemoryMixnet] No link for tag {sender_tag}");
                        let _ = own.send(ServerResponse::Error {
                            message: format!("no reply path for {sender_tag}"),
                        });
                    }
                }
            }
            ClientRequest::SelfAddress => {
                let _ = own.send(ServerResponse::SelfAddress {
                    address: address.clone(),
                });
            }
        }
    }

    mixnet.unlink(&address, &tag, &own);
    log::debug!("[MemoryMixnet] Unlinked {address}");
}

/// [`MixConnector`] backed by a [`MemoryMixnet`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    mixnet: MemoryMixnet,
    address: String,
}

#[async_trait]
impl MixConnector for MemoryConnector {
    async fn connect(&self) -> Result<MixLink> {
        Ok(self.mixnet.link(&self.address))
    }
}
