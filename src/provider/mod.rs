//! Relay-side service provider.
//!
//! Listens on one mix link, hands every inbound message to the
//! [`Dispatcher`], and keeps one downstream relay connection per sender tag
//! in the [`SessionRegistry`].
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────────── ServiceProvider ────────────────┐
//!  mix client ──────▶│ run loop ──▶ Dispatcher ──▶ worker(tag) ──┐     │
//!      ▲             │                                           ▼     │
//!      │             │                    SessionRegistry ◀── open/close/forward
//!      │             │                           │ pump(tag)           │
//!      └── reply ────│◀──────────────────────────┘◀──── relay (ws) ────│
//!                    │            HttpForwarder ◀──── frame ──▶ relay (http)
//!                    └─────────────────────────────────────────────────┘
//! ```

// Rust guideline compliant 2026-02

pub mod dispatcher;
pub mod downstream;
pub mod http_forward;
pub mod registry;

pub use dispatcher::Dispatcher;
pub use downstream::{Dialer, MemoryDialer, WebSocketDialer};
pub use http_forward::HttpForwarder;
pub use registry::SessionRegistry;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;

use crate::config::ProviderConfig;
use crate::mixnet::{MixConnector, MixLink, ServerResponse};

/// The relay-side bridge.
pub struct ServiceProvider {
    config: ProviderConfig,
    connector: Arc<dyn MixConnector>,
    dialer: Arc<dyn Dialer>,
    address: watch::Sender<Option<String>>,
}

impl std::fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("config", &self.config)
            .field("address", &*self.address.borrow())
            .finish_non_exhaustive()
    }
}

impl ServiceProvider {
    /// Provider linking through `connector` and dialing relays with `dialer`.
    pub fn new(
        config: ProviderConfig,
        connector: Arc<dyn MixConnector>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let (address, _) = watch::channel(None);
        Self {
            config,
            connector,
            dialer,
            address,
        }
    }

    /// Our mix address once the mix client has reported it.
    pub fn address(&self) -> watch::Receiver<Option<String>> {
        self.address.subscribe()
    }

    /// Serve until `shutdown` flips to `true` or the mix link drops, then
    /// close every session.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let MixLink { sender, mut inbound } = self
            .connector
            .connect()
            .await
            .context("Failed to connect to mix client")?;
        sender
            .request_self_address()
            .context("Mix link closed before start")?;

        let registry = SessionRegistry::new(
            Arc::clone(&self.dialer),
            sender.clone(),
            self.config.default_relay_url.clone(),
        );
        let http = HttpForwarder::new(self.config.http_timeout(), self.config.max_http_body_bytes)
            .context("Failed to build HTTP client")?;
        let (mut dispatcher, mut idle) =
            Dispatcher::new(Arc::clone(&registry), http, sender, self.config.worker_idle());

        match &self.config.default_relay_url {
            Some(url) => log::info!("[Provider] Serving, default relay {url}"),
            None => log::info!("[Provider] Serving, no default relay"),
        }

        let result = loop {
            tokio::select! {
                response = inbound.recv() => match response {
                    Some(ServerResponse::Received { message, sender_tag }) => {
                        dispatcher.dispatch(message, sender_tag);
                    }
                    Some(ServerResponse::SelfAddress { address }) => {
                        log::info!("[Provider] Mix address: {address}");
                        self.address.send_replace(Some(address));
                    }
                    Some(ServerResponse::Error { message }) => {
                        log::warn!("[Provider] Mix client error: {message}");
                    }
                    None => break Err(anyhow::anyhow!("Mix link closed")),
                },
                Some(report) = idle.recv() => dispatcher.retire(&report),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        log::info!("[Provider] Shutting down");
                        break Ok(());
                    }
                }
            }
        };

        dispatcher.shutdown();
        registry.close_all().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mixnet::MemoryMixnet;

    fn config() -> ProviderConfig {
        ProviderConfig {
            default_relay_url: None,
            ..ProviderConfig::default()
        }
    }

    #[tokio::test]
    async fn test_run_learns_address_and_stops_on_shutdown() {
        let mixnet = MemoryMixnet::new();
        let (dialer, _remotes) = MemoryDialer::new();
        let provider = Arc::new(ServiceProvider::new(
            config(),
            Arc::new(mixnet.connector("sp")),
            Arc::new(dialer),
        ));
        let mut address = provider.address();
        let (stop, shutdown) = watch::channel(false);

        let running = {
            let provider = Arc::clone(&provider);
            tokio::spawn(async move { provider.run(shutdown).await })
        };

        let learned = address.wait_for(Option::is_some).await.unwrap().clone();
        assert_eq!(learned.as_deref(), Some("sp"));

        stop.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_sessions() {
        let mixnet = MemoryMixnet::new();
        let (dialer, mut remotes) = MemoryDialer::new();
        let provider = Arc::new(ServiceProvider::new(
            config(),
            Arc::new(mixnet.connector("sp")),
            Arc::new(dialer),
        ));
        let mut address = provider.address();
        let (stop, shutdown) = watch::channel(false);
        let running = {
            let provider = Arc::clone(&provider);
            tokio::spawn(async move { provider.run(shutdown).await })
        };
        address.wait_for(Option::is_some).await.unwrap();

        let mut client = mixnet.link("client");
        client
            .sender
            .send_anonymous("open:wss://relay.example/rpc", "sp", 5)
            .unwrap();
        let opened = client.inbound.recv().await.unwrap();
        assert!(matches!(opened, ServerResponse::Received { ref message, .. } if message == "opened"));
        let mut remote = remotes.recv().await.unwrap();

        stop.send(true).unwrap();
        running.await.unwrap().unwrap();

        assert_eq!(remote.recv().await, None);
        let closed = client.inbound.recv().await.unwrap();
        assert!(matches!(closed, ServerResponse::Received { ref message, .. } if message == "closed"));
    }
}
