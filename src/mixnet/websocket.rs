//! WebSocket link to a local mix client.
//!
//! One driver task per link owns both socket halves: outbound
//! [`ClientRequest`]s are serialized to text frames, inbound text frames
//! are parsed into [`ServerResponse`]s. The link ends when either the
//! socket closes or every [`MixSender`] clone is dropped.

// Rust guideline compliant 2026-02

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ClientRequest, MixConnector, MixLink, MixSender, ServerResponse};
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// Connects to a mix client listening on a WebSocket URL.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    /// Connector for the mix client at `url` (e.g. `ws://127.0.0.1:1977`).
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Mix client URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl MixConnector for WebSocketConnector {
    async fn connect(&self) -> Result<MixLink> {
        let (writer, reader) = ws::connect(&self.url).await?;
        log::info!("[MixLink] Connected to mix client at {}", self.url);

        let (sender, outbound) = MixSender::channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        tokio::spawn(drive_link(writer, reader, outbound, inbound_tx));

        Ok(MixLink { sender, inbound })
    }
}

async fn drive_link(
    mut writer: WsWriter,
    mut reader: WsReader,
    mut outbound: mpsc::UnboundedReceiver<ClientRequest>,
    inbound: mpsc::UnboundedSender<ServerResponse>,
) {
    loop {
        tokio::select! {
            request = outbound.recv() => {
                let Some(request) = request else {
                    log::debug!("[MixLink] All senders dropped, closing link");
                    let _ = writer.close().await;
                    break;
                };
                let text = match serde_json::to_string(&request) {
                    Ok(text) => text,
                    Err(e) => {
                        log::warn!("[MixLink] Failed to serialize request: {e}");
                        continue;
                    }
                };
                if let Err(e) = writer.send_text(&text).await {
                    log::warn!("[MixLink] Send failed: {e:#}");
                    break;
                }
            }
            message = reader.recv() => {
                match message {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ServerResponse>(&text) {
                            Ok(response) => {
                                if inbound.send(response).is_err() {
                                    log::debug!("[MixLink] Inbound receiver dropped");
                                    break;
                                }
                            }
                            Err(e) => {
                                log::warn!("[MixLink] Unrecognised mix client message: {e}");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        log::debug!("[MixLink] Ignoring {} byte binary frame", data.len());
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if let Err(e) = writer.send_pong(data).await {
                            log::warn!("[MixLink] Pong failed: {e:#}");
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        log::info!("[MixLink] Mix client closed link: {code} {reason}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::warn!("[MixLink] {e:#}");
                        break;
                    }
                    None => {
                        log::info!("[MixLink] Mix client stream ended");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_to_missing_mix_client_fails() {
        let connector = WebSocketConnector::new("ws://127.0.0.1:1");
        assert!(connector.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_link_speaks_mix_client_json() {
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::Message;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
            let request = socket.next().await.unwrap().unwrap();
            let Message::Text(text) = request else {
                panic!("expected text frame");
            };
            assert_eq!(text, r#"{"type":"selfAddress"}"#);
            socket
                .send(Message::Text(
                    r#"{"type":"selfAddress","address":"me.gw"}"#.to_string(),
                ))
                .await
                .unwrap();
        });

        let connector = WebSocketConnector::new(format!("ws://{addr}"));
        let mut link = connector.connect().await.unwrap();
        link.sender.request_self_address().unwrap();

        let response = link.inbound.recv().await.unwrap();
        assert_eq!(
            response,
            ServerResponse::SelfAddress {
                address: "me.gw".into()
            }
        );
        server.await.unwrap();
    }
}
