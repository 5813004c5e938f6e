//! Downstream relay connections.
//!
//! A session's relay connection is driven by its own task; the registry
//! only holds a [`DownstreamHandle`] and talks to the task through
//! commands, each acknowledged on a oneshot. Everything the relay sends
//! back arrives as [`DownstreamEvent`]s on the [`DownstreamLink`].
//!
//! ```text
//! SessionRegistry ──Send/Close──▶ driver task ──▶ relay socket
//!        ▲                            │
//!        └──────── DownstreamEvent ◀──┘
//! ```

// Rust guideline compliant 2026-02

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// Commands accepted by a downstream driver task.
#[derive(Debug)]
pub enum DownstreamCommand {
    /// Send a text frame.
    Send {
        /// Frame contents.
        text: String,
        /// Result of the write.
        ack: oneshot::Sender<Result<()>>,
    },
    /// Close the connection and stop the driver.
    Close {
        /// Signalled once the close frame is out.
        ack: oneshot::Sender<Result<()>>,
    },
}

/// Something the relay did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownstreamEvent {
    /// A text message from the relay.
    Message(String),
    /// The relay closed the connection.
    Closed {
        /// Close code (1006 when the stream just ended).
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// The connection failed.
    Error(String),
}

/// Send-safe handle to a downstream connection.
#[derive(Debug, Clone)]
pub struct DownstreamHandle {
    url: String,
    commands: mpsc::Sender<DownstreamCommand>,
}

impl DownstreamHandle {
    /// Handle over a driver's command queue.
    pub fn new(url: impl Into<String>, commands: mpsc::Sender<DownstreamCommand>) -> Self {
        Self {
            url: url.into(),
            commands,
        }
    }

    /// Relay URL this connection was dialed to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send `text` and wait for the write to complete.
    pub async fn send(&self, text: String) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(DownstreamCommand::Send { text, ack })
            .await
            .map_err(|_closed| anyhow!("downstream connection to {} is gone", self.url))?;
        done.await
            .map_err(|_dropped| anyhow!("downstream driver for {} stopped", self.url))?
    }

    /// Close the connection.
    pub async fn close(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        if self
            .commands
            .send(DownstreamCommand::Close { ack })
            .await
            .is_err()
        {
            // Driver already gone; nothing left to close.
            return Ok(());
        }
        done.await.unwrap_or(Ok(()))
    }

    /// Whether the driver task has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// A freshly dialed connection.
#[derive(Debug)]
pub struct DownstreamLink {
    /// Command handle.
    pub handle: DownstreamHandle,
    /// Relay events; ends when the driver stops.
    pub events: mpsc::UnboundedReceiver<DownstreamEvent>,
}

/// Dials downstream relay connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `url`.
    async fn dial(&self, url: &str) -> Result<DownstreamLink>;
}

/// Command queue depth per connection.
const COMMAND_QUEUE: usize = 64;

/// Dials relays over WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketDialer {
    connect_timeout: Duration,
}

impl WebSocketDialer {
    /// Dialer giving up on a handshake after `connect_timeout`.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self, url: &str) -> Result<DownstreamLink> {
        let (writer, reader) = tokio::time::timeout(self.connect_timeout, ws::connect(url))
            .await
            .with_context(|| format!("WebSocket connect to {url} timed out"))??;
        log::info!("[Downstream] Connected to {url}");

        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (events_tx, events) = mpsc::unbounded_channel();
        tokio::spawn(drive_websocket(
            url.to_string(),
            writer,
            reader,
            commands,
            events_tx,
        ));

        Ok(DownstreamLink {
            handle: DownstreamHandle::new(url, commands_tx),
            events,
        })
    }
}

async fn drive_websocket(
    url: String,
    mut writer: WsWriter,
    mut reader: WsReader,
    mut commands: mpsc::Receiver<DownstreamCommand>,
    events: mpsc::UnboundedSender<DownstreamEvent>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(DownstreamCommand::Send { text, ack }) => {
                    let result = writer.send_text(&text).await;
                    let failed = result.as_ref().err().map(|e| format!("{e:#}"));
                    let _ = ack.send(result);
                    if let Some(reason) = failed {
                        let _ = events.send(DownstreamEvent::Error(reason));
                        break;
                    }
                }
                Some(DownstreamCommand::Close { ack }) => {
                    let _ = ack.send(writer.close().await);
                    log::debug!("[Downstream] Closed {url} locally");
                    break;
                }
                None => {
                    let _ = writer.close().await;
                    break;
                }
            },
            message = reader.recv() => match message {
                Some(Ok(WsMessage::Text(text))) => {
                    if events.send(DownstreamEvent::Message(text)).is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    log::debug!("[Downstream] Ignoring {} byte binary frame from {url}", data.len());
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    if let Err(e) = writer.send_pong(data).await {
                        let _ = events.send(DownstreamEvent::Error(format!("{e:#}")));
                        break;
                    }
                }
                Some(Ok(WsMessage::Close { code, reason })) => {
                    let _ = events.send(DownstreamEvent::Closed { code, reason });
                    break;
                }
                Some(Err(e)) => {
                    let _ = events.send(DownstreamEvent::Error(format!("{e:#}")));
                    break;
                }
                None => {
                    let _ = events.send(DownstreamEvent::Closed {
                        code: 1006,
                        reason: String::new(),
                    });
                    break;
                }
            },
        }
    }
}

/// Relay end of an in-memory downstream connection.
#[derive(Debug)]
pub struct MemoryRemote {
    /// URL the bridge dialed.
    pub url: String,
    received: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<DownstreamEvent>,
}

impl MemoryRemote {
    /// Next text the bridge sent, or `None` once it closed the connection.
    pub async fn recv(&mut self) -> Option<String> {
        self.received.recv().await
    }

    /// Push a message to the bridge.
    pub fn push(&self, text: impl Into<String>) -> bool {
        self.events.send(DownstreamEvent::Message(text.into())).is_ok()
    }

    /// Stop taking messages; later sends from the bridge fail while the
    /// connection itself stays up.
    pub fn stop_reading(&mut self) {
        self.received.close();
    }

    /// Close from the relay side.
    pub fn close(self, code: u16, reason: &str) {
        let _ = self.events.send(DownstreamEvent::Closed {
            code,
            reason: reason.to_string(),
        });
    }

    /// Fail the connection from the relay side.
    pub fn fail(self, reason: &str) {
        let _ = self.events.send(DownstreamEvent::Error(reason.to_string()));
    }
}

#[derive(Debug, Default)]
struct MemoryDialerState {
    dials: Vec<String>,
    refused: HashSet<String>,
    delay: Option<Duration>,
}

/// In-process relay for tests and local runs.
///
/// Every successful dial hands a [`MemoryRemote`] to whoever holds the
/// receiver returned by [`MemoryDialer::new`].
#[derive(Debug, Clone)]
pub struct MemoryDialer {
    state: Arc<Mutex<MemoryDialerState>>,
    accepted: mpsc::UnboundedSender<MemoryRemote>,
}

impl MemoryDialer {
    /// Dialer plus the stream of accepted relay ends.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryRemote>) {
        let (accepted, remotes) = mpsc::unbounded_channel();
        let dialer = Self {
            state: Arc::new(Mutex::new(MemoryDialerState::default())),
            accepted,
        };
        (dialer, remotes)
    }

    /// Refuse future dials to `url`.
    pub fn refuse(&self, url: &str) {
        self.state().refused.insert(url.to_string());
    }

    /// Stop refusing dials to `url`.
    pub fn allow(&self, url: &str) {
        self.state().refused.remove(url);
    }

    /// Make each dial take `delay` before completing.
    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = Some(delay);
    }

    /// Every URL dialed so far, refused ones included.
    pub fn dials(&self) -> Vec<String> {
        self.state().dials.clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryDialerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, url: &str) -> Result<DownstreamLink> {
        let (refused, delay) = {
            let mut state = self.state();
            state.dials.push(url.to_string());
            (state.refused.contains(url), state.delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if refused {
            return Err(anyhow!("connection refused"));
        }

        let (commands_tx, mut commands) = mpsc::channel(COMMAND_QUEUE);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (received_tx, received) = mpsc::unbounded_channel();

        self.accepted
            .send(MemoryRemote {
                url: url.to_string(),
                received,
                events: events_tx,
            })
            .map_err(|_closed| anyhow!("connection refused"))?;

        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                match command {
                    DownstreamCommand::Send { text, ack } => {
                        let result = received_tx
                            .send(text)
                            .map_err(|_closed| anyhow!("relay hung up"));
                        let _ = ack.send(result);
                    }
                    DownstreamCommand::Close { ack } => {
                        let _ = ack.send(Ok(()));
                        break;
                    }
                }
            }
        });

        Ok(DownstreamLink {
            handle: DownstreamHandle::new(url, commands_tx),
            events,
        })
    }
}
