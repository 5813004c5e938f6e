//! Client-side connection façade.
//!
//! [`MixConnection`] looks like an ordinary JSON-RPC connection (open,
//! send, close, subscribe to events) but every byte goes through the mix
//! network to a service provider, which holds the real relay connection.
//!
//! The relay URL decides the mode:
//!
//! - `ws://` / `wss://`: the provider keeps one relay session for us. Open
//!   and close are acknowledged with `opened` / `closed`; relay data arrives
//!   uncorrelated, in order, as [`ConnectionEvent::Payload`].
//! - `http://` / `https://`: every payload is a one-shot call. Each is
//!   framed with a fresh correlation id and its reply is routed back to the
//!   waiting caller by the [`Correlator`].
//!
//! State machine:
//!
//! ```text
//! Disconnected ──open──▶ Connecting ──opened──▶ Open ──close──▶ Closing ──closed──▶ Disconnected
//!      ▲                     │                   │
//!      └──── failed ─────────┘                   └── relay or mix link gone ──▶ Disconnected
//! ```
//!
//! Events go out on a broadcast channel. A subscriber that falls more than
//! [`EVENT_CAPACITY`] events behind sees `Lagged` and misses the overflow.

// Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::correlator::Correlator;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::mixnet::{MixConnector, MixLink, MixSender, ServerResponse};
use crate::protocol::codec::{HttpFrame, Reply, Request};
use crate::protocol::jsonrpc::{self, ErrorResponse};
use crate::protocol::TransportKind;

/// Events buffered per subscriber.
pub const EVENT_CAPACITY: usize = 256;

/// Something that happened on the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The connection is open.
    Open,
    /// The connection closed.
    Close,
    /// A session-level error from the provider or the mix link.
    Error(String),
    /// Data from the relay (or an error envelope for a failed send).
    Payload(Value),
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session.
    Disconnected,
    /// Waiting for the provider to confirm.
    Connecting,
    /// Ready for traffic.
    Open,
    /// Waiting for the provider to confirm a close.
    Closing,
}

impl ConnectionState {
    fn name(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
        }
    }
}

type OpenOutcome = Option<Result<(), ClientError>>;

#[derive(Debug)]
struct LinkState {
    sender: MixSender,
    task: JoinHandle<()>,
    epoch: u64,
}

#[derive(Debug)]
struct Shared {
    state: ConnectionState,
    url: String,
    kind: TransportKind,
    link: Option<LinkState>,
    epoch: u64,
    opening: Option<watch::Receiver<OpenOutcome>>,
    opened_ack: Option<oneshot::Sender<Result<(), ClientError>>>,
    closed_ack: Option<oneshot::Sender<()>>,
    self_address: Option<String>,
    reaper: Option<JoinHandle<()>>,
}

struct Inner {
    config: ClientConfig,
    provider: String,
    connector: Arc<dyn MixConnector>,
    correlator: Correlator,
    events: broadcast::Sender<ConnectionEvent>,
    shared: Mutex<Shared>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let shared = self.shared.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(link) = shared.link.take() {
            link.task.abort();
        }
        if let Some(reaper) = shared.reaper.take() {
            reaper.abort();
        }
    }
}

/// JSON-RPC connection tunnelled through the mix network.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct MixConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MixConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.inner.lock();
        f.debug_struct("MixConnection")
            .field("url", &shared.url)
            .field("state", &shared.state)
            .field("pending_calls", &self.inner.correlator.len())
            .finish_non_exhaustive()
    }
}

enum OpenStep {
    Ready,
    Wait(watch::Receiver<OpenOutcome>),
    Lead(watch::Sender<OpenOutcome>, u64),
}

impl MixConnection {
    /// Connection to relay `url` through the provider named in `config`.
    pub fn new(
        url: &str,
        config: ClientConfig,
        connector: Arc<dyn MixConnector>,
    ) -> Result<Self, ClientError> {
        let provider = config
            .provider_address
            .clone()
            .ok_or(ClientError::MissingProvider)?;
        let kind = TransportKind::from_url(url).map_err(ClientError::InvalidUrl)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                correlator: Correlator::new(config.call_timeout()),
                config,
                provider,
                connector,
                events,
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    url: url.to_string(),
                    kind,
                    link: None,
                    epoch: 0,
                    opening: None,
                    opened_ack: None,
                    closed_ack: None,
                    self_address: None,
                    reaper: None,
                }),
            }),
        })
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Relay URL.
    pub fn url(&self) -> String {
        self.inner.lock().url.clone()
    }

    /// Transport mode derived from the URL.
    pub fn kind(&self) -> TransportKind {
        self.inner.lock().kind
    }

    /// Our mix address, once the mix client has reported it.
    pub fn self_address(&self) -> Option<String> {
        self.inner.lock().self_address.clone()
    }

    /// Number of correlated calls awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.correlator.len()
    }

    /// Open the connection to its relay URL.
    pub async fn open(&self) -> Result<(), ClientError> {
        let url = self.url();
        self.open_to(&url).await
    }

    /// Open the connection to `url`.
    ///
    /// Concurrent callers share one attempt and its outcome. Opening an
    /// open connection to the same URL is a no-op; to a different URL it
    /// fails with [`ClientError::AlreadyOpen`].
    pub async fn open_to(&self, url: &str) -> Result<(), ClientError> {
        let step = {
            let mut shared = self.inner.lock();
            match shared.state {
                ConnectionState::Open | ConnectionState::Connecting if shared.url != url => {
                    return Err(ClientError::AlreadyOpen(shared.url.clone()));
                }
                ConnectionState::Open => OpenStep::Ready,
                ConnectionState::Connecting => match &shared.opening {
                    Some(outcome) => OpenStep::Wait(outcome.clone()),
                    None => return Err(ClientError::InvalidState("connecting")),
                },
                ConnectionState::Closing => return Err(ClientError::InvalidState("closing")),
                ConnectionState::Disconnected => {
                    shared.kind = TransportKind::from_url(url).map_err(ClientError::InvalidUrl)?;
                    shared.url = url.to_string();
                    shared.state = ConnectionState::Connecting;
                    shared.epoch += 1;
                    let (leader, outcome) = watch::channel(None);
                    shared.opening = Some(outcome);
                    OpenStep::Lead(leader, shared.epoch)
                }
            }
        };

        match step {
            OpenStep::Ready => Ok(()),
            OpenStep::Wait(mut outcome) => {
                let settled = match outcome.wait_for(Option::is_some).await {
                    Ok(value) => value.clone(),
                    Err(_) => None,
                };
                settled.unwrap_or_else(|| Err(ClientError::Cancelled("open abandoned".to_string())))
            }
            OpenStep::Lead(leader, epoch) => {
                // Back to Disconnected if this future is dropped mid-open.
                let pending = scopeguard::guard((), |()| {
                    self.inner.abandon_open(epoch);
                });

                let result = self.establish(url).await;
                scopeguard::ScopeGuard::into_inner(pending);

                self.inner.finish_open(epoch, &result);
                let _ = leader.send(Some(result.clone()));
                result
            }
        }
    }

    async fn establish(&self, url: &str) -> Result<(), ClientError> {
        let sender = self.inner.ensure_link().await?;
        let config = &self.inner.config;
        match self.kind() {
            TransportKind::WebSocket => {
                let open = Request::Open(url.to_string()).encode()?;
                for attempt in 0..=config.open_retries {
                    let (ack, acked) = oneshot::channel();
                    self.inner.lock().opened_ack = Some(ack);
                    sender.send_anonymous(open.clone(), &self.inner.provider, config.reply_surbs)?;

                    match tokio::time::timeout(config.open_timeout(), acked).await {
                        Ok(Ok(result)) => return result,
                        Ok(Err(_)) => {
                            return Err(ClientError::Transport("mix link closed".to_string()))
                        }
                        Err(_) => log::warn!(
                            "[Connection] No answer to open {url} (attempt {})",
                            attempt + 1
                        ),
                    }
                }
                Err(ClientError::Timeout(config.open_timeout()))
            }
            TransportKind::Http if config.provider_ping => {
                let ping = json!({"id": 1, "jsonrpc": "2.0", "method": "test", "params": []});
                for attempt in 0..=config.open_retries {
                    match self
                        .inner
                        .call(&sender, url, &ping, config.open_timeout())
                        .await
                    {
                        // Any answer, error envelopes included, proves the path works.
                        Ok(_) => return Ok(()),
                        Err(ClientError::Timeout(_)) => log::warn!(
                            "[Connection] No answer to provider ping (attempt {})",
                            attempt + 1
                        ),
                        Err(e) => return Err(e),
                    }
                }
                Err(ClientError::Timeout(config.open_timeout()))
            }
            TransportKind::Http => Ok(()),
        }
    }

    /// Send a JSON-RPC payload, opening first if needed.
    ///
    /// In WebSocket mode this returns once the payload is handed to the mix
    /// client; relay answers arrive as events. In HTTP mode it waits for the
    /// correlated reply and emits it as a [`ConnectionEvent::Payload`].
    ///
    /// On failure an error envelope carrying the payload's id is emitted as
    /// well.
    pub async fn send(&self, payload: Value) -> Result<(), ClientError> {
        let result = self.send_payload(&payload).await;
        if let Err(e) = &result {
            log::warn!("[Connection] Send failed: {e}");
            let envelope = ErrorResponse::new(jsonrpc::payload_id(&payload), e.to_string());
            self.inner.emit(ConnectionEvent::Payload(envelope.to_value()));
        }
        result
    }

    async fn send_payload(&self, payload: &Value) -> Result<(), ClientError> {
        if !jsonrpc::is_payload(payload) {
            return Err(crate::error::FrameError::NotJsonRpc.into());
        }
        self.ensure_open().await?;

        match self.kind() {
            TransportKind::WebSocket => {
                let text = Request::Payload(payload.clone()).encode()?;
                let sender = self.inner.sender()?;
                sender.send_anonymous(text, &self.inner.provider, self.inner.config.reply_surbs)?;
                Ok(())
            }
            TransportKind::Http => {
                let reply = self.request(payload.clone()).await?;
                self.inner.emit(ConnectionEvent::Payload(reply));
                Ok(())
            }
        }
    }

    /// Make a correlated call and return its reply (HTTP mode only).
    pub async fn request(&self, payload: Value) -> Result<Value, ClientError> {
        if self.kind() != TransportKind::Http {
            return Err(ClientError::NotCorrelated);
        }
        if !jsonrpc::is_payload(&payload) {
            return Err(crate::error::FrameError::NotJsonRpc.into());
        }
        self.ensure_open().await?;

        let sender = self.inner.sender()?;
        let url = self.url();
        self.inner
            .call(&sender, &url, &payload, self.inner.config.call_timeout())
            .await
    }

    async fn ensure_open(&self) -> Result<(), ClientError> {
        if self.state() == ConnectionState::Open {
            return Ok(());
        }
        log::debug!("[Connection] Opening before send");
        self.open().await
    }

    /// Close the connection.
    ///
    /// In WebSocket mode waits for the provider's `closed`; if it never
    /// comes the connection is torn down anyway and the timeout reported.
    /// Closing a disconnected connection fails with
    /// [`ClientError::AlreadyClosed`].
    pub async fn close(&self) -> Result<(), ClientError> {
        let (kind, epoch, acked) = {
            let mut shared = self.inner.lock();
            match shared.state {
                ConnectionState::Disconnected => return Err(ClientError::AlreadyClosed),
                ConnectionState::Open => {}
                other => return Err(ClientError::InvalidState(other.name())),
            }
            shared.state = ConnectionState::Closing;
            let acked = (shared.kind == TransportKind::WebSocket).then(|| {
                let (ack, acked) = oneshot::channel();
                shared.closed_ack = Some(ack);
                acked
            });
            (shared.kind, shared.epoch, acked)
        };

        let mut result = Ok(());
        if let Some(acked) = acked {
            let sent = Request::Close
                .encode()
                .map_err(ClientError::from)
                .and_then(|close| {
                    let sender = self.inner.sender()?;
                    sender
                        .send_anonymous(close, &self.inner.provider, self.inner.config.reply_surbs)
                        .map_err(ClientError::from)
                });
            result = match sent {
                Ok(()) => match tokio::time::timeout(self.inner.config.close_timeout(), acked).await {
                    Ok(Ok(())) => Ok(()),
                    // The link went down first and already tore us down.
                    Ok(Err(_)) => Err(ClientError::Transport(
                        "mix link lost before close was acknowledged".to_string(),
                    )),
                    Err(_) => {
                        log::warn!("[Connection] No closed acknowledgement, closing anyway");
                        Err(ClientError::Timeout(self.inner.config.close_timeout()))
                    }
                },
                Err(e) => Err(e),
            };
        }

        if self.inner.finish_close(epoch) {
            log::info!("[Connection] Closed ({kind:?})");
        }
        result
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn sender(&self) -> Result<MixSender, ClientError> {
        self.lock()
            .link
            .as_ref()
            .map(|link| link.sender.clone())
            .ok_or(ClientError::InvalidState("disconnected"))
    }

    async fn ensure_link(self: &Arc<Self>) -> Result<MixSender, ClientError> {
        if let Some(link) = self.lock().link.as_ref() {
            if !link.sender.is_closed() {
                return Ok(link.sender.clone());
            }
        }

        let MixLink { sender, inbound } = self
            .connector
            .connect()
            .await
            .map_err(|e| ClientError::Transport(format!("{e:#}")))?;
        sender.request_self_address()?;

        let mut shared = self.lock();
        let epoch = shared.epoch;
        let task = tokio::spawn(read_inbound(Arc::downgrade(self), epoch, inbound));
        if let Some(old) = shared.link.replace(LinkState {
            sender: sender.clone(),
            task,
            epoch,
        }) {
            old.task.abort();
        }
        if shared.reaper.is_none() {
            shared.reaper = Some(
                self.correlator
                    .spawn_reaper(self.config.reaper_interval()),
            );
        }
        log::debug!("[Connection] Mix link up");
        Ok(sender)
    }

    async fn call(
        &self,
        sender: &MixSender,
        url: &str,
        payload: &Value,
        timeout: std::time::Duration,
    ) -> Result<Value, ClientError> {
        let (correlation_id, waiter) = self.correlator.register_with_timeout(timeout);
        let frame = HttpFrame {
            url: url.to_string(),
            body: payload.to_string(),
            correlation_id,
        }
        .encode()?;
        sender.send_anonymous(frame, &self.provider, self.config.reply_surbs)?;
        waiter.wait().await
    }

    fn abandon_open(&self, epoch: u64) {
        let link = {
            let mut shared = self.lock();
            if shared.epoch != epoch || shared.state != ConnectionState::Connecting {
                return;
            }
            shared.state = ConnectionState::Disconnected;
            shared.opening = None;
            shared.opened_ack = None;
            shared.link.take()
        };
        if let Some(link) = link {
            link.task.abort();
        }
        log::debug!("[Connection] Open abandoned");
    }

    fn finish_open(&self, epoch: u64, result: &Result<(), ClientError>) {
        let link = {
            let mut shared = self.lock();
            if shared.epoch != epoch {
                return;
            }
            shared.opening = None;
            shared.opened_ack = None;
            match result {
                Ok(()) => {
                    shared.state = ConnectionState::Open;
                    None
                }
                Err(_) => {
                    shared.state = ConnectionState::Disconnected;
                    shared.link.take()
                }
            }
        };
        if let Some(link) = link {
            link.task.abort();
        }

        match result {
            Ok(()) => {
                log::info!("[Connection] Open");
                self.emit(ConnectionEvent::Open);
            }
            Err(e) => {
                log::warn!("[Connection] Open failed: {e}");
                self.emit(ConnectionEvent::Error(e.to_string()));
            }
        }
    }

    /// Tear down after our own close, unless something else already did
    /// (link lost, provider close) or a newer open has started since.
    fn finish_close(&self, epoch: u64) -> bool {
        let closing = {
            let shared = self.lock();
            shared.epoch == epoch && shared.state == ConnectionState::Closing
        };
        if closing {
            self.teardown();
        }
        closing
    }

    /// Drop the session: link down, pending calls failed, `Close` emitted.
    fn teardown(&self) {
        let link = {
            let mut shared = self.lock();
            shared.state = ConnectionState::Disconnected;
            shared.opening = None;
            shared.opened_ack = None;
            shared.closed_ack = None;
            shared.link.take()
        };
        if let Some(link) = link {
            link.task.abort();
        }
        self.correlator
            .cancel_all(&ClientError::Cancelled("connection closed".to_string()));
        self.emit(ConnectionEvent::Close);
    }

    fn handle_inbound(&self, response: ServerResponse) {
        match response {
            ServerResponse::Received { message, .. } => self.handle_reply(&message),
            ServerResponse::SelfAddress { address } => {
                log::info!("[Connection] Mix address: {address}");
                self.lock().self_address = Some(address);
            }
            ServerResponse::Error { message } => {
                log::warn!("[Connection] Mix client error: {message}");
                self.emit(ConnectionEvent::Error(message));
            }
        }
    }

    fn handle_reply(&self, message: &str) {
        let reply = match Reply::decode(message) {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("[Connection] Dropping malformed reply: {e}");
                return;
            }
        };

        match reply {
            Reply::Opened => match self.lock().opened_ack.take() {
                Some(ack) => {
                    let _ = ack.send(Ok(()));
                }
                None => log::debug!("[Connection] Unsolicited opened"),
            },
            Reply::Closed => {
                let state = self.lock().state;
                match state {
                    ConnectionState::Closing => {
                        if let Some(ack) = self.lock().closed_ack.take() {
                            let _ = ack.send(());
                        }
                    }
                    ConnectionState::Open => {
                        log::info!("[Connection] Provider closed the session");
                        self.teardown();
                    }
                    // Left over from an earlier session.
                    ConnectionState::Connecting | ConnectionState::Disconnected => {
                        log::debug!("[Connection] Ignoring stray closed");
                    }
                }
            }
            Reply::Failure(err) => {
                let pending_open = self.lock().opened_ack.take();
                match pending_open {
                    Some(ack) => {
                        let message = err.error.message;
                        let _ = ack.send(Err(ClientError::Remote(message.clone())));
                        self.emit(ConnectionEvent::Error(message));
                    }
                    // Outside an open an id-0 error may answer a request with id 0.
                    None => {
                        self.emit(ConnectionEvent::Error(err.error.message.clone()));
                        self.emit(ConnectionEvent::Payload(err.to_value()));
                    }
                }
            }
            Reply::Http {
                correlation_id,
                payload,
            } => {
                self.correlator.resolve(&correlation_id, payload);
            }
            Reply::Payload(value) => self.emit(ConnectionEvent::Payload(value)),
        }
    }

    fn link_lost(&self, epoch: u64) {
        let current = {
            let shared = self.lock();
            shared.link.as_ref().is_some_and(|link| link.epoch == epoch)
        };
        if !current {
            return;
        }
        log::warn!("[Connection] Mix link lost");
        self.emit(ConnectionEvent::Error("mix link lost".to_string()));
        self.teardown();
    }
}

async fn read_inbound(
    inner: Weak<Inner>,
    epoch: u64,
    mut inbound: mpsc::UnboundedReceiver<ServerResponse>,
) {
    while let Some(response) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.handle_inbound(response);
    }
    if let Some(inner) = inner.upgrade() {
        inner.link_lost(epoch);
    }
}
