//! Session registry: one downstream relay connection per sender tag.
//!
//! The tag map is the only shared state on the provider side. Its mutex is
//! held for lookup, insert and remove only; dialing, sending and closing
//! all happen with the lock released.
//!
//! Slot lifecycle for one tag:
//!
//! ```text
//!   (absent) ──open──▶ Opening ──dial ok──▶ Live ──close / relay gone──▶ (absent)
//!                         │
//!                         └──dial failed──▶ (absent)
//! ```
//!
//! Concurrent opens for a tag that is `Opening` wait on the leader's watch
//! channel instead of dialing again. Each live session carries a
//! generation so the pump of a replaced session can never remove its
//! successor.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, watch};

use super::downstream::{Dialer, DownstreamEvent, DownstreamHandle};
use crate::error::{CloseError, ForwardError, OpenError};
use crate::mixnet::{MixSender, SenderTag};
use crate::protocol::codec::Reply;
use crate::protocol::jsonrpc::{self, ErrorResponse};
use crate::protocol::TransportKind;

type OpenOutcome = Option<Result<Session, OpenError>>;

/// A live session.
#[derive(Debug, Clone)]
pub struct Session {
    handle: DownstreamHandle,
    generation: u64,
}

impl Session {
    /// Relay URL of the downstream connection.
    pub fn url(&self) -> &str {
        self.handle.url()
    }

    /// Downstream connection handle.
    pub fn handle(&self) -> &DownstreamHandle {
        &self.handle
    }
}

#[derive(Debug)]
enum Slot {
    Opening(watch::Receiver<OpenOutcome>),
    Live(Session),
}

enum OpenStep {
    Existing(Session),
    Wait(watch::Receiver<OpenOutcome>),
    Lead(watch::Sender<OpenOutcome>),
}

enum CloseStep {
    Wait(watch::Receiver<OpenOutcome>),
    Live(Session),
    Absent,
}

/// Maps sender tags to live downstream connections.
pub struct SessionRegistry {
    dialer: Arc<dyn Dialer>,
    mix: MixSender,
    default_url: Option<String>,
    sessions: Mutex<HashMap<SenderTag, Slot>>,
    generations: AtomicU64,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("default_url", &self.default_url)
            .field("sessions", &self.len())
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Registry replying on `mix`, dialing with `dialer`, and auto-opening
    /// `default_url` for payloads that arrive without a session.
    pub fn new(dialer: Arc<dyn Dialer>, mix: MixSender, default_url: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            dialer,
            mix,
            default_url,
            sessions: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        })
    }

    /// Open a session for `tag`, or acknowledge the one already open.
    ///
    /// Emits `opened` to `tag` on success and a session-level error
    /// envelope on failure.
    pub async fn open(self: &Arc<Self>, tag: &SenderTag, url: &str) -> Result<Session, OpenError> {
        let result = self.open_session(tag, url).await;
        match &result {
            Ok(_) => self.emit(tag, &Reply::Opened),
            Err(e) => {
                let envelope = ErrorResponse::new(Value::from(0), e.to_string());
                self.emit(tag, &Reply::Failure(envelope));
            }
        }
        result
    }

    async fn open_session(
        self: &Arc<Self>,
        tag: &SenderTag,
        url: &str,
    ) -> Result<Session, OpenError> {
        let step = {
            let mut sessions = self.lock();
            match sessions.get(tag) {
                Some(Slot::Live(session)) => OpenStep::Existing(session.clone()),
                Some(Slot::Opening(outcome)) => OpenStep::Wait(outcome.clone()),
                None => {
                    let (leader, outcome) = watch::channel(None);
                    sessions.insert(tag.clone(), Slot::Opening(outcome));
                    OpenStep::Lead(leader)
                }
            }
        };

        match step {
            OpenStep::Existing(session) => {
                if session.url() != url {
                    log::warn!(
                        "[Registry] {tag} asked for {url} but is already open to {}",
                        session.url()
                    );
                }
                log::debug!("[Registry] {tag} already open");
                Ok(session)
            }
            OpenStep::Wait(outcome) => wait_for_open(outcome).await,
            OpenStep::Lead(leader) => {
                // Clears the Opening slot if this future is dropped mid-dial.
                let pending = scopeguard::guard((), |()| {
                    let mut sessions = self.lock();
                    if matches!(sessions.get(tag), Some(Slot::Opening(_))) {
                        sessions.remove(tag);
                    }
                });

                let result = self.dial(tag, url).await;
                scopeguard::ScopeGuard::into_inner(pending);
                let _ = leader.send(Some(result.clone()));
                result
            }
        }
    }

    async fn dial(self: &Arc<Self>, tag: &SenderTag, url: &str) -> Result<Session, OpenError> {
        let validated = match TransportKind::from_url(url) {
            Ok(TransportKind::WebSocket) => Ok(()),
            Ok(TransportKind::Http) => Err("sessions need a ws:// or wss:// URL".to_string()),
            Err(reason) => Err(reason),
        };
        if let Err(reason) = validated {
            self.lock().remove(tag);
            return Err(OpenError::InvalidUrl {
                url: url.to_string(),
                reason,
            });
        }

        log::info!("[Registry] Opening {url} for {tag}");
        let link = match self.dialer.dial(url).await {
            Ok(link) => link,
            Err(e) => {
                self.lock().remove(tag);
                log::warn!("[Registry] Dial {url} for {tag} failed: {e:#}");
                return Err(OpenError::DialFailed {
                    url: url.to_string(),
                    reason: format!("{e:#}"),
                });
            }
        };

        let session = Session {
            handle: link.handle,
            generation: self.generations.fetch_add(1, Ordering::Relaxed),
        };
        self.lock().insert(tag.clone(), Slot::Live(session.clone()));
        tokio::spawn(pump(
            Arc::clone(self),
            tag.clone(),
            session.generation,
            link.events,
        ));
        Ok(session)
    }

    /// Close the session for `tag`.
    ///
    /// `closed` is emitted to `tag` whether or not a session existed, so the
    /// peer can always finish its close; the return value tells the two
    /// cases apart.
    pub async fn close(&self, tag: &SenderTag) -> Result<(), CloseError> {
        loop {
            let step = {
                let mut sessions = self.lock();
                match sessions.get(tag) {
                    Some(Slot::Opening(outcome)) => CloseStep::Wait(outcome.clone()),
                    Some(Slot::Live(_)) => match sessions.remove(tag) {
                        Some(Slot::Live(session)) => CloseStep::Live(session),
                        _ => CloseStep::Absent,
                    },
                    None => CloseStep::Absent,
                }
            };

            match step {
                CloseStep::Wait(outcome) => {
                    let _ = wait_for_open(outcome).await;
                }
                CloseStep::Live(session) => {
                    log::info!("[Registry] Closing {} for {tag}", session.url());
                    if let Err(e) = session.handle.close().await {
                        log::warn!("[Registry] Close of {} failed: {e:#}", session.url());
                    }
                    self.emit(tag, &Reply::Closed);
                    return Ok(());
                }
                CloseStep::Absent => {
                    log::debug!("[Registry] Close for {tag} with no session");
                    self.emit(tag, &Reply::Closed);
                    return Err(CloseError::AlreadyClosed);
                }
            }
        }
    }

    /// Forward a JSON-RPC payload on `tag`'s session, auto-opening the
    /// default relay if there is none.
    ///
    /// Failures are also reported to `tag` as an error envelope carrying
    /// the payload's id.
    pub async fn forward(
        self: &Arc<Self>,
        tag: &SenderTag,
        payload: Value,
    ) -> Result<(), ForwardError> {
        let result = self.forward_payload(tag, &payload).await;
        if let Err(e) = &result {
            log::warn!("[Registry] Forward for {tag} failed: {e}");
            let envelope = ErrorResponse::new(jsonrpc::payload_id(&payload), e.to_string());
            self.emit(tag, &Reply::Payload(envelope.to_value()));
        }
        result
    }

    async fn forward_payload(
        self: &Arc<Self>,
        tag: &SenderTag,
        payload: &Value,
    ) -> Result<(), ForwardError> {
        let session = match self.live(tag) {
            Some(session) => session,
            None => {
                let url = self.default_url.clone().ok_or(ForwardError::NoSession)?;
                log::info!("[Registry] Auto-opening {url} for {tag}");
                self.open(tag, &url).await?
            }
        };

        log::debug!("[Registry] Forwarding to {} for {tag}", session.url());
        session
            .handle
            .send(payload.to_string())
            .await
            .map_err(|e| ForwardError::SendFailed(format!("{e:#}")))
    }

    /// Close every session, telling each peer `closed`.
    pub async fn close_all(&self) {
        let drained: Vec<(SenderTag, Slot)> = self.lock().drain().collect();
        for (tag, slot) in drained {
            if let Slot::Live(session) = slot {
                if let Err(e) = session.handle.close().await {
                    log::warn!("[Registry] Close of {} failed: {e:#}", session.url());
                }
                self.emit(&tag, &Reply::Closed);
            }
        }
    }

    /// The live session for `tag`, if any.
    pub fn live(&self, tag: &SenderTag) -> Option<Session> {
        match self.lock().get(tag) {
            Some(Slot::Live(session)) => Some(session.clone()),
            _ => None,
        }
    }

    /// Number of tags with a session (live or opening).
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no session exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn emit(&self, tag: &SenderTag, reply: &Reply) {
        if self.mix.reply(reply.encode(), tag).is_err() {
            log::warn!("[Registry] Mix link gone, dropped reply to {tag}");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SenderTag, Slot>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove `tag` only if it still holds the session of `generation`.
    fn remove_generation(&self, tag: &SenderTag, generation: u64) -> bool {
        let mut sessions = self.lock();
        let current = matches!(
            sessions.get(tag),
            Some(Slot::Live(session)) if session.generation == generation
        );
        if current {
            sessions.remove(tag);
        }
        current
    }
}

async fn wait_for_open(mut outcome: watch::Receiver<OpenOutcome>) -> Result<Session, OpenError> {
    let settled = match outcome.wait_for(Option::is_some).await {
        Ok(value) => value.clone(),
        Err(_) => None,
    };
    settled.unwrap_or(Err(OpenError::Abandoned))
}

/// Relays downstream messages to `tag` until the connection ends.
async fn pump(
    registry: Arc<SessionRegistry>,
    tag: SenderTag,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<DownstreamEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            DownstreamEvent::Message(text) => {
                log::debug!("[Registry] Relay -> {tag}: {} bytes", text.len());
                if registry.mix.reply(text, &tag).is_err() {
                    log::warn!("[Registry] Mix link gone, dropped relay message for {tag}");
                }
            }
            DownstreamEvent::Closed { code, reason } => {
                log::info!("[Registry] Relay closed session for {tag}: {code} {reason}");
                break;
            }
            DownstreamEvent::Error(reason) => {
                log::warn!("[Registry] Relay error for {tag}: {reason}");
                break;
            }
        }
    }

    // A local close already removed the entry and told the peer.
    if registry.remove_generation(&tag, generation) {
        registry.emit(&tag, &Reply::Closed);
    }
}
