//! Per-tag dispatch of inbound mix messages.
//!
//! Every sender tag gets its own worker task fed by an unbounded queue, so
//! a slow dial or send for one tag never holds up another. Within a tag,
//! messages are handled strictly in arrival order; only HTTP frames are
//! spun off, since their replies are correlated and need no ordering.
//!
//! Workers that sit idle report back and are retired. If a message for the
//! same tag shows up while a retired worker is still draining, the new
//! worker waits for the old one to finish first.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::http_forward::HttpForwarder;
use super::registry::SessionRegistry;
use crate::mixnet::{MixSender, SenderTag};
use crate::protocol::codec::Request;

/// A worker that went idle, identified by tag and worker id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleWorker {
    /// Tag the worker serves.
    pub tag: SenderTag,
    /// Id of the worker instance.
    pub worker: u64,
}

#[derive(Debug)]
struct Worker {
    id: u64,
    queue: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

/// Routes inbound messages to per-tag workers.
#[derive(Debug)]
pub struct Dispatcher {
    context: WorkerContext,
    idle_timeout: Duration,
    idle_tx: mpsc::UnboundedSender<IdleWorker>,
    workers: HashMap<SenderTag, Worker>,
    retired: HashMap<SenderTag, JoinHandle<()>>,
    next_worker: u64,
}

#[derive(Debug, Clone)]
struct WorkerContext {
    registry: Arc<SessionRegistry>,
    http: HttpForwarder,
    mix: MixSender,
}

impl Dispatcher {
    /// Dispatcher plus the stream of idle-worker reports the caller must
    /// feed back through [`Dispatcher::retire`].
    pub fn new(
        registry: Arc<SessionRegistry>,
        http: HttpForwarder,
        mix: MixSender,
        idle_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<IdleWorker>) {
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            context: WorkerContext {
                registry,
                http,
                mix,
            },
            idle_timeout,
            idle_tx,
            workers: HashMap::new(),
            retired: HashMap::new(),
            next_worker: 0,
        };
        (dispatcher, idle_rx)
    }

    /// Queue `message` for its sender's worker.
    ///
    /// Messages without a sender tag cannot be answered and are dropped.
    pub fn dispatch(&mut self, message: String, sender_tag: Option<SenderTag>) {
        let Some(tag) = sender_tag else {
            log::warn!("[Dispatcher] Dropping message without reply blocks");
            return;
        };

        let message = match self.workers.get(&tag) {
            Some(worker) => match worker.queue.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        let worker = self.spawn_worker(tag.clone());
        // Fresh worker: its receiver is alive.
        let _ = worker.queue.send(message);
        self.workers.insert(tag, worker);
    }

    /// Retire a worker that reported idle, unless it has since been
    /// replaced.
    pub fn retire(&mut self, idle: &IdleWorker) {
        if self
            .workers
            .get(&idle.tag)
            .is_some_and(|worker| worker.id == idle.worker)
        {
            if let Some(worker) = self.workers.remove(&idle.tag) {
                log::debug!("[Dispatcher] Retiring idle worker for {}", idle.tag);
                // Dropping the queue lets the worker drain and exit.
                self.retired.insert(idle.tag.clone(), worker.task);
            }
        }
        self.retired.retain(|_, task| !task.is_finished());
    }

    /// Number of active workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop every worker without waiting for queued messages.
    pub fn shutdown(&mut self) {
        for (_, worker) in self.workers.drain() {
            worker.task.abort();
        }
        for (_, task) in self.retired.drain() {
            task.abort();
        }
    }

    fn spawn_worker(&mut self, tag: SenderTag) -> Worker {
        let id = self.next_worker;
        self.next_worker += 1;

        let (queue, inbox) = mpsc::unbounded_channel();
        let predecessor = self.retired.remove(&tag);
        let task = tokio::spawn(run_worker(
            self.context.clone(),
            tag,
            id,
            inbox,
            predecessor,
            self.idle_timeout,
            self.idle_tx.clone(),
        ));
        Worker { id, queue, task }
    }
}

async fn run_worker(
    context: WorkerContext,
    tag: SenderTag,
    id: u64,
    mut inbox: mpsc::UnboundedReceiver<String>,
    predecessor: Option<JoinHandle<()>>,
    idle_timeout: Duration,
    idle_tx: mpsc::UnboundedSender<IdleWorker>,
) {
    if let Some(predecessor) = predecessor {
        let _ = predecessor.await;
    }

    let mut reported = false;
    loop {
        match tokio::time::timeout(idle_timeout, inbox.recv()).await {
            Ok(Some(message)) => {
                reported = false;
                handle_message(&context, &tag, message).await;
            }
            Ok(None) => break,
            Err(_) if !reported => {
                reported = true;
                let _ = idle_tx.send(IdleWorker {
                    tag: tag.clone(),
                    worker: id,
                });
            }
            Err(_) => {}
        }
    }
    log::debug!("[Dispatcher] Worker {id} for {tag} stopped");
}

async fn handle_message(context: &WorkerContext, tag: &SenderTag, message: String) {
    let request = match Request::decode(&message) {
        Ok(request) => request,
        Err(e) => {
            log::warn!("[Dispatcher] Dropping malformed message from {tag}: {e}");
            log::debug!("[Dispatcher] Malformed message: {message}");
            return;
        }
    };

    match request {
        Request::Open(url) => {
            let _ = context.registry.open(tag, &url).await;
        }
        Request::Close => {
            let _ = context.registry.close(tag).await;
        }
        Request::Payload(payload) => {
            let _ = context.registry.forward(tag, payload).await;
        }
        Request::Http(frame) => {
            let http = context.http.clone();
            let mix = context.mix.clone();
            let tag = tag.clone();
            tokio::spawn(async move {
                let reply = http.handle(frame).await;
                if mix.reply(reply.encode(), &tag).is_err() {
                    log::warn!("[Dispatcher] Mix link gone, dropped HTTP reply to {tag}");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::mixnet::ClientRequest;
    use crate::provider::downstream::{MemoryDialer, MemoryRemote};

    const RELAY: &str = "wss://relay.example/rpc";

    struct Harness {
        dispatcher: Dispatcher,
        idle: mpsc::UnboundedReceiver<IdleWorker>,
        dialer: MemoryDialer,
        remotes: mpsc::UnboundedReceiver<MemoryRemote>,
        outbound: mpsc::UnboundedReceiver<ClientRequest>,
    }

    fn harness(idle_timeout: Duration) -> Harness {
        let (dialer, remotes) = MemoryDialer::new();
        let (mix, outbound) = MixSender::channel();
        let registry = SessionRegistry::new(Arc::new(dialer.clone()), mix.clone(), None);
        let http = HttpForwarder::new(Duration::from_secs(1), 1024).unwrap();
        let (dispatcher, idle) = Dispatcher::new(registry, http, mix, idle_timeout);
        Harness {
            dispatcher,
            idle,
            dialer,
            remotes,
            outbound,
        }
    }

    async fn next_message(outbound: &mut mpsc::UnboundedReceiver<ClientRequest>) -> String {
        match outbound.recv().await {
            Some(ClientRequest::Reply { message, .. }) => message,
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_messages_for_one_tag_keep_order() {
        let mut h = harness(Duration::from_secs(60));
        let tag = SenderTag::new("T1");

        h.dispatcher.dispatch(format!("open:{RELAY}"), Some(tag.clone()));
        for id in 1..=3 {
            let payload = json!({"id": id, "jsonrpc": "2.0", "method": "ping"});
            h.dispatcher.dispatch(payload.to_string(), Some(tag.clone()));
        }

        let mut remote = h.remotes.recv().await.unwrap();
        for id in 1..=3 {
            let sent: Value = serde_json::from_str(&remote.recv().await.unwrap()).unwrap();
            assert_eq!(sent["id"], id);
        }
        assert_eq!(next_message(&mut h.outbound).await, "opened");
        assert_eq!(h.dispatcher.worker_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_message_is_dropped_silently() {
        let mut h = harness(Duration::from_secs(60));
        let tag = SenderTag::new("T1");

        h.dispatcher.dispatch("{\"hello\":1}".into(), Some(tag.clone()));
        h.dispatcher.dispatch("close".into(), Some(tag));

        // Only the close produces output.
        assert_eq!(next_message(&mut h.outbound).await, "closed");
        assert!(h.dialer.dials().is_empty());
    }

    #[tokio::test]
    async fn test_untagged_message_is_dropped() {
        let mut h = harness(Duration::from_secs(60));
        h.dispatcher.dispatch("close".into(), None);
        assert_eq!(h.dispatcher.worker_count(), 0);
        assert!(h.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_tag_does_not_block_other_tag() {
        let mut h = harness(Duration::from_secs(60));
        h.dialer.set_delay(Duration::from_millis(200));

        h.dispatcher
            .dispatch(format!("open:{RELAY}"), Some(SenderTag::new("slow")));
        h.dispatcher.dispatch("close".into(), Some(SenderTag::new("fast")));

        match h.outbound.recv().await {
            Some(ClientRequest::Reply {
                message,
                sender_tag,
            }) => {
                assert_eq!(message, "closed");
                assert_eq!(sender_tag, SenderTag::new("fast"));
            }
            other => panic!("expected reply, got {other:?}"),
        }
        assert_eq!(next_message(&mut h.outbound).await, "opened");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_worker_is_retired_and_replaced() {
        let mut h = harness(Duration::from_secs(5));
        let tag = SenderTag::new("T1");

        h.dispatcher.dispatch("close".into(), Some(tag.clone()));
        assert_eq!(next_message(&mut h.outbound).await, "closed");

        let idle = h.idle.recv().await.unwrap();
        assert_eq!(idle.tag, tag);
        h.dispatcher.retire(&idle);
        assert_eq!(h.dispatcher.worker_count(), 0);

        h.dispatcher.dispatch("close".into(), Some(tag));
        assert_eq!(next_message(&mut h.outbound).await, "closed");
        assert_eq!(h.dispatcher.worker_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_idle_report_is_ignored() {
        let mut h = harness(Duration::from_secs(60));
        let tag = SenderTag::new("T1");
        h.dispatcher.dispatch("close".into(), Some(tag.clone()));

        h.dispatcher.retire(&IdleWorker { tag, worker: 99 });
        assert_eq!(h.dispatcher.worker_count(), 1);
    }
}
