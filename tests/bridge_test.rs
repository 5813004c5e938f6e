//! End-to-end tests: connection façade ↔ in-memory mix network ↔ service
//! provider ↔ in-memory relay.

use std::sync::Arc;
use std::time::Duration;

use mixbridge::config::{ClientConfig, ProviderConfig};
use mixbridge::mixnet::{MemoryMixnet, MixLink, ServerResponse};
use mixbridge::provider::downstream::MemoryRemote;
use mixbridge::provider::MemoryDialer;
use mixbridge::{ClientError, ConnectionEvent, ConnectionState, MixConnection, ServiceProvider};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

const PROVIDER: &str = "sp.gateway";
const RELAY: &str = "wss://relay.example/rpc";

struct Bridge {
    mixnet: MemoryMixnet,
    dialer: MemoryDialer,
    stop: watch::Sender<bool>,
    provider: JoinHandle<anyhow::Result<()>>,
}

/// Start a provider on a fresh mix network. Unless `manual` is given,
/// every relay connection echoes each request's method back as its result.
async fn start_bridge(
    default_relay: Option<&str>,
    manual: Option<mpsc::UnboundedSender<MemoryRemote>>,
) -> Bridge {
    let mixnet = MemoryMixnet::new();
    let (dialer, remotes) = MemoryDialer::new();
    let config = ProviderConfig {
        default_relay_url: default_relay.map(str::to_string),
        ..ProviderConfig::default()
    };
    let service = Arc::new(ServiceProvider::new(
        config,
        Arc::new(mixnet.connector(PROVIDER)),
        Arc::new(dialer.clone()),
    ));

    match manual {
        Some(forward) => {
            tokio::spawn(forward_remotes(remotes, forward));
        }
        None => {
            tokio::spawn(echo_relay(remotes));
        }
    }

    let mut address = service.address();
    let (stop, shutdown) = watch::channel(false);
    let provider = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.run(shutdown).await }
    });
    address.wait_for(Option::is_some).await.unwrap();

    Bridge {
        mixnet,
        dialer,
        stop,
        provider,
    }
}

async fn forward_remotes(
    mut remotes: mpsc::UnboundedReceiver<MemoryRemote>,
    forward: mpsc::UnboundedSender<MemoryRemote>,
) {
    while let Some(remote) = remotes.recv().await {
        let _ = forward.send(remote);
    }
}

async fn echo_relay(mut remotes: mpsc::UnboundedReceiver<MemoryRemote>) {
    while let Some(mut remote) = remotes.recv().await {
        tokio::spawn(async move {
            while let Some(text) = remote.recv().await {
                let request: Value = serde_json::from_str(&text).unwrap();
                let response = json!({
                    "id": request["id"],
                    "jsonrpc": "2.0",
                    "result": {"method": request["method"], "relay": remote.url},
                });
                remote.push(response.to_string());
            }
        });
    }
}

fn client_config() -> ClientConfig {
    ClientConfig {
        provider_address: Some(PROVIDER.to_string()),
        open_timeout_secs: 2,
        open_retries: 0,
        close_timeout_secs: 2,
        call_timeout_secs: 2,
        ..ClientConfig::default()
    }
}

fn connect(bridge: &Bridge, name: &str, url: &str) -> MixConnection {
    MixConnection::new(url, client_config(), Arc::new(bridge.mixnet.connector(name))).unwrap()
}

async fn next_payload(events: &mut broadcast::Receiver<ConnectionEvent>) -> Value {
    let wait = async {
        loop {
            if let ConnectionEvent::Payload(value) = events.recv().await.unwrap() {
                return value;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait).await.unwrap()
}

async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap()
}

async fn next_message(link: &mut MixLink) -> String {
    let response = tokio::time::timeout(Duration::from_secs(2), link.inbound.recv())
        .await
        .unwrap()
        .unwrap();
    match response {
        ServerResponse::Received { message, .. } => message,
        other => panic!("unexpected mix response: {other:?}"),
    }
}

#[tokio::test]
async fn test_websocket_session_round_trip() {
    let bridge = start_bridge(None, None).await;
    let conn = connect(&bridge, "alice", RELAY);
    let mut events = conn.subscribe();

    conn.open().await.unwrap();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Open);

    conn.send(json!({"id": 1, "jsonrpc": "2.0", "method": "ping"}))
        .await
        .unwrap();
    let reply = next_payload(&mut events).await;
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["result"]["method"], "ping");
    assert_eq!(reply["result"]["relay"], RELAY);

    conn.close().await.unwrap();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Close);
    assert_eq!(conn.close().await, Err(ClientError::AlreadyClosed));
    assert_eq!(bridge.dialer.dials(), vec![RELAY.to_string()]);
}

#[tokio::test]
async fn test_concurrent_sessions_do_not_cross_talk() {
    let bridge = start_bridge(None, None).await;
    let alice = connect(&bridge, "alice", RELAY);
    let bob = connect(&bridge, "bob", "wss://other-relay.example/rpc");
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    let (a, b) = tokio::join!(alice.open(), bob.open());
    a.unwrap();
    b.unwrap();

    let (a, b) = tokio::join!(
        alice.send(json!({"id": 1, "jsonrpc": "2.0", "method": "alice_call"})),
        bob.send(json!({"id": 1, "jsonrpc": "2.0", "method": "bob_call"})),
    );
    a.unwrap();
    b.unwrap();

    let alice_reply = next_payload(&mut alice_events).await;
    let bob_reply = next_payload(&mut bob_events).await;
    assert_eq!(alice_reply["result"]["method"], "alice_call");
    assert_eq!(alice_reply["result"]["relay"], RELAY);
    assert_eq!(bob_reply["result"]["method"], "bob_call");
    assert_eq!(bob_reply["result"]["relay"], "wss://other-relay.example/rpc");
}

#[tokio::test]
async fn test_duplicate_open_dials_once() {
    let bridge = start_bridge(None, None).await;
    let mut raw = bridge.mixnet.link("raw");

    for _ in 0..2 {
        raw.sender
            .send_anonymous(format!("open:{RELAY}"), PROVIDER, 5)
            .unwrap();
    }
    assert_eq!(next_message(&mut raw).await, "opened");
    assert_eq!(next_message(&mut raw).await, "opened");
    assert_eq!(bridge.dialer.dials().len(), 1);
}

#[tokio::test]
async fn test_payload_without_session_auto_opens_default_relay() {
    let bridge = start_bridge(Some(RELAY), None).await;
    let mut raw = bridge.mixnet.link("raw");

    raw.sender
        .send_anonymous(
            json!({"id": 9, "jsonrpc": "2.0", "method": "eth_blockNumber"}).to_string(),
            PROVIDER,
            5,
        )
        .unwrap();

    assert_eq!(next_message(&mut raw).await, "opened");
    let reply: Value = serde_json::from_str(&next_message(&mut raw).await).unwrap();
    assert_eq!(reply["id"], 9);
    assert_eq!(reply["result"]["method"], "eth_blockNumber");
    assert_eq!(bridge.dialer.dials(), vec![RELAY.to_string()]);
}

#[tokio::test]
async fn test_payload_without_session_or_default_gets_error() {
    let bridge = start_bridge(None, None).await;
    let mut raw = bridge.mixnet.link("raw");

    raw.sender
        .send_anonymous(
            json!({"id": 4, "jsonrpc": "2.0", "method": "x"}).to_string(),
            PROVIDER,
            5,
        )
        .unwrap();

    let reply: Value = serde_json::from_str(&next_message(&mut raw).await).unwrap();
    assert_eq!(reply["id"], 4);
    assert_eq!(reply["error"]["code"], -32000);
    assert!(bridge.dialer.dials().is_empty());
}

#[tokio::test]
async fn test_refused_relay_fails_open_then_retry_succeeds() {
    let bridge = start_bridge(None, None).await;
    bridge.dialer.refuse(RELAY);
    let conn = connect(&bridge, "alice", RELAY);

    let err = conn.open().await.unwrap_err();
    assert!(matches!(err, ClientError::Remote(_)));
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    bridge.dialer.allow(RELAY);
    conn.open().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_relay_hangup_closes_connection() {
    let (remotes_tx, mut remotes) = mpsc::unbounded_channel();
    let bridge = start_bridge(None, Some(remotes_tx)).await;
    let conn = connect(&bridge, "alice", RELAY);
    let mut events = conn.subscribe();

    conn.open().await.unwrap();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Open);

    let remote = remotes.recv().await.unwrap();
    remote.push(r#"{"jsonrpc":"2.0","id":0,"method":"irn_subscription"}"#);
    let pushed = next_payload(&mut events).await;
    assert_eq!(pushed["method"], "irn_subscription");

    remote.close(1001, "going away");
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Close);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_provider_shutdown_closes_sessions() {
    let bridge = start_bridge(None, None).await;
    let conn = connect(&bridge, "alice", RELAY);
    let mut events = conn.subscribe();
    conn.open().await.unwrap();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Open);

    bridge.stop.send(true).unwrap();
    bridge.provider.await.unwrap().unwrap();

    assert_eq!(next_event(&mut events).await, ConnectionEvent::Close);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_send_auto_opens() {
    let bridge = start_bridge(None, None).await;
    let conn = connect(&bridge, "alice", RELAY);
    let mut events = conn.subscribe();

    conn.send(json!({"id": 2, "jsonrpc": "2.0", "method": "auto"}))
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Open);
    assert_eq!(next_payload(&mut events).await["result"]["method"], "auto");
}
