//! HTTP forwarding against a mock relay, directly and end to end.

use std::sync::Arc;
use std::time::Duration;

use mixbridge::config::{ClientConfig, ProviderConfig};
use mixbridge::mixnet::MemoryMixnet;
use mixbridge::protocol::codec::{HttpFrame, Reply};
use mixbridge::protocol::CorrelationId;
use mixbridge::provider::http_forward::{HttpForwardError, HttpForwarder};
use mixbridge::provider::MemoryDialer;
use mixbridge::{ConnectionEvent, MixConnection, ServiceProvider};
use serde_json::json;
use tokio::sync::watch;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn forwarder() -> HttpForwarder {
    HttpForwarder::new(Duration::from_secs(2), 1024).unwrap()
}

#[tokio::test]
async fn test_post_returns_relay_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(header("content-type", "application/json"))
        .and(header("accept", "application/json"))
        .and(body_partial_json(json!({"method": "eth_chainId"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": 1, "jsonrpc": "2.0", "result": "0x1"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let value = forwarder()
        .post(
            &format!("{}/rpc", server.uri()),
            r#"{"id":1,"jsonrpc":"2.0","method":"eth_chainId"}"#,
        )
        .await
        .unwrap();
    assert_eq!(value["result"], "0x1");
}

#[tokio::test]
async fn test_error_status_with_json_body_is_passed_through() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(
            json!({"id": 1, "jsonrpc": "2.0", "error": {"code": -32601, "message": "Method not found"}}),
        ))
        .mount(&server)
        .await;

    let value = forwarder().post(&server.uri(), "{}").await.unwrap();
    assert_eq!(value["error"]["code"], -32601);
}

#[tokio::test]
async fn test_error_status_without_json_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502).set_body_string("<html>bad gateway</html>"))
        .mount(&server)
        .await;

    let err = forwarder().post(&server.uri(), "{}").await.unwrap_err();
    assert!(matches!(err, HttpForwardError::Status(502)));
}

#[tokio::test]
async fn test_oversized_response_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(4096)))
        .mount(&server)
        .await;

    let err = forwarder().post(&server.uri(), "{}").await.unwrap_err();
    assert!(matches!(err, HttpForwardError::TooLarge(1024)));
}

#[tokio::test]
async fn test_handle_tags_reply_with_correlation_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": 5, "jsonrpc": "2.0", "result": true})),
        )
        .mount(&server)
        .await;

    let correlation_id = CorrelationId::random();
    let reply = forwarder()
        .handle(HttpFrame {
            url: server.uri(),
            body: r#"{"id":5,"jsonrpc":"2.0","method":"net_listening"}"#.into(),
            correlation_id: correlation_id.clone(),
        })
        .await;

    assert_eq!(
        reply,
        Reply::Http {
            correlation_id,
            payload: json!({"id": 5, "jsonrpc": "2.0", "result": true}),
        }
    );
}

#[tokio::test]
async fn test_http_calls_through_the_mix_network() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "test"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": 1, "jsonrpc": "2.0", "result": "ok"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    for id in 1..=3 {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"id": id, "method": "eth_chainId"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"id": id, "jsonrpc": "2.0", "result": format!("0x{id}")}),
            ))
            .expect(1)
            .mount(&server)
            .await;
    }

    let mixnet = MemoryMixnet::new();
    let (dialer, _remotes) = MemoryDialer::new();
    let service = Arc::new(ServiceProvider::new(
        ProviderConfig {
            default_relay_url: None,
            ..ProviderConfig::default()
        },
        Arc::new(mixnet.connector("sp")),
        Arc::new(dialer),
    ));
    let mut address = service.address();
    let (_stop, shutdown) = watch::channel(false);
    tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.run(shutdown).await }
    });
    address.wait_for(Option::is_some).await.unwrap();

    let config = ClientConfig {
        provider_address: Some("sp".to_string()),
        call_timeout_secs: 5,
        open_timeout_secs: 5,
        ..ClientConfig::default()
    };
    let conn = MixConnection::new(
        &format!("{}/v1", server.uri()),
        config,
        Arc::new(mixnet.connector("client")),
    )
    .unwrap();
    let mut events = conn.subscribe();

    // Three concurrent calls, each answered by its own correlated reply.
    let calls = (1..=3).map(|id| {
        let conn = conn.clone();
        async move {
            let reply = conn
                .request(json!({"id": id, "jsonrpc": "2.0", "method": "eth_chainId"}))
                .await;
            (id, reply)
        }
    });
    for (id, reply) in futures_util::future::join_all(calls).await {
        let reply = reply.unwrap();
        assert_eq!(reply["id"], id);
        assert_eq!(reply["result"], format!("0x{id}"));
    }
    assert_eq!(conn.pending_calls(), 0);
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Open);

    conn.close().await.unwrap();
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Close);
}
