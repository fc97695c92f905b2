//! Hub, endpoint and callers over real sockets.

use std::sync::Arc;
use std::time::Duration;

use courier_core::leadership::{Candidate, PRIMARY_TIER};
use courier_core::security::ApiKey;
use courier_core::Envelope;
use courier_hub::{start, HubConfig, ServerHandle};
use courier_link::{
    Endpoint, EndpointConfig, HandlerError, HandlerFn, MemoryStore, SendContext, WsTransport,
};
use courier_settings::LinkSettings;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

async fn boot(api_key: Option<&str>) -> ServerHandle {
    let config = HubConfig {
        host: "127.0.0.1".into(),
        port: 0,
        api_key: api_key.map(ApiKey::new),
        request_timeout: Duration::from_secs(2),
        ..HubConfig::default()
    };
    start(config, None).await.unwrap()
}

fn endpoint(port: u16, api_key: Option<&str>) -> Endpoint {
    let settings = LinkSettings {
        relay_url: format!("ws://127.0.0.1:{port}/ws/endpoint"),
        endpoint_id: "gm-1".into(),
        api_key: api_key.map(str::to_owned),
        ..LinkSettings::default()
    };
    let config = EndpointConfig::from_settings(&settings).unwrap();
    Endpoint::new(Arc::new(WsTransport), config).with_documents(Arc::new(MemoryStore::new()))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Boot a hub with a primary endpoint attached.
async fn boot_with_endpoint() -> (ServerHandle, Endpoint) {
    let server = boot(None).await;
    let endpoint = endpoint(server.port(), None);
    let _ = endpoint.apply_membership(&[Candidate::new("gm-1", PRIMARY_TIER, true)]);
    let hub = Arc::clone(server.hub());
    wait_until(|| hub.endpoint_connected()).await;
    (server, endpoint)
}

async fn caller(port: u16, token: Option<&str>) -> Ws {
    let mut request = format!("ws://127.0.0.1:{port}/ws")
        .into_client_request()
        .unwrap();
    if let Some(token) = token {
        let _ = request
            .headers_mut()
            .insert(AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
    }
    let (ws, _) = connect_async(request).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

async fn recv_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => {}
        }
    }
}

/// Next message of `kind`, skipping status notices.
async fn recv_kind(ws: &mut Ws, kind: &str) -> Value {
    loop {
        let msg = recv_json(ws).await;
        if msg["kind"] == kind {
            return msg;
        }
    }
}

async fn recv_close(ws: &mut Ws) -> Option<(u16, String)> {
    loop {
        match tokio::time::timeout(WAIT, ws.next()).await.ok()?? {
            Ok(Message::Close(frame)) => {
                return frame.map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))
            }
            Ok(_) => {}
            Err(_) => return None,
        }
    }
}

#[tokio::test]
async fn request_round_trips_through_endpoint() {
    let (server, _endpoint) = boot_with_endpoint().await;
    let mut ws = caller(server.port(), None).await;

    let welcome = recv_kind(&mut ws, "welcome").await;
    assert_eq!(welcome["connected"], true);
    assert_eq!(welcome["authRequired"], false);

    send(
        &mut ws,
        json!({
            "kind": "create-entity",
            "requestId": "req-1",
            "entityType": "Actor",
            "data": {"name": "Goblin"},
        }),
    )
    .await;
    let created = recv_kind(&mut ws, "entity-created").await;
    assert_eq!(created["requestId"], "req-1");
    assert!(created.get("correlationId").is_none());
    let uuid = created["uuid"].as_str().unwrap().to_owned();

    send(&mut ws, json!({"kind": "get-entity", "requestId": "req-2", "uuid": uuid})).await;
    let data = recv_kind(&mut ws, "entity-data").await;
    assert_eq!(data["requestId"], "req-2");
    assert_eq!(data["data"]["data"]["name"], "Goblin");

    assert_eq!(server.hub().pending_requests(), 0);
    server.shutdown().await;
}

#[tokio::test]
async fn handler_failure_comes_back_as_one_error() {
    let (server, _endpoint) = boot_with_endpoint().await;
    let mut ws = caller(server.port(), None).await;
    let _ = recv_kind(&mut ws, "welcome").await;

    send(
        &mut ws,
        json!({"kind": "create-entity", "requestId": "bad", "entityType": "Spaceship"}),
    )
    .await;
    let failed = recv_kind(&mut ws, "entity-created").await;
    assert_eq!(failed["requestId"], "bad");
    assert_eq!(failed["error"], "Invalid entity type: Spaceship");

    // still serving
    send(&mut ws, json!({"kind": "teleport", "requestId": "next"})).await;
    let unknown = recv_kind(&mut ws, "error").await;
    assert_eq!(unknown["requestId"], "next");
    assert_eq!(unknown["error"], "Unknown message kind: teleport");
    server.shutdown().await;
}

#[tokio::test]
async fn unauthorized_caller_is_closed_with_policy_violation() {
    let server = boot(Some("s3cret")).await;
    let mut ws = caller(server.port(), None).await;
    assert_eq!(recv_close(&mut ws).await, Some((1008, "Unauthorized".into())));

    let mut ws = caller(server.port(), Some("wrong")).await;
    assert_eq!(recv_close(&mut ws).await.map(|(code, _)| code), Some(1008));
    assert_eq!(server.hub().callers().count(), 0);
    server.shutdown().await;
}

#[tokio::test]
async fn authorized_caller_and_endpoint_connect() {
    let server = boot(Some("s3cret")).await;
    let endpoint = endpoint(server.port(), Some("s3cret"));
    let _ = endpoint.apply_membership(&[Candidate::new("gm-1", PRIMARY_TIER, true)]);
    let hub = Arc::clone(server.hub());
    wait_until(|| hub.endpoint_connected()).await;

    let mut ws = caller(server.port(), Some("s3cret")).await;
    let welcome = recv_kind(&mut ws, "welcome").await;
    assert_eq!(welcome["authRequired"], true);
    assert_eq!(welcome["connected"], true);
    server.shutdown().await;
}

#[tokio::test]
async fn endpoint_with_bad_token_is_rejected() {
    let server = boot(Some("s3cret")).await;
    let endpoint = endpoint(server.port(), Some("guess"));
    let _ = endpoint.apply_membership(&[Candidate::new("gm-1", PRIMARY_TIER, true)]);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!server.hub().endpoint_connected());
    assert!(!endpoint.connection().is_connected());
    server.shutdown().await;
}

#[tokio::test]
async fn endpoint_loss_is_announced_and_fails_pending() {
    let (server, endpoint) = boot_with_endpoint().await;
    endpoint.register(
        "slow",
        HandlerFn::new(|_req: Envelope, _ctx: SendContext| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<(), HandlerError>(())
        }),
    );
    let mut ws = caller(server.port(), None).await;
    let _ = recv_kind(&mut ws, "welcome").await;

    send(&mut ws, json!({"kind": "slow", "requestId": "r1"})).await;
    let hub = Arc::clone(server.hub());
    wait_until(|| hub.pending_requests() == 1).await;

    endpoint.shutdown();
    let mut seen_error = false;
    let mut seen_notice = false;
    while !(seen_error && seen_notice) {
        let msg = recv_json(&mut ws).await;
        match msg["kind"].as_str() {
            Some("error") => {
                assert_eq!(msg["requestId"], "r1");
                assert_eq!(msg["error"], "Connection to endpoint lost");
                seen_error = true;
            }
            Some("connection-lost") => seen_notice = true,
            _ => {}
        }
    }
    assert_eq!(server.hub().pending_requests(), 0);

    let health = reqwest::get(format!("http://127.0.0.1:{}/health", server.port()))
        .await
        .unwrap();
    assert_eq!(health.status(), 503);
    server.shutdown().await;
}

#[tokio::test]
async fn caller_disconnect_drops_its_requests() {
    let (server, endpoint) = boot_with_endpoint().await;
    endpoint.register(
        "slow",
        HandlerFn::new(|_req: Envelope, _ctx: SendContext| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<(), HandlerError>(())
        }),
    );
    let mut ws = caller(server.port(), None).await;
    let _ = recv_kind(&mut ws, "welcome").await;
    send(&mut ws, json!({"kind": "slow", "requestId": "r1"})).await;

    let hub = Arc::clone(server.hub());
    wait_until(|| hub.pending_requests() == 1).await;
    ws.close(None).await.unwrap();
    wait_until(|| hub.pending_requests() == 0 && hub.callers().count() == 0).await;
    server.shutdown().await;
}

#[tokio::test]
async fn health_reports_live_counters() {
    let (server, _endpoint) = boot_with_endpoint().await;
    let _ws = caller(server.port(), None).await;
    let hub = Arc::clone(server.hub());
    wait_until(|| hub.callers().count() == 1).await;

    let resp = reqwest::get(format!("http://127.0.0.1:{}/health", server.port()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["endpointConnected"], true);
    assert_eq!(body["callers"], 1);
    assert_eq!(body["pendingRequests"], 0);
    server.shutdown().await;
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let server = boot(None).await;
    let mut ws = caller(server.port(), None).await;
    let _ = recv_kind(&mut ws, "welcome").await;
    send(&mut ws, json!({"kind": "ping"})).await;
    let pong = recv_kind(&mut ws, "pong").await;
    assert!(pong["timestamp"].is_i64());
    server.shutdown().await;
}
