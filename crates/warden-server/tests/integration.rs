//! End-to-end tests over real WebSocket connections.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use warden_broker::testing::MemoryServices;
use warden_broker::{BrokerConfig, SessionBroker};
use warden_server::{ServerConfig, WardenServer};
use warden_settings::WardenSettings;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    server: WardenServer,
    services: MemoryServices,
    addr: SocketAddr,
}

impl Harness {
    async fn start() -> Self {
        Self::with_config(ServerConfig {
            port: 0,
            ..ServerConfig::default()
        })
        .await
    }

    async fn with_config(config: ServerConfig) -> Self {
        let services = MemoryServices::new("pw", WardenSettings::default());
        let broker = SessionBroker::new(BrokerConfig::default(), services.services())
            .await
            .unwrap();
        let server = WardenServer::new(config, broker, None);
        let addr = server.listen().await.unwrap();
        Self { server, services, addr }
    }

    async fn connect(&self) -> Client {
        let url = format!("ws://{}/ws", self.addr);
        let (ws, _) = connect_async(url).await.unwrap();
        let mut client = Client { ws };
        let hello = client.next_json().await;
        assert_eq!(hello["type"], "channel.established");
        assert!(hello["data"]["channelId"].is_string());
        client
    }

    async fn health(&self) -> Value {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        let request = format!("GET /health HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", self.addr);
        tokio::io::AsyncWriteExt::write_all(&mut stream, request.as_bytes())
            .await
            .unwrap();
        let mut raw = String::new();
        let _ = tokio::io::AsyncReadExt::read_to_string(&mut stream, &mut raw)
            .await
            .unwrap();
        let body = raw.split("\r\n\r\n").nth(1).unwrap();
        serde_json::from_str(body).unwrap()
    }

    /// Poll `/health` until `check` holds.
    async fn wait_health(&self, check: impl Fn(&Value) -> bool) -> Value {
        tokio::time::timeout(WAIT, async {
            loop {
                let health = self.health().await;
                if check(&health) {
                    return health;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap()
    }
}

struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Client {
    async fn send(&mut self, id: &str, message_type: &str, payload: Value) {
        let frame = json!({"id": id, "type": message_type, "payload": payload}).to_string();
        self.ws.send(Message::Text(frame.into())).await.unwrap();
    }

    async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::Text(text.into())).await.unwrap();
    }

    /// Next JSON text frame, skipping control frames.
    async fn next_json(&mut self) -> Value {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.ws.next().await.unwrap().unwrap() {
                    Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                    Message::Ping(_) | Message::Pong(_) => {}
                    other => panic!("unexpected frame: {other:?}"),
                }
            }
        })
        .await
        .unwrap()
    }

    /// Response with `id`, skipping events.
    async fn response(&mut self, id: &str) -> Value {
        loop {
            let msg = self.next_json().await;
            if msg.get("success").is_some() && msg["id"] == id {
                return msg;
            }
        }
    }

    async fn call(&mut self, id: &str, message_type: &str, payload: Value) -> Value {
        self.send(id, message_type, payload).await;
        self.response(id).await
    }

    async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

#[tokio::test]
async fn ping_round_trip() {
    let harness = Harness::start().await;
    let mut client = harness.connect().await;

    let resp = client.call("1", "ping", Value::Null).await;
    assert_eq!(resp["success"], true);
    assert_eq!(resp["result"]["pong"], true);
    assert!(resp["result"]["timestamp"].is_string());
}

#[tokio::test]
async fn invalid_json_answers_unknown_id() {
    let harness = Harness::start().await;
    let mut client = harness.connect().await;

    client.send_raw("{this is not json").await;
    let resp = client.next_json().await;
    assert_eq!(resp["id"], "unknown");
    assert_eq!(resp["success"], false);
    assert_eq!(resp["error"]["code"], "INVALID_PARAMS");

    // connection stays usable
    let resp = client.call("2", "keyring.state", Value::Null).await;
    assert_eq!(resp["result"]["locked"], false);
}

#[tokio::test]
async fn unsupported_type_is_reported() {
    let harness = Harness::start().await;
    let mut client = harness.connect().await;

    let resp = client.call("x", "wallet.explode", Value::Null).await;
    assert_eq!(resp["success"], false);
    assert_eq!(resp["error"]["code"], "UNSUPPORTED_MESSAGE_TYPE");
}

#[tokio::test]
async fn approval_settled_from_another_socket() {
    let harness = Harness::start().await;
    let mut dapp = harness.connect().await;
    let mut popup = harness.connect().await;

    dapp.send(
        "sign-1",
        "signing.request",
        json!({"id": "req-1", "address": "0xabc", "payload": "0x00"}),
    )
    .await;
    let _ = harness.wait_health(|h| h["pending"] == 1).await;

    // the dapp socket keeps serving while its request waits
    let resp = dapp.call("p", "ping", Value::Null).await;
    assert_eq!(resp["success"], true);

    let summary = popup.call("g", "pending.get", json!({"id": "req-1"})).await;
    assert_eq!(summary["success"], true);

    let ok = popup
        .call("a", "signing.approvePassword", json!({"id": "req-1", "password": "pw"}))
        .await;
    assert_eq!(ok["result"], true);

    let signed = dapp.response("sign-1").await;
    assert_eq!(signed["success"], true);
    assert_eq!(signed["result"]["id"], "req-1");
    assert!(signed["result"]["signature"].as_str().unwrap().starts_with("0x"));
}

#[tokio::test]
async fn pending_request_outlives_its_socket() {
    let harness = Harness::start().await;
    let mut dapp = harness.connect().await;
    let mut popup = harness.connect().await;

    dapp.send("m-1", "metadata.request", json!({"id": "meta-1", "chain": "polkadot"}))
        .await;
    let _ = harness.wait_health(|h| h["pending"] == 1).await;
    dapp.close().await;
    let _ = harness.wait_health(|h| h["channels"] == 1).await;

    let resp = popup.call("r", "metadata.reject", json!({"id": "meta-1"})).await;
    assert_eq!(resp["success"], true);
    let _ = harness.wait_health(|h| h["pending"] == 0).await;
}

#[tokio::test]
async fn closing_a_socket_tears_down_only_its_subscriptions() {
    let harness = Harness::start().await;
    let mut a = harness.connect().await;
    let mut b = harness.connect().await;

    let sub_a = a.call("s", "chain.subscribeState", json!({"chain": "polkadot"})).await;
    let sub_b = b.call("s", "chain.subscribeState", json!({"chain": "polkadot"})).await;
    assert_eq!(sub_a["success"], true);
    let sub_b_id = sub_b["result"]["subscriptionId"].clone();
    let _ = harness.wait_health(|h| h["subscriptions"] == 2).await;

    a.close().await;
    let _ = harness
        .wait_health(|h| h["subscriptions"] == 1 && h["channels"] == 1)
        .await;

    assert!(harness.services.chains.publish("polkadot", json!({"block": 7})));
    let event = b.next_json().await;
    assert_eq!(event["type"], "subscription.event");
    assert_eq!(event["subscriptionId"], sub_b_id);
    assert_eq!(event["data"]["block"], 7);
}

#[tokio::test]
async fn connection_limit_rejects_extra_clients() {
    let harness = Harness::with_config(ServerConfig {
        port: 0,
        max_connections: 1,
        ..ServerConfig::default()
    })
    .await;
    let _first = harness.connect().await;

    let url = format!("ws://{}/ws", harness.addr);
    assert!(connect_async(url).await.is_err());
}

#[tokio::test]
async fn silent_client_is_dropped_after_missed_pings() {
    let harness = Harness::with_config(ServerConfig {
        port: 0,
        ping_interval: Duration::from_millis(200),
        ..ServerConfig::default()
    })
    .await;
    // never polled after the handshake, so no pongs go back
    let _silent = harness.connect().await;
    let _ = harness.wait_health(|h| h["channels"] == 0).await;
}

#[tokio::test]
async fn shutdown_closes_connections() {
    let harness = Harness::start().await;
    let mut client = harness.connect().await;

    harness.server.shutdown_gracefully(WAIT).await;

    let closed = tokio::time::timeout(WAIT, async {
        loop {
            match client.ws.next().await {
                None | Some(Err(_) | Ok(Message::Close(_))) => return true,
                Some(Ok(_)) => {}
            }
        }
    })
    .await
    .unwrap();
    assert!(closed);
    assert_eq!(harness.server.broker().stats().channels, 0);
}
