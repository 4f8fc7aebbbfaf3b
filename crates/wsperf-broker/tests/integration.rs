//! End-to-end tests over real sockets: workers and observers are plain
//! WebSocket clients talking to a broker bound on ephemeral ports.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use wsperf_broker::{start, BrokerConfig, BrokerHandle};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn boot_broker() -> BrokerHandle {
    let config = BrokerConfig {
        host: "127.0.0.1".into(),
        worker_port: 0,
        observer_port: 0,
        ..BrokerConfig::default()
    };
    start(&config, None).await.unwrap()
}

async fn connect_worker(addr: SocketAddr) -> WsStream {
    let mut request = format!("ws://{addr}/").into_client_request().unwrap();
    let _ = request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("wsperf"));
    let (ws, resp) = connect_async(request).await.unwrap();
    let selected = resp
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|v| v.to_str().ok());
    assert_eq!(selected, Some("wsperf"));
    ws
}

/// Connect an observer and consume its `connection.established` frame.
async fn connect_observer(addr: SocketAddr) -> WsStream {
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let hello = read_json(&mut ws).await;
    assert_eq!(hello["type"], "connection.established");
    ws
}

async fn welcome(ws: &mut WsStream, ident: &str) {
    let msg = json!({"type": "test_welcome", "version": "0.9.1", "ident": ident});
    ws.send(Message::text(msg.to_string())).await.unwrap();
}

async fn read_message(ws: &mut WsStream) -> Message {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        match msg {
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return other,
        }
    }
}

async fn read_text(ws: &mut WsStream) -> String {
    match read_message(ws).await {
        Message::Text(text) => text.to_string(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

async fn read_json(ws: &mut WsStream) -> Value {
    serde_json::from_str(&read_text(ws).await).unwrap()
}

/// Read observer frames until one matches `pred`.
async fn read_until(ws: &mut WsStream, pred: impl Fn(&Value) -> bool) -> Value {
    loop {
        let msg = read_json(ws).await;
        if pred(&msg) {
            return msg;
        }
    }
}

async fn read_event(ws: &mut WsStream, name: &str) -> Value {
    let topic = format!("http://wsperf.org/event#{name}");
    read_until(ws, |m| m["type"] == "event" && m["topic"] == topic.as_str()).await
}

async fn rpc_call(ws: &mut WsStream, id: u64, method: &str, params: Value) -> Value {
    let req = json!({"id": id, "method": method, "params": params});
    ws.send(Message::text(req.to_string())).await.unwrap();
    read_until(ws, |m| m.get("id") == Some(&json!(id)) && m.get("success").is_some()).await
}

async fn expect_close(ws: &mut WsStream, code: u16) {
    match read_message(ws).await {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), code),
        other => panic!("expected close frame, got {other:?}"),
    }
}

fn case() -> Value {
    json!({
        "uri": "ws://127.0.0.1:9000",
        "size": 1024,
        "count": 10,
        "quantile_count": 5,
        "timeout": 5000,
        "binary": true,
        "sync": false,
        "rtts": true,
        "correctness": "strict"
    })
}

#[tokio::test]
async fn worker_without_subprotocol_is_rejected() {
    let broker = boot_broker().await;

    let err = connect_async(format!("ws://{}/", broker.worker_addr))
        .await
        .unwrap_err();
    match err {
        WsError::Http(resp) => assert_eq!(resp.status(), 400),
        other => panic!("expected HTTP rejection, got {other:?}"),
    }

    let resp = reqwest::Client::new()
        .get(format!("http://{}/", broker.worker_addr))
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(
        resp.text().await.unwrap(),
        "You need to speak wsperf subprotocol with this server!"
    );
    assert_eq!(broker.registry.count(), 0);

    broker.shutdown().await;
}

#[tokio::test]
async fn run_lifecycle_end_to_end() {
    let broker = boot_broker().await;
    let mut observer = connect_observer(broker.observer_addr).await;

    // W1 joins
    let mut w1 = connect_worker(broker.worker_addr).await;
    welcome(&mut w1, "worker-one").await;
    let connected = read_event(&mut observer, "slaveConnected").await;
    assert_eq!(connected["data"]["ident"], "worker-one");
    assert_eq!(connected["data"]["version"], "0.9.1");
    assert_eq!(connected["data"]["host"], "127.0.0.1");
    let w1_id = connected["data"]["id"].as_str().unwrap().to_string();

    let listing = rpc_call(&mut observer, 1, "getSlaves", json!({})).await;
    assert_eq!(listing["success"], true);
    let workers = listing["result"].as_array().unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0]["id"], w1_id.as_str());

    // W2 joins
    let mut w2 = connect_worker(broker.worker_addr).await;
    welcome(&mut w2, "worker-two").await;
    let connected = read_event(&mut observer, "slaveConnected").await;
    assert_eq!(connected["data"]["ident"], "worker-two");

    // run reaches both workers with the same token
    let run = rpc_call(&mut observer, 2, "runCase", case()).await;
    assert_eq!(run["success"], true);
    let run_id = run["result"].as_str().unwrap().to_string();
    let expected = format!(
        "message_test:uri=ws://127.0.0.1:9000;token={run_id};size=1024;count=10;quantile_count=5;timeout=5000;binary=true;sync=false;rtts=false;correctness=strict;"
    );
    assert_eq!(read_text(&mut w1).await, expected);
    assert_eq!(read_text(&mut w2).await, expected);

    // results are attributed to the sending worker and the run
    let data = json!({"latency": [1.5, 2.25], "sent": 10});
    let msg = json!({"type": "test_data", "token": run_id, "data": data});
    w1.send(Message::text(msg.to_string())).await.unwrap();
    let result = read_event(&mut observer, "caseResult").await;
    assert_eq!(result["data"]["slaveId"], w1_id.as_str());
    assert_eq!(result["data"]["runId"], run_id.as_str());
    assert_eq!(result["data"]["result"], data);

    let msg = json!({"type": "test_complete", "token": run_id});
    w1.send(Message::text(msg.to_string())).await.unwrap();
    let complete = read_event(&mut observer, "caseComplete").await;
    assert_eq!(complete["data"]["slaveId"], w1_id.as_str());

    // W1 leaves
    w1.close(None).await.unwrap();
    let gone = read_event(&mut observer, "slaveDisconnected").await;
    assert_eq!(gone["data"]["id"], w1_id.as_str());

    // the next run only reaches W2
    let run = rpc_call(
        &mut observer,
        3,
        "http://wsperf.org/api#runCase",
        json!([case()]),
    )
    .await;
    let second_run = run["result"].as_str().unwrap().to_string();
    assert_ne!(second_run, run_id);
    let command = read_text(&mut w2).await;
    assert!(command.contains(&format!(";token={second_run};")));
    assert_eq!(broker.registry.count(), 1);

    let health: Value = reqwest::get(format!("http://{}/health", broker.observer_addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health, json!({"status": "healthy", "workers": 1, "observers": 1}));

    broker.shutdown().await;
}

#[tokio::test]
async fn duplicate_welcome_closes_with_protocol_error() {
    let broker = boot_broker().await;
    let mut observer = connect_observer(broker.observer_addr).await;

    let mut worker = connect_worker(broker.worker_addr).await;
    welcome(&mut worker, "twice").await;
    let connected = read_event(&mut observer, "slaveConnected").await;
    let worker_id = connected["data"]["id"].clone();

    welcome(&mut worker, "twice").await;
    expect_close(&mut worker, 3000).await;

    let gone = read_event(&mut observer, "slaveDisconnected").await;
    assert_eq!(gone["data"]["id"], worker_id);
    assert_eq!(broker.registry.count(), 0);
    assert!(broker.registry.is_consistent());

    broker.shutdown().await;
}

#[tokio::test]
async fn binary_frame_closes_with_protocol_error() {
    let broker = boot_broker().await;

    let mut worker = connect_worker(broker.worker_addr).await;
    worker.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    expect_close(&mut worker, 3000).await;
    assert_eq!(broker.registry.count(), 0);

    broker.shutdown().await;
}

#[tokio::test]
async fn unknown_message_type_closes_with_protocol_error() {
    let broker = boot_broker().await;

    let mut worker = connect_worker(broker.worker_addr).await;
    welcome(&mut worker, "w").await;
    worker
        .send(Message::text(r#"{"type": "test_bogus"}"#))
        .await
        .unwrap();
    expect_close(&mut worker, 3000).await;

    broker.shutdown().await;
}

#[tokio::test]
async fn shutdown_announces_going_away() {
    let broker = boot_broker().await;
    let mut observer = connect_observer(broker.observer_addr).await;
    let mut worker = connect_worker(broker.worker_addr).await;
    welcome(&mut worker, "w").await;
    let connected = read_event(&mut observer, "slaveConnected").await;
    let worker_id = connected["data"]["id"].clone();

    let stopping = tokio::spawn(broker.shutdown());

    // the observer hears about the worker before its own socket closes
    let gone = read_event(&mut observer, "slaveDisconnected").await;
    assert_eq!(gone["data"]["id"], worker_id);
    expect_close(&mut observer, 1001).await;

    expect_close(&mut worker, 1001).await;
    drop(worker);
    drop(observer);
    stopping.await.unwrap();
}
