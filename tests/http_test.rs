//! End-to-end tests: HTTP ingestion and WebSocket consumers on a live listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use jobq::registry::Registry;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_broker() -> (SocketAddr, Arc<Registry>) {
    let registry = Arc::new(Registry::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let served = Arc::clone(&registry);
    tokio::spawn(async move {
        jobq::server::serve(listener, served, std::future::pending())
            .await
            .unwrap();
    });
    (addr, registry)
}

async fn post(addr: SocketAddr, path: &str, body: String) -> (u16, String) {
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}{path}"))
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.text().await.unwrap())
}

async fn connect(addr: SocketAddr, query: &str) -> Socket {
    let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws{query}"))
        .await
        .unwrap();
    socket
}

async fn send(socket: &mut Socket, frame: Value) {
    socket
        .send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();
}

/// Next JSON text frame, or `None` if nothing arrives in time.
async fn next_json(socket: &mut Socket, wait: Duration) -> Option<Value> {
    tokio::time::timeout(wait, async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<Value>(text.as_str()).ok();
                }
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

// ---------------------------------------------------------------------------
// HTTP ingestion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn enqueue_requires_queue_and_job() {
    let (addr, _registry) = start_broker().await;

    let (status, text) = post(addr, "/enqueue", json!({"queue": "orders"}).to_string()).await;
    assert_eq!(status, 400);
    assert_eq!(text, "Missing queue or job");

    let (status, _) = post(addr, "/enqueue", String::new()).await;
    assert_eq!(status, 400);

    let (status, text) = post(addr, "/enqueue", "{not json".to_string()).await;
    assert_eq!(status, 400);
    assert_eq!(text, "Invalid JSON");

    let (status, text) = post(
        addr,
        "/enqueue",
        json!({"queue": "orders", "job": {"orderId": "A"}}).to_string(),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(text, "Enqueued");
}

#[tokio::test]
async fn enqueue_accepts_a_list_of_jobs() {
    let (addr, registry) = start_broker().await;

    let (status, _) = post(
        addr,
        "/enqueue",
        json!({"queue": "bulk", "job": [{"n": 1}, {"n": 2}, {"n": 3}]}).to_string(),
    )
    .await;
    assert_eq!(status, 200);

    let queue = registry.get("bulk").unwrap();
    queue.settle().await.unwrap();
    assert_eq!(queue.stats().await.unwrap().pending, 3);
}

#[tokio::test]
async fn config_sets_capacity_and_fields() {
    let (addr, _registry) = start_broker().await;

    let (status, text) = post(addr, "/config", json!({"capacity": 2}).to_string()).await;
    assert_eq!(status, 400);
    assert_eq!(text, "Missing queue");

    let (status, text) = post(
        addr,
        "/config",
        json!({"queue": "orders", "prefetch": 2, "index": ["orderId"], "colour": "blue"})
            .to_string(),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(text, "Configured");

    let stats: Value = reqwest::get(format!("http://{addr}/queues/orders"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["mode"], "task");
    assert_eq!(stats["capacity_default"], 2);
    assert_eq!(stats["dedup_key_fields"], json!(["orderId"]));

    let names: Vec<String> = reqwest::get(format!("http://{addr}/queues"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(names, vec!["orders".to_string()]);
}

#[tokio::test]
async fn unknown_routes_are_not_found() {
    let (addr, _registry) = start_broker().await;

    let resp = reqwest::get(format!("http://{addr}/nope")).await.unwrap();
    assert_eq!(resp.status().as_u16(), 404);
    assert_eq!(resp.text().await.unwrap(), "Not found");

    let resp = reqwest::get(format!("http://{addr}/queues/missing"))
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}

// ---------------------------------------------------------------------------
// WebSocket consumers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn orders_scenario_over_the_wire() {
    let (addr, _registry) = start_broker().await;
    let (status, _) = post(
        addr,
        "/config",
        json!({"queue": "orders", "capacity": 1, "dedupKeyFields": ["orderId"]}).to_string(),
    )
    .await;
    assert_eq!(status, 200);

    let mut socket = connect(addr, "").await;
    send(&mut socket, json!({"type": "subscribe", "queue": "orders"})).await;

    for amt in [1, 2] {
        let (status, _) = post(
            addr,
            "/enqueue",
            json!({"queue": "orders", "job": {"orderId": "A", "amt": amt}}).to_string(),
        )
        .await;
        assert_eq!(status, 200);
    }

    let first = next_json(&mut socket, Duration::from_secs(5)).await.unwrap();
    assert_eq!(first["type"], "job");
    assert_eq!(first["data"].as_array().unwrap().len(), 1);
    assert_eq!(first["data"][0]["data"], json!({"orderId": "A", "amt": 1}));
    let first_id = first["data"][0]["jobId"].as_str().unwrap().to_string();

    // Key "A" is held: the second job waits.
    assert!(next_json(&mut socket, Duration::from_millis(200)).await.is_none());

    send(
        &mut socket,
        json!({"type": "ack", "queue": "orders", "jobId": first_id}),
    )
    .await;

    let second = next_json(&mut socket, Duration::from_secs(5)).await.unwrap();
    assert_eq!(second["data"][0]["data"], json!({"orderId": "A", "amt": 2}));
    assert_ne!(second["data"][0]["jobId"].as_str().unwrap(), first_id);
}

#[tokio::test]
async fn malformed_frames_do_not_close_the_connection() {
    let (addr, _registry) = start_broker().await;
    let mut socket = connect(addr, "?capacity=2").await;

    socket
        .send(Message::Text("definitely not json".to_string().into()))
        .await
        .unwrap();
    send(&mut socket, json!({"type": "ack", "queue": "jobs", "jobId": "nope"})).await;
    send(&mut socket, json!({"type": "subscribe", "queue": "jobs"})).await;

    post(
        addr,
        "/enqueue",
        json!({"queue": "jobs", "job": [{"n": 1}, {"n": 2}]}).to_string(),
    )
    .await;

    // Both jobs fit the connection's credit of 2.
    let mut received = 0;
    while received < 2 {
        let message = next_json(&mut socket, Duration::from_secs(5)).await.unwrap();
        received += message["data"].as_array().unwrap().len();
    }
    assert_eq!(received, 2);
}

#[tokio::test]
async fn fanout_reaches_all_connected_consumers() {
    let (addr, registry) = start_broker().await;
    post(
        addr,
        "/config",
        json!({"queue": "prices", "fanout": true}).to_string(),
    )
    .await;

    let mut a = connect(addr, "").await;
    let mut b = connect(addr, "").await;
    send(&mut a, json!({"type": "subscribe", "queue": "prices"})).await;
    send(&mut b, json!({"type": "subscribe", "queue": "prices"})).await;

    // Fanout keeps no backlog, so wait for both subscriptions to land.
    let queue = registry.get("prices").unwrap();
    for _ in 0..100 {
        if queue.stats().await.unwrap().subscribers.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    post(
        addr,
        "/enqueue",
        json!({"queue": "prices", "job": {"px": 10}}).to_string(),
    )
    .await;

    for socket in [&mut a, &mut b] {
        let message = next_json(socket, Duration::from_secs(5)).await.unwrap();
        assert_eq!(message["type"], "job");
        assert!(message["jobId"].is_string());
        assert_eq!(message["data"], json!({"px": 10}));
    }
}

#[tokio::test]
async fn closing_the_socket_removes_the_subscriber() {
    let (addr, registry) = start_broker().await;
    let mut socket = connect(addr, "").await;
    send(&mut socket, json!({"type": "subscribe", "queue": "jobs"})).await;

    let mut queue = None;
    for _ in 0..100 {
        if let Some(q) = registry.get("jobs") {
            if q.stats().await.unwrap().subscribers.len() == 1 {
                queue = Some(q);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let queue = queue.expect("subscription never landed");

    socket.close(None).await.unwrap();
    drop(socket);

    let mut remaining = queue.stats().await.unwrap().subscribers.len();
    for _ in 0..100 {
        if remaining == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        remaining = queue.stats().await.unwrap().subscribers.len();
    }
    assert_eq!(remaining, 0);
}
