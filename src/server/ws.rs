//! WebSocket consumer transport.
//!
//! Each connection becomes one [`SubscriberHandle`]. A writer task turns
//! pushed messages into JSON text frames; the read loop turns inbound
//! frames into registry calls. When the socket ends the writer is aborted,
//! which drops the handle's receiver and lets every subscribed queue run
//! its disconnect handling.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use opentelemetry::KeyValue;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{JobId, Outbound};
use crate::registry::Registry;
use crate::subscriber::SubscriberHandle;
use crate::telemetry::metrics::{self, queue_label};

/// Query parameters on `GET /ws`.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Delivery credit for every subscription on this connection.
    pub capacity: Option<u32>,
}

/// A frame sent by a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Subscribe {
        queue: String,
        #[serde(default)]
        capacity: Option<u32>,
    },
    /// `job_id` is kept raw so an unparsable id is reported like any other
    /// unknown id instead of failing the whole frame.
    Ack {
        queue: String,
        #[serde(rename = "jobId")]
        job_id: String,
    },
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// `GET /ws`
pub async fn upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(registry): State<Arc<Registry>>,
) -> Response {
    ws.on_upgrade(move |socket| run_connection(socket, registry, params))
}

async fn run_connection(socket: WebSocket, registry: Arc<Registry>, params: ConnectParams) {
    let (handle, outbound) = SubscriberHandle::channel();
    let handle = handle.with_capacity(params.capacity.unwrap_or(0));
    let id = handle.id();
    info!(subscriber = %id, capacity = ?handle.capacity(), "consumer connected");

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_outbound(sink, outbound));

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_frame(&registry, &handle, text.as_str()),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => handle_frame(&registry, &handle, text),
                Err(_) => warn!(subscriber = %id, "ignoring non-utf8 binary frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(subscriber = %id, error = %e, "websocket read error");
                break;
            }
        }
    }

    writer.abort();
    info!(subscriber = %id, "consumer disconnected");
}

async fn write_outbound(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(message) = outbound.recv().await {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode outbound message");
                continue;
            }
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
}

/// Turn one inbound frame into a registry call. Malformed frames are
/// logged and counted as protocol errors; the connection stays open.
pub fn handle_frame(registry: &Registry, handle: &SubscriberHandle, text: &str) {
    match Inbound::parse(text) {
        Ok(Inbound::Subscribe { queue, capacity }) => {
            // A non-positive per-subscribe capacity keeps the connection's.
            let handle = match capacity {
                Some(capacity) if capacity > 0 => handle.clone().with_capacity(capacity),
                _ => handle.clone(),
            };
            debug!(subscriber = %handle.id(), queue = %queue, "subscribe");
            registry.subscribe(&queue, handle);
        }
        Ok(Inbound::Ack { queue, job_id }) => match job_id.parse::<JobId>() {
            Ok(job_id) => registry.ack(&queue, job_id, handle),
            Err(e) => {
                warn!(subscriber = %handle.id(), queue = %queue, job_id = %job_id, error = %e, "protocol error: unparsable job id");
                metrics::protocol_errors().add(
                    1,
                    &[queue_label(&queue), KeyValue::new("kind", "invalid_job_id")],
                );
            }
        },
        Err(e) => {
            warn!(subscriber = %handle.id(), error = %e, "invalid websocket message");
            metrics::protocol_errors().add(1, &[KeyValue::new("kind", "malformed_frame")]);
        }
    }
}
