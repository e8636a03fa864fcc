//! HTTP ingestion: submit jobs and configure queues.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tracing::debug;

use crate::model::QueueOptions;
use crate::registry::Registry;

type Reply = (StatusCode, &'static str);

/// Parse a request body as JSON. An empty body reads as `{}`.
fn parse_body(body: &[u8]) -> Result<Value, Reply> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_slice(body).map_err(|_| (StatusCode::BAD_REQUEST, "Invalid JSON"))
}

fn queue_name(body: &Value) -> Option<String> {
    body.get("queue")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

/// `POST /enqueue` with `{"queue": .., "job": ..}`. `job` may be an array.
pub async fn enqueue(State(registry): State<Arc<Registry>>, body: Bytes) -> Reply {
    let mut body = match parse_body(&body) {
        Ok(body) => body,
        Err(reply) => return reply,
    };
    let job = body
        .get_mut("job")
        .map(Value::take)
        .filter(|job| !job.is_null());

    let (Some(queue), Some(job)) = (queue_name(&body), job) else {
        return (StatusCode::BAD_REQUEST, "Missing queue or job");
    };

    debug!(queue = %queue, "enqueue request");
    registry.enqueue(&queue, job);
    (StatusCode::OK, "Enqueued")
}

/// `POST /config` with `{"queue": .., "capacity"?, "dedupKeyFields"?, "fanout"?}`.
pub async fn configure(State(registry): State<Arc<Registry>>, body: Bytes) -> Reply {
    let body = match parse_body(&body) {
        Ok(body) => body,
        Err(reply) => return reply,
    };
    let Some(queue) = queue_name(&body) else {
        return (StatusCode::BAD_REQUEST, "Missing queue");
    };

    let options = QueueOptions::from_value(&body);
    debug!(queue = %queue, ?options, "config request");
    registry.configure(&queue, options);
    (StatusCode::OK, "Configured")
}

/// `GET /queues`
pub async fn list_queues(State(registry): State<Arc<Registry>>) -> Json<Vec<String>> {
    Json(registry.queue_names())
}

/// `GET /queues/{name}`
pub async fn queue_stats(
    State(registry): State<Arc<Registry>>,
    Path(name): Path<String>,
) -> Response {
    match registry.stats(&name).await {
        Some(stats) => Json(stats).into_response(),
        None => not_found().await.into_response(),
    }
}

pub async fn not_found() -> Reply {
    (StatusCode::NOT_FOUND, "Not found")
}
