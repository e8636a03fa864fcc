//! Core data model.
//!
//! A job is an opaque JSON payload submitted to a named queue. The broker
//! never interprets the payload beyond reading the configured dedup fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Separator placed between dedup key segments.
pub const DEDUP_SEPARATOR: &str = "|";

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Newtype for job IDs. Generated at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Full UUID: consumers ack with exactly what they were sent.
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A job accepted by a task queue, pending or in flight.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    /// Producer-defined attributes. Opaque to the broker.
    pub payload: Value,
    /// Derived once at enqueue. Empty means no dedup for this job.
    pub dedup_key: String,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    /// Build a job with a fresh id, deriving its dedup key from `fields`.
    pub fn new(payload: Value, fields: &[String]) -> Self {
        let dedup_key = dedup_key(&payload, fields);
        Self {
            id: JobId::new(),
            payload,
            dedup_key,
            enqueued_at: Utc::now(),
        }
    }

    pub fn has_dedup_key(&self) -> bool {
        !self.dedup_key.is_empty()
    }
}

/// Compute a dedup key by stringifying each named field of the payload.
///
/// A missing field (or a payload that is not an object) contributes an empty
/// segment rather than an error. No fields yields the empty key.
pub fn dedup_key(payload: &Value, fields: &[String]) -> String {
    fields
        .iter()
        .map(|field| match payload.get(field) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(DEDUP_SEPARATOR)
}

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

/// Delivery mode, fixed when the queue is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Work queue: each job goes to exactly one subscriber, acked, dedup-locked.
    #[default]
    Task,
    /// Broadcast to every subscriber with free credit at enqueue time.
    Fanout,
}

impl QueueMode {
    pub fn from_fanout(fanout: bool) -> Self {
        if fanout {
            QueueMode::Fanout
        } else {
            QueueMode::Task
        }
    }
}

impl std::fmt::Display for QueueMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueueMode::Task => "task",
            QueueMode::Fanout => "fanout",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Outbound messages
// ---------------------------------------------------------------------------

/// The `type` tag on every outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Job,
}

/// One delivered job inside a task-mode batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delivery {
    #[serde(rename = "jobId")]
    pub job_id: JobId,
    pub data: Value,
}

/// A message pushed to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    /// Fanout delivery: one message per subscriber per enqueue.
    Single {
        #[serde(rename = "type")]
        kind: MessageKind,
        #[serde(rename = "jobId")]
        job_id: JobId,
        data: Value,
    },
    /// Task delivery: everything one dispatch pass handed to a subscriber.
    Batch {
        #[serde(rename = "type")]
        kind: MessageKind,
        data: Vec<Delivery>,
    },
}

impl Outbound {
    pub fn single(job_id: JobId, data: Value) -> Self {
        Outbound::Single {
            kind: MessageKind::Job,
            job_id,
            data,
        }
    }

    pub fn batch(data: Vec<Delivery>) -> Self {
        Outbound::Batch {
            kind: MessageKind::Job,
            data,
        }
    }

    /// Ids of every job carried by this message, in delivery order.
    pub fn job_ids(&self) -> Vec<JobId> {
        match self {
            Outbound::Single { job_id, .. } => vec![*job_id],
            Outbound::Batch { data, .. } => data.iter().map(|d| d.job_id).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Queue configuration request. Every field is optional; absent fields
/// leave the queue untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub capacity: Option<u32>,
    pub dedup_key_fields: Option<Vec<String>>,
    /// Only honored when the queue is created by this call.
    pub fanout: Option<bool>,
}

impl QueueOptions {
    pub fn capacity(mut self, capacity: u32) -> Self {
        self.capacity = Some(capacity.max(1));
        self
    }

    pub fn dedup_key_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dedup_key_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn fanout(mut self, fanout: bool) -> Self {
        self.fanout = Some(fanout);
        self
    }

    /// Parse options from a JSON object, ignoring anything unrecognized.
    ///
    /// `prefetch` and `index` are accepted as older names for `capacity`
    /// and `dedupKeyFields`.
    pub fn from_value(value: &Value) -> Self {
        let capacity = value
            .get("capacity")
            .or_else(|| value.get("prefetch"))
            .filter(|v| !v.is_null())
            .map(coerce_capacity);

        let dedup_key_fields = ["dedupKeyFields", "dedup_key_fields", "index"]
            .iter()
            .find_map(|key| value.get(*key))
            .and_then(string_list);

        let fanout = value.get("fanout").and_then(Value::as_bool);

        Self {
            capacity,
            dedup_key_fields,
            fanout,
        }
    }
}

/// Coerce a capacity value to a positive integer. Anything invalid
/// (non-numeric, non-positive, non-finite) becomes 1.
pub fn coerce_capacity(value: &Value) -> u32 {
    if let Some(n) = value.as_u64() {
        return n.clamp(1, u32::MAX as u64) as u32;
    }
    match value.as_f64() {
        Some(f) if f.is_finite() && f >= 1.0 => f.trunc().min(u32::MAX as f64) as u32,
        _ => 1,
    }
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}
