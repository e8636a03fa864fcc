//! Queue registry: the single entry point for producers and consumers.
//!
//! Queues are created lazily by name. The registry is constructed once at
//! startup and shared with the adapters behind an `Arc`.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::presets::QueuePreset;
use crate::error::Error;
use crate::model::{JobId, QueueMode, QueueOptions};
use crate::queue::{Queue, QueueStats};
use crate::subscriber::SubscriberHandle;
use crate::telemetry::metrics::{self, queue_label};

/// One job or several, as submitted by a producer.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    One(Value),
    Many(Vec<Value>),
}

impl Submission {
    pub fn into_jobs(self) -> Vec<Value> {
        match self {
            Submission::One(job) => vec![job],
            Submission::Many(jobs) => jobs,
        }
    }
}

/// A JSON array is a list of jobs; anything else is a single job.
impl From<Value> for Submission {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(jobs) => Submission::Many(jobs),
            job => Submission::One(job),
        }
    }
}

impl From<Vec<Value>> for Submission {
    fn from(jobs: Vec<Value>) -> Self {
        Submission::Many(jobs)
    }
}

/// Registry of running queues, indexed by name.
///
/// Creating a queue spawns its worker, so every method that may create one
/// must run inside a tokio runtime.
#[derive(Debug)]
pub struct Registry {
    queues: Mutex<HashMap<String, Queue>>,
    capacity_default: u32,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// New queues default to one job in flight per subscriber.
    pub fn new() -> Self {
        Self::with_default_capacity(1)
    }

    pub fn with_default_capacity(capacity_default: u32) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            capacity_default: capacity_default.max(1),
        }
    }

    /// Return the queue called `name`, creating it with `mode` if absent.
    /// The mode of an existing queue never changes.
    pub fn get_or_create(&self, name: &str, mode: QueueMode) -> Queue {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(queue) = queues.get(name) {
            if queue.mode() != mode {
                debug!(queue = name, existing = %queue.mode(), requested = %mode, "mode is fixed at creation, ignoring");
            }
            return queue.clone();
        }

        info!(queue = name, %mode, "queue created");
        let queue = Queue::spawn(name, mode, self.capacity_default);
        queues.insert(name.to_string(), queue.clone());
        queue
    }

    /// Look up an existing queue without creating it.
    pub fn get(&self, name: &str) -> Option<Queue> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Names of all queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Create the queue if needed (as fanout when the options say so), then
    /// apply capacity and dedup fields.
    pub fn configure(&self, name: &str, options: QueueOptions) -> Queue {
        let mode = QueueMode::from_fanout(options.fanout.unwrap_or(false));
        let queue = self.get_or_create(name, mode);
        queue.configure(options);
        queue
    }

    pub fn enqueue(&self, name: &str, jobs: impl Into<Submission>) {
        let queue = self.get_or_create(name, QueueMode::Task);
        for job in jobs.into().into_jobs() {
            queue.enqueue(job);
        }
    }

    pub fn subscribe(&self, name: &str, handle: SubscriberHandle) {
        self.get_or_create(name, QueueMode::Task).subscribe(handle);
    }

    /// Route an ack. An ack for a queue that does not exist is a protocol
    /// error and does not create the queue.
    pub fn ack(&self, name: &str, job_id: JobId, handle: &SubscriberHandle) {
        match self.get(name) {
            Some(queue) => queue.ack(job_id, handle),
            None => {
                let e = Error::UnknownQueue(name.to_string());
                warn!(%job_id, subscriber = %handle.id(), error = %e, "protocol error");
                metrics::protocol_errors().add(
                    1,
                    &[
                        queue_label(name),
                        opentelemetry::KeyValue::new("kind", "unknown_queue"),
                    ],
                );
            }
        }
    }

    pub async fn stats(&self, name: &str) -> Option<QueueStats> {
        let queue = self.get(name)?;
        queue.stats().await.ok()
    }

    /// Declare queues up front from startup presets.
    pub fn apply_presets(&self, presets: &[QueuePreset]) {
        for preset in presets {
            self.configure(&preset.name, preset.options());
        }
    }
}
