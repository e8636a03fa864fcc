//! Error types for jobq.

use thiserror::Error;

use crate::model::JobId;
use crate::subscriber::SubscriberId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    /// An ack named a job that is not in flight to the acking subscriber.
    #[error("unknown job {job_id} for subscriber {subscriber} on queue {queue}")]
    UnknownJob {
        queue: String,
        job_id: JobId,
        subscriber: SubscriberId,
    },

    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// The subscriber's connection is gone; a push could not be delivered.
    #[error("subscriber {0} is gone")]
    SubscriberGone(SubscriberId),

    #[error("queue worker for {0} has stopped")]
    QueueClosed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
