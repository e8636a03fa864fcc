//! Queue workers.
//!
//! Each queue runs as one tokio task that owns its [`QueueState`]. Every
//! entry point is a command on the task's channel, so mutations never
//! interleave. A mutation that frees credit or adds work only *schedules*
//! a dispatch pass by posting `Dispatch` back to the channel; commands
//! already waiting (a burst of enqueues, say) run first and share that pass.

pub mod state;

pub use state::{DisconnectReport, Enqueued, PassReport, QueueState, QueueStats, SubscriberStats};

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{JobId, QueueMode, QueueOptions};
use crate::subscriber::{SubscriberHandle, SubscriberId};
use crate::telemetry::metrics::{self, queue_label};
use crate::telemetry::queue::{dispatch_span, record_pass, record_subscriber_event};

enum Command {
    Configure(QueueOptions),
    Enqueue(Value),
    Subscribe(SubscriberHandle),
    Ack {
        job_id: JobId,
        subscriber: SubscriberId,
    },
    Disconnect(SubscriberId),
    Dispatch,
    Stats(oneshot::Sender<QueueStats>),
    Settle(oneshot::Sender<()>),
}

/// Handle to a running queue. Cheap to clone; all clones talk to one worker.
#[derive(Debug, Clone)]
pub struct Queue {
    name: Arc<str>,
    mode: QueueMode,
    tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Command::Configure(_) => "configure",
            Command::Enqueue(_) => "enqueue",
            Command::Subscribe(_) => "subscribe",
            Command::Ack { .. } => "ack",
            Command::Disconnect(_) => "disconnect",
            Command::Dispatch => "dispatch",
            Command::Stats(_) => "stats",
            Command::Settle(_) => "settle",
        };
        write!(f, "{s}")
    }
}

impl Queue {
    /// Start a worker for a new queue. Must be called inside a tokio runtime.
    pub fn spawn(name: &str, mode: QueueMode, capacity_default: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            state: QueueState::new(name, mode, capacity_default),
            commands: rx,
            mailbox: tx.downgrade(),
            dispatch_scheduled: false,
        };
        tokio::spawn(worker.run());

        Self {
            name: Arc::from(name),
            mode,
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    pub fn configure(&self, options: QueueOptions) {
        self.send(Command::Configure(options));
    }

    pub fn enqueue(&self, payload: Value) {
        self.send(Command::Enqueue(payload));
    }

    pub fn subscribe(&self, handle: SubscriberHandle) {
        self.send(Command::Subscribe(handle));
    }

    pub fn ack(&self, job_id: JobId, subscriber: &SubscriberHandle) {
        self.send(Command::Ack {
            job_id,
            subscriber: subscriber.id(),
        });
    }

    /// Drop a subscriber now, without waiting for its connection to end.
    pub fn disconnect(&self, subscriber: SubscriberId) {
        self.send(Command::Disconnect(subscriber));
    }

    /// Snapshot of the queue as of every command sent before this call.
    pub async fn stats(&self) -> Result<QueueStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats(reply));
        rx.await.map_err(|_| Error::QueueClosed(self.name.to_string()))
    }

    /// Resolves once every command sent so far has run and no dispatch pass
    /// is scheduled.
    pub async fn settle(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Settle(reply));
        rx.await.map_err(|_| Error::QueueClosed(self.name.to_string()))
    }

    fn send(&self, command: Command) {
        if let Err(e) = self.tx.send(command) {
            warn!(queue = %self.name, command = ?e.0, "queue worker has stopped");
        }
    }
}

struct Worker {
    state: QueueState,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Weak so the worker does not keep its own channel open.
    mailbox: mpsc::WeakUnboundedSender<Command>,
    dispatch_scheduled: bool,
}

impl Worker {
    async fn run(mut self) {
        info!(queue = %self.state.name(), mode = %self.state.mode(), "queue worker started");
        while let Some(command) = self.commands.recv().await {
            self.handle(command);
        }
        debug!(queue = %self.state.name(), "queue worker stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Configure(options) => {
                self.state.configure(&options);
                debug!(queue = %self.state.name(), ?options, "queue configured");
            }
            Command::Enqueue(payload) => self.enqueue(payload),
            Command::Subscribe(handle) => self.subscribe(handle),
            Command::Ack { job_id, subscriber } => self.ack(job_id, subscriber),
            Command::Disconnect(subscriber) => self.disconnect(subscriber),
            Command::Dispatch => self.dispatch(),
            Command::Stats(reply) => {
                let _ = reply.send(self.state.stats());
            }
            Command::Settle(reply) => {
                if self.dispatch_scheduled {
                    // Wait behind the scheduled pass.
                    self.post(Command::Settle(reply));
                } else {
                    let _ = reply.send(());
                }
            }
        }
    }

    fn labels(&self) -> [KeyValue; 2] {
        [
            queue_label(self.state.name()),
            KeyValue::new("mode", self.state.mode().to_string()),
        ]
    }

    fn enqueue(&mut self, payload: Value) {
        let outcome = self.state.enqueue(payload);
        metrics::jobs_enqueued().add(1, &self.labels());

        match outcome {
            Enqueued::Pending(job_id) => {
                debug!(queue = %self.state.name(), %job_id, "job pending");
                self.schedule_dispatch();
            }
            Enqueued::Broadcast {
                job_id,
                delivered,
                failed,
            } => {
                debug!(queue = %self.state.name(), %job_id, delivered, failed, "job broadcast");
                metrics::jobs_delivered().add(delivered as u64, &self.labels());
                if failed > 0 {
                    metrics::delivery_failures()
                        .add(failed as u64, &[queue_label(self.state.name())]);
                }
            }
        }
    }

    fn subscribe(&mut self, handle: SubscriberHandle) {
        let id = handle.id();
        if !self.state.subscribe(handle.clone()) {
            debug!(queue = %self.state.name(), subscriber = %id, "already subscribed");
            return;
        }
        record_subscriber_event(self.state.name(), &id.to_string(), "subscribed");
        self.watch(handle);
        if self.state.mode() == QueueMode::Task {
            self.schedule_dispatch();
        }
    }

    fn ack(&mut self, job_id: JobId, subscriber: SubscriberId) {
        match self.state.ack(job_id, subscriber) {
            Ok(job) => {
                debug!(queue = %self.state.name(), %job_id, %subscriber, dedup_key = %job.dedup_key, "job acked");
                metrics::jobs_acked().add(1, &[queue_label(self.state.name())]);
                if self.state.mode() == QueueMode::Task {
                    self.schedule_dispatch();
                }
            }
            Err(e) => {
                warn!(queue = %self.state.name(), error = %e, "protocol error");
                metrics::protocol_errors().add(
                    1,
                    &[
                        queue_label(self.state.name()),
                        KeyValue::new("kind", "unknown_job"),
                    ],
                );
            }
        }
    }

    fn disconnect(&mut self, subscriber: SubscriberId) {
        let Some(report) = self.state.disconnect(subscriber) else {
            return;
        };
        record_subscriber_event(self.state.name(), &subscriber.to_string(), "disconnected");
        if report.orphaned_locks > 0 {
            warn!(
                queue = %self.state.name(),
                %subscriber,
                dropped = report.dropped,
                orphaned_locks = report.orphaned_locks,
                "subscriber left with jobs in flight; their dedup keys stay locked"
            );
        } else if report.dropped > 0 {
            info!(queue = %self.state.name(), %subscriber, dropped = report.dropped, "in-flight jobs discarded");
        }
    }

    fn dispatch(&mut self) {
        self.dispatch_scheduled = false;

        let span = dispatch_span(self.state.name());
        let _enter = span.enter();
        let started = Instant::now();

        let report = self.state.dispatch();
        record_pass(&span, report.visited, report.delivered, report.lost);

        let queue = [queue_label(self.state.name())];
        metrics::dispatch_duration_ms().record(started.elapsed().as_secs_f64() * 1000.0, &queue);
        metrics::dispatch_passes().add(
            1,
            &[
                queue_label(self.state.name()),
                KeyValue::new(
                    "outcome",
                    if report.delivered > 0 { "delivered" } else { "idle" },
                ),
            ],
        );
        if report.delivered > 0 {
            metrics::jobs_delivered().add(report.delivered as u64, &self.labels());
        }
        if report.lost > 0 {
            metrics::delivery_failures().add(report.lost as u64, &queue);
        }

        // A pass that moved nothing stops here rather than spinning.
        if report.delivered > 0 && self.state.pending_len() > 0 {
            self.schedule_dispatch();
        }
    }

    fn schedule_dispatch(&mut self) {
        if self.dispatch_scheduled {
            return;
        }
        self.dispatch_scheduled = true;
        self.post(Command::Dispatch);
    }

    fn post(&self, command: Command) {
        if let Some(tx) = self.mailbox.upgrade() {
            let _ = tx.send(command);
        }
    }

    /// Post `Disconnect` once the subscriber's connection ends.
    fn watch(&self, handle: SubscriberHandle) {
        let Some(tx) = self.mailbox.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            handle.closed().await;
            let _ = tx.send(Command::Disconnect(handle.id()));
        });
    }
}
