//! Dispatch state machine for one queue.
//!
//! `QueueState` owns pending jobs, per-subscriber in-flight sets, the dedup
//! lock set and the round-robin cursor. It is plain synchronous code: the
//! queue worker decides *when* a dispatch pass runs, this module decides
//! *what* the pass does.
//!
//! Invariants between passes:
//! - at most one in-flight job per non-empty dedup key,
//! - every subscriber holds at most `capacity` jobs in flight,
//! - a task job is either pending or in flight to exactly one subscriber.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{Delivery, Job, JobId, Outbound, QueueMode, QueueOptions};
use crate::subscriber::{SubscriberHandle, SubscriberId};

/// A subscriber together with the jobs it has not acked yet.
#[derive(Debug)]
struct Subscriber {
    handle: SubscriberHandle,
    active: HashMap<JobId, Job>,
}

impl Subscriber {
    fn capacity(&self, default: u32) -> usize {
        self.handle.capacity().unwrap_or(default) as usize
    }

    fn available(&self, default: u32) -> usize {
        self.capacity(default).saturating_sub(self.active.len())
    }
}

/// What an enqueue did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Task mode: buffered, waiting for a dispatch pass.
    Pending(JobId),
    /// Fanout mode: pushed immediately, never buffered.
    Broadcast {
        job_id: JobId,
        delivered: usize,
        failed: usize,
    },
}

impl Enqueued {
    pub fn job_id(&self) -> JobId {
        match self {
            Enqueued::Pending(id) => *id,
            Enqueued::Broadcast { job_id, .. } => *job_id,
        }
    }
}

/// Summary of one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Subscribers looked at, starting from the cursor.
    pub visited: usize,
    /// Jobs moved from pending to in flight.
    pub delivered: usize,
    /// Jobs whose push failed; their locks were released and they are gone.
    pub lost: usize,
}

/// What a disconnect left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectReport {
    /// In-flight jobs discarded with the subscriber.
    pub dropped: usize,
    /// Dedup locks those jobs held, which stay held.
    pub orphaned_locks: usize,
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub mode: QueueMode,
    pub capacity_default: u32,
    pub dedup_key_fields: Vec<String>,
    pub pending: usize,
    pub in_flight: usize,
    pub locks: usize,
    pub dispatch_cursor: usize,
    pub oldest_pending_age_ms: Option<i64>,
    pub subscribers: Vec<SubscriberStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriberStats {
    pub id: SubscriberId,
    pub capacity: u32,
    pub in_flight: usize,
}

/// State of one named queue.
#[derive(Debug)]
pub struct QueueState {
    name: String,
    mode: QueueMode,
    capacity_default: u32,
    dedup_key_fields: Vec<String>,
    pending: VecDeque<Job>,
    subscribers: Vec<Subscriber>,
    cursor: usize,
    locks: HashSet<String>,
}

impl QueueState {
    pub fn new(name: impl Into<String>, mode: QueueMode, capacity_default: u32) -> Self {
        Self {
            name: name.into(),
            mode,
            capacity_default: capacity_default.max(1),
            dedup_key_fields: Vec::new(),
            pending: VecDeque::new(),
            subscribers: Vec::new(),
            cursor: 0,
            locks: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    /// Apply capacity and dedup fields. The mode never changes here.
    pub fn configure(&mut self, options: &QueueOptions) {
        if let Some(capacity) = options.capacity {
            self.capacity_default = capacity.max(1);
        }
        if let Some(ref fields) = options.dedup_key_fields {
            self.dedup_key_fields = fields.clone();
        }
    }

    // -----------------------------------------------------------------------
    // Producer side
    // -----------------------------------------------------------------------

    /// Accept a job. Task jobs are buffered for the next dispatch pass;
    /// fanout jobs are delivered right now or not at all.
    pub fn enqueue(&mut self, payload: Value) -> Enqueued {
        match self.mode {
            QueueMode::Task => {
                let job = Job::new(payload, &self.dedup_key_fields);
                let id = job.id;
                self.pending.push_back(job);
                Enqueued::Pending(id)
            }
            QueueMode::Fanout => self.broadcast(payload),
        }
    }

    fn broadcast(&mut self, payload: Value) -> Enqueued {
        let job = Job::new(payload, &[]);
        let mut delivered = 0;
        let mut failed = 0;

        for sub in &mut self.subscribers {
            if sub.available(self.capacity_default) == 0 {
                continue;
            }
            match sub
                .handle
                .push(Outbound::single(job.id, job.payload.clone()))
            {
                Ok(()) => {
                    sub.active.insert(job.id, job.clone());
                    delivered += 1;
                }
                Err(e) => {
                    warn!(queue = %self.name, job_id = %job.id, error = %e, "fanout push failed");
                    failed += 1;
                }
            }
        }

        Enqueued::Broadcast {
            job_id: job.id,
            delivered,
            failed,
        }
    }

    // -----------------------------------------------------------------------
    // Consumer side
    // -----------------------------------------------------------------------

    /// Add a subscriber. Returns false if this connection is already subscribed.
    pub fn subscribe(&mut self, handle: SubscriberHandle) -> bool {
        if self.position(handle.id()).is_some() {
            return false;
        }
        self.subscribers.push(Subscriber {
            handle,
            active: HashMap::new(),
        });
        true
    }

    /// Complete an in-flight job. Only the subscriber holding the job may ack it.
    pub fn ack(&mut self, job_id: JobId, subscriber: SubscriberId) -> Result<Job> {
        let job = self
            .position(subscriber)
            .and_then(|idx| self.subscribers[idx].active.remove(&job_id))
            .ok_or_else(|| Error::UnknownJob {
                queue: self.name.clone(),
                job_id,
                subscriber,
            })?;

        if self.mode == QueueMode::Task && job.has_dedup_key() {
            self.locks.remove(&job.dedup_key);
        }
        Ok(job)
    }

    /// Forget a subscriber and everything in flight to it.
    ///
    /// Locks held by its in-flight jobs are not released and the jobs are not
    /// requeued; the report says how many keys were left locked.
    pub fn disconnect(&mut self, subscriber: SubscriberId) -> Option<DisconnectReport> {
        let idx = self.position(subscriber)?;
        let sub = self.subscribers.remove(idx);

        if idx < self.cursor {
            self.cursor -= 1;
        }
        if self.subscribers.is_empty() {
            self.cursor = 0;
        } else {
            self.cursor %= self.subscribers.len();
        }

        let orphaned_locks = match self.mode {
            QueueMode::Task => sub.active.values().filter(|j| j.has_dedup_key()).count(),
            QueueMode::Fanout => 0,
        };
        Some(DisconnectReport {
            dropped: sub.active.len(),
            orphaned_locks,
        })
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Run one dispatch pass: match pending jobs to subscriber credit.
    ///
    /// Subscribers are visited round-robin from the persistent cursor. Each
    /// receives up to its free credit in one batched message. Jobs whose key
    /// is locked are set aside in their original order so later jobs can
    /// still go out; the scan continues past the first `available` jobs
    /// rather than stopping at the front of the queue. A push to a closed
    /// handle loses its batch and releases the batch's keys. No-op in fanout
    /// mode.
    pub fn dispatch(&mut self) -> PassReport {
        let mut report = PassReport::default();
        if self.mode == QueueMode::Fanout || self.subscribers.is_empty() {
            return report;
        }

        let count = self.subscribers.len();
        let start = self.cursor % count;
        let mut last_served = None;

        for step in 0..count {
            if self.pending.is_empty() {
                break;
            }
            let idx = (start + step) % count;
            report.visited += 1;

            let available = self.subscribers[idx].available(self.capacity_default);
            if available == 0 {
                continue;
            }

            let batch = self.take_eligible(available);
            if batch.is_empty() {
                continue;
            }

            let size = batch.len();
            match self.deliver(idx, batch) {
                Ok(()) => {
                    report.delivered += size;
                    last_served = Some(idx);
                }
                Err(e) => {
                    warn!(queue = %self.name, jobs = size, error = %e, "dispatch push failed, jobs lost");
                    report.lost += size;
                }
            }
        }

        if let Some(idx) = last_served {
            self.cursor = (idx + 1) % count;
        }

        debug!(
            queue = %self.name,
            visited = report.visited,
            delivered = report.delivered,
            lost = report.lost,
            pending = self.pending.len(),
            "dispatch pass"
        );
        report
    }

    /// Pull up to `limit` jobs whose keys are free, locking them. Locked jobs
    /// stay pending, ahead of the unscanned remainder.
    fn take_eligible(&mut self, limit: usize) -> Vec<Job> {
        let mut taken = Vec::with_capacity(limit.min(self.pending.len()));
        let mut set_aside = Vec::new();

        while taken.len() < limit {
            let Some(job) = self.pending.pop_front() else {
                break;
            };
            if job.has_dedup_key() {
                if self.locks.contains(&job.dedup_key) {
                    set_aside.push(job);
                    continue;
                }
                self.locks.insert(job.dedup_key.clone());
            }
            taken.push(job);
        }

        for job in set_aside.into_iter().rev() {
            self.pending.push_front(job);
        }
        taken
    }

    /// Push a batch to one subscriber. On failure the batch's locks are
    /// released and the jobs dropped.
    fn deliver(&mut self, idx: usize, batch: Vec<Job>) -> Result<()> {
        let message = Outbound::batch(
            batch
                .iter()
                .map(|job| Delivery {
                    job_id: job.id,
                    data: job.payload.clone(),
                })
                .collect(),
        );

        let sub = &mut self.subscribers[idx];
        match sub.handle.push(message) {
            Ok(()) => {
                sub.active.extend(batch.into_iter().map(|job| (job.id, job)));
                Ok(())
            }
            Err(e) => {
                for job in batch.iter().filter(|j| j.has_dedup_key()) {
                    self.locks.remove(&job.dedup_key);
                }
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    fn position(&self, subscriber: SubscriberId) -> Option<usize> {
        self.subscribers
            .iter()
            .position(|s| s.handle.id() == subscriber)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Pending job ids, front first.
    pub fn pending_ids(&self) -> Vec<JobId> {
        self.pending.iter().map(|j| j.id).collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Ids in flight to a subscriber, or `None` if it is not subscribed.
    pub fn in_flight(&self, subscriber: SubscriberId) -> Option<Vec<JobId>> {
        self.position(subscriber)
            .map(|idx| self.subscribers[idx].active.keys().copied().collect())
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.locks.contains(key)
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn stats(&self) -> QueueStats {
        let now = Utc::now();
        QueueStats {
            name: self.name.clone(),
            mode: self.mode,
            capacity_default: self.capacity_default,
            dedup_key_fields: self.dedup_key_fields.clone(),
            pending: self.pending.len(),
            in_flight: self.subscribers.iter().map(|s| s.active.len()).sum(),
            locks: self.locks.len(),
            dispatch_cursor: self.cursor,
            oldest_pending_age_ms: self
                .pending
                .front()
                .map(|job| (now - job.enqueued_at).num_milliseconds()),
            subscribers: self
                .subscribers
                .iter()
                .map(|s| SubscriberStats {
                    id: s.handle.id(),
                    capacity: s.capacity(self.capacity_default) as u32,
                    in_flight: s.active.len(),
                })
                .collect(),
        }
    }
}
