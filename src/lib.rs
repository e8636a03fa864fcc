//! # jobq
//!
//! In-memory job broker. Producers submit jobs to named queues over HTTP,
//! consumers subscribe over WebSocket and ack what they finish.
//!
//! The dispatch engine lives in [`queue`] (one owning worker per queue) and
//! [`registry`] (lookup and routing). [`server`] holds the thin adapters.

pub mod config;
pub mod error;
pub mod model;
pub mod queue;
pub mod registry;
pub mod server;
pub mod subscriber;
pub mod telemetry;
