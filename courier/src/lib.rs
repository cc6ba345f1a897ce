//! Courier turns user-declared handlers into a concurrent, back-pressured
//! NATS consumption pipeline.
//!
//! Handlers are registered on a [`ConsumerRegistry`] with a subject pattern
//! and optional consumer identity. Each consumer identity gets one
//! [`subscription::SubscriptionProcessor`] bridging a single NATS
//! subscription (core or JetStream) to its handlers through a bounded work
//! queue and a degree-of-parallelism limiter. The crate also ships a
//! KV-backed distributed lock with lease renewal and CAS-guarded release.
//!
//! Streams, durable consumers and their policies are provisioned out of
//! band; courier only attaches to them.

pub mod client;
pub mod config;
pub mod handler;
pub mod lock;
pub mod metrics;
pub mod payload;
pub mod placeholders;
pub mod queue;
pub mod registry;
pub mod subscription;

pub use client::Client;
pub use config::CoreConfig;
pub use handler::{AckOptions, Handler, Inbound, Outcome};
pub use lock::{DistributedLock, LockDocument, LockError, LockHandle, LockOptions};
pub use payload::{DecodeError, Json, Payload};
pub use queue::{QueueError, WorkItem, WorkQueue};
pub use registry::{ConsumerOptions, ConsumerRegistry, DuplicatePolicy};
pub use subjects::SubjectMatcher;
