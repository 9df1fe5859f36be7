//! Durable batch-delivery outbox for event records.
//!
//! This crate provides:
//! - DurableStore: key-value persistence of one serialized entry list, on
//!   disk or in memory
//! - DurableQueue: in-memory mirror of pending entries backed by the store,
//!   with orphan reclaim of entries left behind by previous processes
//! - BatchCoordinator: per-destination actor that flushes batches with
//!   single-flight delivery, backoff and adaptive batch sizing
//! - OutboxManager: registry of coordinators keyed by destination
//! - HttpTransport: JSON-over-HTTP delivery
//!
//! Delivery is at-least-once: an entry stays in durable storage until the
//! collector acknowledged it, rejected it as too large on its own, or the
//! pre-send transform dropped it.

mod clock;
mod config;
mod coordinator;
mod entry;
mod error;
mod manager;
mod queue;
mod retry;
mod store;
mod transport;

#[cfg(test)]
mod tests;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::OutboxConfig;
pub use coordinator::{
    BatchCoordinator, CoordinatorHandle, CoordinatorState, CoordinatorStatus, TransformHook,
};
pub use entry::{EntryId, Payload, QueueEntry};
pub use error::{OutboxError, OutboxResult};
pub use manager::{OutboxManager, DEFAULT_KEY_PREFIX};
pub use queue::DurableQueue;
pub use retry::{parse_retry_after, shrink_batch_size, RetryPolicy, Verdict, MAX_RETRY_INTERVAL};
pub use store::{open_backend, DurableStore, FileBackend, MemoryBackend, StorageBackend};
pub use transport::{DeliveryFailure, DeliveryResult, HttpTransport, SendOptions, Transport};
