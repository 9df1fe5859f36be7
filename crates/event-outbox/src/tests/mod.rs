//! Scenario tests for the batch coordinator.
//!
//! - `harness.rs`      - MockTransport collector and shared storage/clock
//! - `delivery.rs`     - ordered delivery, eager drain, acknowledgement
//! - `backoff.rs`      - server errors, Retry-After, timeouts
//! - `oversized.rs`    - 413 handling and batch-size recovery
//! - `single_flight.rs` - at most one request per destination
//! - `orphans.rs`      - reclaim of entries left by a previous process
//! - `unloading.rs`    - transform write-back on teardown
//! - `lifecycle.rs`    - stop/start, reconfiguration, storage failures
//! - `hook_failures.rs` - panicking transform hooks
//! - `immediate.rs`    - sending outside the queue

mod delivery;
mod lifecycle;
mod single_flight;
