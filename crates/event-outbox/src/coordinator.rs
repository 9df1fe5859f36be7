//! Batch coordinator: one actor task per destination.
//!
//! The actor owns the flush schedule, the adaptive batch size and the single
//! in-flight delivery. Callers talk to it through a [`CoordinatorHandle`];
//! every state change happens on the actor task, so at most one batch per
//! destination is ever outstanding.
//!
//! ```text
//!   Stopped ──start──▶ Idle ──flush──▶ Flushing
//!      ▲                ▲                 │
//!      └─────stop───────┴──── result ─────┘
//! ```

use crate::retry::{RetryPolicy, Verdict};
use crate::transport::{DeliveryFailure, DeliveryResult, SendOptions, Transport};
use crate::{DurableQueue, EntryId, OutboxConfig, OutboxError, OutboxResult, Payload, QueueEntry};
use serde::Serialize;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::pending;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Pre-send transform applied to each payload. `None` drops the payload.
pub type TransformHook = Arc<dyn Fn(Payload) -> Option<Payload> + Send + Sync>;

/// Coordinator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    /// Timer-driven flushes are disabled.
    Stopped,
    /// No request in flight.
    Idle,
    /// A batch is being delivered.
    Flushing,
}

/// Snapshot of a coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorStatus {
    pub state: CoordinatorState,
    /// Current batch cap.
    pub batch_size: usize,
    /// Current flush interval, grown by backoff.
    #[serde(with = "duration_ms")]
    pub flush_interval: Duration,
    /// Entries enqueued through this instance and not yet removed.
    pub pending: usize,
    /// Entries in durable storage, including other instances' leftovers.
    pub stored: usize,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

enum Command {
    Start,
    Stop,
    Flush,
    Unload { done: oneshot::Sender<bool> },
    ResetBatchSize,
    Reconfigure(OutboxConfig),
    Status { reply: oneshot::Sender<CoordinatorStatus> },
    SendImmediately {
        payload: Payload,
        reply: oneshot::Sender<Option<DeliveryResult>>,
    },
}

/// Cloneable handle to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    destination: String,
    queue: Arc<DurableQueue>,
    config: watch::Receiver<OutboxConfig>,
    commands: mpsc::UnboundedSender<Command>,
}

impl CoordinatorHandle {
    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.queue
    }

    /// Get the configuration the coordinator is running with.
    pub fn config(&self) -> OutboxConfig {
        self.config.borrow().clone()
    }

    /// Persist a payload for delivery. `None` if it could not be stored.
    pub async fn enqueue(&self, payload: Payload) -> Option<EntryId> {
        let flush_interval = self.config.borrow().flush_interval();
        self.queue.enqueue(payload, flush_interval).await
    }

    /// Enable timer-driven flushes and flush right away.
    pub fn start(&self) -> OutboxResult<()> {
        self.send(Command::Start)
    }

    /// Disable timer-driven flushes. An in-flight request still completes.
    pub fn stop(&self) -> OutboxResult<()> {
        self.send(Command::Stop)
    }

    /// Flush now unless a request is already in flight.
    pub fn flush(&self) -> OutboxResult<()> {
        self.send(Command::Flush)
    }

    /// Restore the configured batch size.
    pub fn reset_batch_size(&self) -> OutboxResult<()> {
        self.send(Command::ResetBatchSize)
    }

    /// Replace the configuration. The batch size is reset to the new default.
    pub fn reconfigure(&self, config: OutboxConfig) -> OutboxResult<()> {
        config.validate()?;
        self.send(Command::Reconfigure(config))
    }

    /// Persist transformed payloads for the next process instance and shut
    /// the coordinator down without touching the network.
    ///
    /// Returns false if nothing could be written back, including when a
    /// request was in flight; the entries are still in durable storage.
    pub async fn unload(&self) -> OutboxResult<bool> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Unload { done })?;
        rx.await.map_err(|_| self.closed())
    }

    /// Transform and send one payload right away, outside the queue.
    ///
    /// Nothing is persisted or retried, and the request does not wait for an
    /// in-flight batch. `None` if the transform dropped or failed on the
    /// payload.
    pub async fn send_immediately(&self, payload: Payload) -> OutboxResult<Option<DeliveryResult>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SendImmediately { payload, reply })?;
        rx.await.map_err(|_| self.closed())
    }

    pub async fn status(&self) -> OutboxResult<CoordinatorStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply })?;
        rx.await.map_err(|_| self.closed())
    }

    /// Check whether the actor task has exited.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    fn send(&self, command: Command) -> OutboxResult<()> {
        self.commands.send(command).map_err(|_| self.closed())
    }

    fn closed(&self) -> OutboxError {
        OutboxError::CoordinatorClosed(self.destination.clone())
    }
}

struct InFlight {
    /// Every entry the batch was built from, including hook-rejected ones.
    ids: HashSet<EntryId>,
    batch_len: usize,
    started: Instant,
    result: oneshot::Receiver<DeliveryResult>,
}

enum Event {
    Command(Command),
    Delivered(Option<DeliveryResult>),
    FlushDue,
    Closed,
}

/// Flush driver for one destination. Use [`BatchCoordinator::spawn`].
pub struct BatchCoordinator {
    destination: String,
    queue: Arc<DurableQueue>,
    transport: Arc<dyn Transport>,
    hook: Option<TransformHook>,
    config: OutboxConfig,
    config_tx: watch::Sender<OutboxConfig>,
    policy: RetryPolicy,
    batch_size: usize,
    flush_interval: Duration,
    stopped: bool,
    next_flush: Option<Instant>,
    in_flight: Option<InFlight>,
}

impl BatchCoordinator {
    /// Spawn the coordinator task on the current runtime.
    ///
    /// With `auto_start` the first flush runs immediately, delivering
    /// anything left in durable storage by a previous instance once its
    /// reclaim window has passed.
    pub fn spawn(
        destination: impl Into<String>,
        queue: Arc<DurableQueue>,
        transport: Arc<dyn Transport>,
        config: OutboxConfig,
        hook: Option<TransformHook>,
    ) -> OutboxResult<CoordinatorHandle> {
        config.validate()?;
        let destination = destination.into();
        let (config_tx, config_rx) = watch::channel(config.clone());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let coordinator = Self {
            destination: destination.clone(),
            queue: queue.clone(),
            transport,
            hook,
            policy: RetryPolicy::new(config.max_retry_interval()),
            batch_size: config.batch_size,
            flush_interval: config.flush_interval(),
            stopped: true,
            next_flush: None,
            in_flight: None,
            config,
            config_tx,
        };
        tokio::spawn(coordinator.run(commands_rx));

        info!(destination = %destination, key = %queue.key(), "Spawned batch coordinator");
        Ok(CoordinatorHandle {
            destination,
            queue,
            config: config_rx,
            commands: commands_tx,
        })
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        if self.config.auto_start {
            self.start().await;
        }

        loop {
            let event = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => Event::Command(command),
                    None => Event::Closed,
                },
                result = delivery_done(&mut self.in_flight) => Event::Delivered(result),
                _ = flush_due(self.next_flush) => Event::FlushDue,
            };

            match event {
                Event::Command(command) => {
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Event::Delivered(Some(result)) => self.handle_result(result).await,
                Event::Delivered(None) => {
                    warn!(destination = %self.destination, "Delivery task ended without a result");
                    self.in_flight = None;
                    self.reset_flush();
                }
                Event::FlushDue => {
                    self.next_flush = None;
                    self.flush().await;
                }
                Event::Closed => break,
            }
        }

        debug!(destination = %self.destination, "Batch coordinator stopped");
    }

    /// Returns false once the coordinator should exit.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start => self.start().await,
            Command::Stop => {
                self.stopped = true;
                self.next_flush = None;
                info!(destination = %self.destination, "Coordinator stopped");
            }
            Command::Flush => self.flush().await,
            Command::ResetBatchSize => self.batch_size = self.config.batch_size,
            Command::Reconfigure(config) => {
                self.batch_size = config.batch_size;
                self.flush_interval = config.flush_interval();
                self.policy = RetryPolicy::new(config.max_retry_interval());
                self.config_tx.send_replace(config.clone());
                self.config = config;
                info!(
                    destination = %self.destination,
                    batch_size = self.batch_size,
                    flush_interval_ms = self.flush_interval.as_millis() as u64,
                    "Coordinator reconfigured"
                );
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status().await);
            }
            Command::SendImmediately { payload, reply } => self.send_immediately(payload, reply),
            Command::Unload { done } => {
                let written = self.unload().await;
                let _ = done.send(written);
                return false;
            }
        }
        true
    }

    async fn start(&mut self) {
        self.stopped = false;
        self.flush().await;
    }

    async fn status(&self) -> CoordinatorStatus {
        let state = if self.in_flight.is_some() {
            CoordinatorState::Flushing
        } else if self.stopped {
            CoordinatorState::Stopped
        } else {
            CoordinatorState::Idle
        };
        CoordinatorStatus {
            state,
            batch_size: self.batch_size,
            flush_interval: self.flush_interval,
            pending: self.queue.pending_count().await,
            stored: self.queue.stored_count(),
        }
    }

    /// Schedule the next flush after `delay`, which becomes the current
    /// interval. Nothing is scheduled while stopped.
    fn schedule_flush(&mut self, delay: Duration) {
        self.flush_interval = delay;
        if self.stopped {
            return;
        }
        self.next_flush = Some(Instant::now() + delay);
        debug!(
            destination = %self.destination,
            delay_ms = delay.as_millis() as u64,
            "Scheduled flush"
        );
    }

    fn reset_flush(&mut self) {
        self.schedule_flush(self.config.flush_interval());
    }

    /// Run the hook on one payload. `Err` carries the message of a panicking
    /// hook; the actor survives it.
    fn transform(&self, payload: Payload) -> Result<Option<Payload>, String> {
        let output = match &self.hook {
            Some(hook) => catch_unwind(AssertUnwindSafe(|| hook(payload)))
                .map_err(|panic| panic_message(&*panic))?,
            None => Some(payload),
        };
        Ok(output.filter(|p| !p.is_null()))
    }

    /// Transform a batch. Ids include entries the hook rejected.
    fn prepare(&self, entries: Vec<QueueEntry>) -> Result<(HashSet<EntryId>, Vec<Payload>), String> {
        let mut ids = HashSet::with_capacity(entries.len());
        let mut payloads = Vec::with_capacity(entries.len());

        for entry in entries {
            let payload = if entry.needs_transform() {
                self.transform(entry.payload)?
            } else {
                Some(entry.payload)
            };
            ids.insert(entry.id);
            payloads.extend(payload);
        }
        Ok((ids, payloads))
    }

    async fn flush(&mut self) {
        if self.in_flight.is_some() {
            debug!(destination = %self.destination, "Flush already in progress, skipping");
            return;
        }
        self.next_flush = None;

        loop {
            let entries = self.queue.fill_batch(self.batch_size).await;
            let batch_len = entries.len();
            let (ids, payloads) = match self.prepare(entries) {
                Ok(prepared) => prepared,
                Err(message) => {
                    error!(destination = %self.destination, panic = %message, "Transform hook panicked; entries stay queued");
                    self.reset_flush();
                    return;
                }
            };

            if !payloads.is_empty() {
                debug!(destination = %self.destination, batch_len, events = payloads.len(), "Flushing batch");
                let result = deliver(self.transport.clone(), payloads, self.config.request_timeout());
                self.in_flight = Some(InFlight {
                    ids,
                    batch_len,
                    started: Instant::now(),
                    result,
                });
                return;
            }
            if ids.is_empty() {
                self.reset_flush();
                return;
            }

            debug!(destination = %self.destination, count = ids.len(), "Removing entries rejected by transform");
            if !self.queue.remove_by_ids(&ids).await || self.stopped {
                self.reset_flush();
                return;
            }
        }
    }

    fn send_immediately(&self, payload: Payload, reply: oneshot::Sender<Option<DeliveryResult>>) {
        let payload = match self.transform(payload) {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!(destination = %self.destination, "Immediate send dropped by transform");
                let _ = reply.send(None);
                return;
            }
            Err(message) => {
                error!(destination = %self.destination, panic = %message, "Transform hook panicked; immediate send dropped");
                let _ = reply.send(None);
                return;
            }
        };

        debug!(destination = %self.destination, "Sending event immediately");
        let result = deliver(self.transport.clone(), vec![payload], self.config.request_timeout());
        tokio::spawn(async move {
            let _ = reply.send(result.await.ok());
        });
    }

    async fn handle_result(&mut self, result: DeliveryResult) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        let elapsed = in_flight.started.elapsed();
        let verdict = self.policy.classify(
            &result,
            elapsed,
            self.config.request_timeout(),
            self.flush_interval,
            self.batch_size,
            in_flight.batch_len,
        );

        match verdict {
            Verdict::RetryNow => {
                error!(
                    destination = %self.destination,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Network timeout; retrying"
                );
                if !self.stopped {
                    self.flush().await;
                }
            }
            Verdict::Backoff(delay) => {
                error!(
                    destination = %self.destination,
                    status = result.status,
                    error = ?result.error,
                    delay_ms = delay.as_millis() as u64,
                    "Error; retry later"
                );
                self.schedule_flush(delay);
            }
            Verdict::Shrink(batch_size) => {
                error!(
                    destination = %self.destination,
                    batch_len = in_flight.batch_len,
                    batch_size,
                    "413 response; reducing batch size"
                );
                self.batch_size = batch_size;
                self.schedule_flush(self.flush_interval);
            }
            Verdict::DropOversized => {
                error!(destination = %self.destination, "Single-event request too large; dropping");
                self.batch_size = self.config.batch_size;
                self.remove_delivered(&in_flight.ids).await;
            }
            Verdict::Acknowledge => {
                if result.is_success() {
                    self.batch_size = self.config.batch_size;
                    self.flush_interval = self.config.flush_interval();
                } else {
                    warn!(
                        destination = %self.destination,
                        status = result.status,
                        count = in_flight.ids.len(),
                        "Batch rejected by collector; dropping"
                    );
                }
                self.remove_delivered(&in_flight.ids).await;
            }
        }
    }

    /// Remove acknowledged entries and keep draining.
    async fn remove_delivered(&mut self, ids: &HashSet<EntryId>) {
        if !self.queue.remove_by_ids(ids).await {
            self.reset_flush();
            return;
        }
        if self.stopped {
            return;
        }
        self.flush().await;
    }

    /// Write transformed payloads back to storage instead of sending them.
    async fn unload(&mut self) -> bool {
        self.stopped = true;
        self.next_flush = None;

        if self.in_flight.is_some() {
            warn!(destination = %self.destination, "Unloading with a request in flight; entries stay queued");
            return false;
        }
        if self.hook.is_none() {
            return true;
        }

        let entries: Vec<QueueEntry> = self.queue.fill_batch(usize::MAX).await;
        let mut updates: HashMap<EntryId, Option<Payload>> = HashMap::new();
        for entry in entries.into_iter().filter(QueueEntry::needs_transform) {
            match self.transform(entry.payload) {
                Ok(output) => {
                    updates.insert(entry.id, output);
                }
                Err(message) => {
                    error!(destination = %self.destination, panic = %message, "Transform hook panicked while unloading; entries stay as they are");
                    return false;
                }
            }
        }

        info!(destination = %self.destination, count = updates.len(), "Unloading flush");
        self.queue.update_payloads(&updates).await
    }
}

/// Send `payloads` on a separate task, bounded by `timeout`.
fn deliver(
    transport: Arc<dyn Transport>,
    payloads: Vec<Payload>,
    timeout: Duration,
) -> oneshot::Receiver<DeliveryResult> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let options = SendOptions { timeout };
        let result = match tokio::time::timeout(timeout, transport.send(&payloads, &options)).await {
            Ok(result) => result,
            Err(_) => DeliveryResult::failed(DeliveryFailure::Timeout),
        };
        let _ = tx.send(result);
    });
    rx
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic".to_string()
    }
}

async fn delivery_done(in_flight: &mut Option<InFlight>) -> Option<DeliveryResult> {
    match in_flight {
        Some(in_flight) => (&mut in_flight.result).await.ok(),
        None => pending().await,
    }
}

async fn flush_due(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
