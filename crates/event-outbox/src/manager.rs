//! Outbox manager for coordinating per-destination queues.

use crate::store::validate_key;
use crate::{
    BatchCoordinator, Clock, CoordinatorHandle, CoordinatorStatus, DeliveryResult, DurableQueue,
    DurableStore, EntryId, OutboxConfig, OutboxError, OutboxResult, Payload, StorageBackend, SystemClock,
    TransformHook, Transport,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Default prefix for storage keys.
pub const DEFAULT_KEY_PREFIX: &str = "outbox";

/// Outbox manager keeps one coordinator per destination.
///
/// All destinations share one storage backend; each gets its own key,
/// `<prefix>_<destination>`, so a restarted manager registering the same
/// destination picks up what the previous one left behind.
pub struct OutboxManager {
    backend: Arc<dyn StorageBackend>,
    key_prefix: String,
    clock: Arc<dyn Clock>,
    config: RwLock<OutboxConfig>,
    coordinators: RwLock<HashMap<String, CoordinatorHandle>>,
}

impl OutboxManager {
    /// Create a new outbox manager.
    pub fn new(backend: Arc<dyn StorageBackend>, key_prefix: impl Into<String>, config: OutboxConfig) -> Self {
        Self::with_clock(backend, key_prefix, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        backend: Arc<dyn StorageBackend>,
        key_prefix: impl Into<String>,
        config: OutboxConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend,
            key_prefix: key_prefix.into(),
            clock,
            config: RwLock::new(config),
            coordinators: RwLock::new(HashMap::new()),
        }
    }

    /// Get the storage key for a destination.
    pub fn storage_key(&self, destination: &str) -> String {
        format!("{}_{}", self.key_prefix, destination)
    }

    /// Get the default config new destinations are registered with.
    pub async fn config(&self) -> OutboxConfig {
        self.config.read().await.clone()
    }

    /// Get or create the coordinator for a destination using the default
    /// config.
    pub async fn register(
        &self,
        destination: &str,
        transport: Arc<dyn Transport>,
        hook: Option<TransformHook>,
    ) -> OutboxResult<CoordinatorHandle> {
        let config = self.config().await;
        self.register_with_config(destination, transport, config, hook).await
    }

    /// Get or create the coordinator for a destination.
    ///
    /// An already registered destination keeps its transport, hook and
    /// config.
    pub async fn register_with_config(
        &self,
        destination: &str,
        transport: Arc<dyn Transport>,
        config: OutboxConfig,
        hook: Option<TransformHook>,
    ) -> OutboxResult<CoordinatorHandle> {
        // Check if coordinator already exists
        {
            let coordinators = self.coordinators.read().await;
            if let Some(handle) = coordinators.get(destination) {
                return Ok(handle.clone());
            }
        }

        let key = self.storage_key(destination);
        validate_key(&key)?;

        let mut coordinators = self.coordinators.write().await;
        if let Some(handle) = coordinators.get(destination) {
            return Ok(handle.clone());
        }

        let store = DurableStore::new(self.backend.clone(), key);
        let queue = Arc::new(DurableQueue::with_clock(store, self.clock.clone()));
        let handle = BatchCoordinator::spawn(destination, queue, transport, config, hook)?;
        coordinators.insert(destination.to_string(), handle.clone());

        info!(destination = %destination, "Registered outbox destination");
        Ok(handle)
    }

    pub async fn get(&self, destination: &str) -> Option<CoordinatorHandle> {
        self.coordinators.read().await.get(destination).cloned()
    }

    /// Enqueue a payload for a registered destination.
    ///
    /// `Ok(None)` means the destination exists but the payload could not be
    /// persisted.
    pub async fn enqueue(&self, destination: &str, payload: Payload) -> OutboxResult<Option<EntryId>> {
        let handle = self
            .get(destination)
            .await
            .ok_or_else(|| OutboxError::DestinationNotFound(destination.to_string()))?;
        Ok(handle.enqueue(payload).await)
    }

    /// Send a payload to a registered destination without queueing it.
    pub async fn send_immediately(
        &self,
        destination: &str,
        payload: Payload,
    ) -> OutboxResult<Option<DeliveryResult>> {
        let handle = self
            .get(destination)
            .await
            .ok_or_else(|| OutboxError::DestinationNotFound(destination.to_string()))?;
        handle.send_immediately(payload).await
    }

    /// Stop a destination's coordinator and forget it. Its stored entries
    /// stay in durable storage.
    pub async fn remove(&self, destination: &str) -> bool {
        let removed = self.coordinators.write().await.remove(destination);
        match removed {
            Some(handle) => {
                if let Err(e) = handle.stop() {
                    debug!(destination = %destination, error = %e, "Coordinator already closed");
                }
                info!(destination = %destination, "Removed outbox destination");
                true
            }
            None => false,
        }
    }

    pub async fn start_all(&self) {
        for (destination, handle) in self.snapshot().await {
            if let Err(e) = handle.start() {
                warn!(destination = %destination, error = %e, "Error starting coordinator");
            }
        }
    }

    pub async fn stop_all(&self) {
        for (destination, handle) in self.snapshot().await {
            if let Err(e) = handle.stop() {
                warn!(destination = %destination, error = %e, "Error stopping coordinator");
            }
        }
    }

    pub async fn flush_all(&self) {
        for (destination, handle) in self.snapshot().await {
            if let Err(e) = handle.flush() {
                warn!(destination = %destination, error = %e, "Error flushing coordinator");
            }
        }
    }

    /// Run the unloading flush on every destination and drop them all.
    ///
    /// Returns true if every destination wrote its entries back.
    pub async fn unload_all(&self) -> bool {
        let coordinators: Vec<(String, CoordinatorHandle)> =
            self.coordinators.write().await.drain().collect();

        let mut all_written = true;
        for (destination, handle) in coordinators {
            match handle.unload().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(destination = %destination, "Unload did not write back entries");
                    all_written = false;
                }
                Err(e) => {
                    warn!(destination = %destination, error = %e, "Error unloading coordinator");
                    all_written = false;
                }
            }
        }
        all_written
    }

    /// Apply a new config to every destination and to future registrations.
    pub async fn reconfigure_all(&self, config: OutboxConfig) -> OutboxResult<()> {
        config.validate()?;
        *self.config.write().await = config.clone();

        for (destination, handle) in self.snapshot().await {
            if let Err(e) = handle.reconfigure(config.clone()) {
                warn!(destination = %destination, error = %e, "Error reconfiguring coordinator");
            }
        }
        Ok(())
    }

    /// Get status for all destinations.
    pub async fn status(&self) -> HashMap<String, CoordinatorStatus> {
        let mut status = HashMap::new();
        for (destination, handle) in self.snapshot().await {
            match handle.status().await {
                Ok(s) => {
                    status.insert(destination, s);
                }
                Err(e) => warn!(destination = %destination, error = %e, "Error reading status"),
            }
        }
        status
    }

    /// Get the number of registered destinations.
    pub async fn destination_count(&self) -> usize {
        self.coordinators.read().await.len()
    }

    async fn snapshot(&self) -> Vec<(String, CoordinatorHandle)> {
        let coordinators = self.coordinators.read().await;
        coordinators
            .iter()
            .map(|(destination, handle)| (destination.clone(), handle.clone()))
            .collect()
    }
}
