//! Durable queue: in-memory mirror backed by a [`DurableStore`].
//!
//! Every mutation re-reads the stored list immediately before rewriting it
//! instead of assuming exclusive ownership of the storage key. Another process
//! sharing the key can still interleave between our read and write; the later
//! writer wins and the loser's change reappears only if it is made again. For
//! enqueue that means a concurrent foreign entry can be lost, for removal that
//! an acknowledged entry can come back and be delivered twice. Both are within
//! the at-least-once contract.

use crate::{Clock, DurableStore, EntryId, Payload, QueueEntry, SystemClock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Queue of pending entries for one destination.
pub struct DurableQueue {
    store: DurableStore,
    clock: Arc<dyn Clock>,
    /// Entries enqueued by this instance, in insertion order.
    memory: Mutex<Vec<QueueEntry>>,
}

impl DurableQueue {
    /// Create a queue over `store` using the system clock.
    pub fn new(store: DurableStore) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: DurableStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            memory: Mutex::new(Vec::new()),
        }
    }

    /// Get the storage key.
    pub fn key(&self) -> &str {
        self.store.key()
    }

    /// Enqueue a payload.
    ///
    /// The entry becomes eligible for orphan reclaim by other instances after
    /// twice `flush_interval`. It is added to the in-memory mirror only once
    /// it has been persisted; `None` means nothing changed.
    pub async fn enqueue(&self, payload: Payload, flush_interval: Duration) -> Option<EntryId> {
        let reclaim_window = chrono::Duration::from_std(flush_interval.saturating_mul(2))
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let flush_eligible_at = self
            .clock
            .now()
            .checked_add_signed(reclaim_window)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC);
        let entry = QueueEntry::new(payload, flush_eligible_at);
        let id = entry.id.clone();

        let mut memory = self.memory.lock().await;
        let mut stored = self.store.read();
        stored.push(entry.clone());

        if !self.store.write(&stored) {
            warn!(key = %self.key(), "Error enqueueing item");
            return None;
        }

        memory.push(entry);
        debug!(key = %self.key(), id = %id, pending = memory.len(), "Enqueued entry");
        Some(id)
    }

    /// Take up to `max_size` entries for the next batch.
    ///
    /// Entries from the in-memory mirror come first in insertion order. A
    /// short batch is topped up from durable storage with entries whose reclaim
    /// window has passed, in stored order, flagged as orphaned.
    pub async fn fill_batch(&self, max_size: usize) -> Vec<QueueEntry> {
        let memory = self.memory.lock().await;
        let mut batch: Vec<QueueEntry> = memory.iter().take(max_size).cloned().collect();

        if batch.len() < max_size {
            let stored = self.store.read();
            if !stored.is_empty() {
                let now = self.clock.now();
                let mut selected: HashSet<EntryId> = batch.iter().map(|e| e.id.clone()).collect();

                for mut entry in stored {
                    if batch.len() >= max_size {
                        break;
                    }
                    if now > entry.flush_eligible_at && selected.insert(entry.id.clone()) {
                        entry.orphaned = true;
                        batch.push(entry);
                    }
                }
            }
        }

        debug!(key = %self.key(), max_size, count = batch.len(), "Filled batch");
        batch
    }

    /// Remove entries by id from memory and durable storage.
    ///
    /// Returns false if the durable rewrite failed; the in-memory mirror is
    /// filtered either way and the stored copies stay reclaimable.
    pub async fn remove_by_ids(&self, ids: &HashSet<EntryId>) -> bool {
        let mut memory = self.memory.lock().await;
        memory.retain(|e| !ids.contains(&e.id));

        let mut stored = self.store.read();
        stored.retain(|e| !ids.contains(&e.id));
        let succeeded = self.store.write(&stored);

        if succeeded {
            debug!(key = %self.key(), count = ids.len(), remaining = stored.len(), "Removed entries");
        } else {
            warn!(key = %self.key(), count = ids.len(), "Error removing items");
        }
        succeeded
    }

    /// Rewrite stored payloads with transform output.
    ///
    /// `Some(payload)` replaces the entry's payload and marks it transformed;
    /// `None` removes the entry. Memory is only updated if the rewrite was
    /// persisted.
    pub async fn update_payloads(&self, updates: &HashMap<EntryId, Option<Payload>>) -> bool {
        if updates.is_empty() {
            return true;
        }

        let mut memory = self.memory.lock().await;
        let mut stored = self.store.read();
        apply_updates(&mut stored, updates);

        if !self.store.write(&stored) {
            warn!(key = %self.key(), count = updates.len(), "Error updating payloads");
            return false;
        }

        apply_updates(&mut memory, updates);
        info!(key = %self.key(), count = updates.len(), "Persisted transformed payloads");
        true
    }

    /// Get the number of entries in the in-memory mirror.
    pub async fn pending_count(&self) -> usize {
        self.memory.lock().await.len()
    }

    /// Get the number of entries currently in durable storage.
    pub fn stored_count(&self) -> usize {
        self.store.read().len()
    }

    /// Check if neither memory nor durable storage holds entries.
    pub async fn is_empty(&self) -> bool {
        self.pending_count().await == 0 && self.stored_count() == 0
    }
}

fn apply_updates(entries: &mut Vec<QueueEntry>, updates: &HashMap<EntryId, Option<Payload>>) {
    entries.retain(|e| !matches!(updates.get(&e.id), Some(None)));
    for entry in entries.iter_mut() {
        if let Some(Some(payload)) = updates.get(&entry.id) {
            entry.payload = payload.clone();
            entry.transformed = true;
        }
    }
}
