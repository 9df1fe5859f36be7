//! Reading events from newline-delimited JSON and waiting for delivery.

use event_outbox::{CoordinatorHandle, CoordinatorState, Payload};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

/// Counts from one input stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub enqueued: usize,
    /// Could not be stored, but the collector accepted a direct send.
    pub sent_directly: usize,
    pub invalid: usize,
    /// Neither stored nor delivered.
    pub rejected: usize,
}

/// Enqueue every JSON line from `reader`. Blank lines are ignored, lines
/// that are not JSON are counted and skipped. An event that cannot be
/// persisted is sent to the collector directly instead.
pub async fn ingest<R>(reader: R, handle: &CoordinatorHandle) -> std::io::Result<IngestStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = IngestStats::default();
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let payload: Payload = match serde_json::from_str(line) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Skipping line that is not valid JSON");
                stats.invalid += 1;
                continue;
            }
        };

        match handle.enqueue(payload.clone()).await {
            Some(id) => {
                debug!(id = %id, "Enqueued event");
                stats.enqueued += 1;
            }
            None => {
                warn!("Event could not be persisted, sending it directly");
                match handle.send_immediately(payload).await {
                    Ok(Some(result)) if result.is_success() => stats.sent_directly += 1,
                    Ok(Some(result)) => {
                        warn!(status = result.status, error = ?result.error, "Direct send failed; event lost");
                        stats.rejected += 1;
                    }
                    Ok(None) => stats.rejected += 1,
                    Err(e) => {
                        warn!(error = %e, "Cannot send event directly");
                        stats.rejected += 1;
                    }
                }
            }
        }
    }

    Ok(stats)
}

/// Flush once, then wait until every event enqueued by this process has been
/// delivered or `limit` has passed. Returns whether the queue drained.
pub async fn drain(handle: &CoordinatorHandle, poll: Duration, limit: Duration) -> bool {
    if let Err(e) = handle.flush() {
        warn!(error = %e, "Cannot flush");
        return false;
    }

    let wait = async {
        loop {
            match handle.status().await {
                Ok(status) if status.pending == 0 && status.state != CoordinatorState::Flushing => {
                    return true;
                }
                Ok(status) => {
                    debug!(pending = status.pending, state = ?status.state, "Waiting for delivery");
                }
                Err(e) => {
                    warn!(error = %e, "Coordinator closed while draining");
                    return false;
                }
            }
            tokio::time::sleep(poll).await;
        }
    };

    match tokio::time::timeout(limit, wait).await {
        Ok(drained) => {
            if drained {
                info!("All events delivered");
            }
            drained
        }
        Err(_) => {
            warn!(limit_secs = limit.as_secs(), "Events still pending; they stay queued for the next run");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use event_outbox::{
        BatchCoordinator, DeliveryResult, DurableQueue, DurableStore, MemoryBackend, OutboxConfig,
        SendOptions, Transport,
    };
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::io::BufReader;

    struct Recorder {
        status: u16,
        batches: Mutex<Vec<Vec<Payload>>>,
    }

    impl Recorder {
        fn new(status: u16) -> Arc<Self> {
            Arc::new(Self {
                status,
                batches: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn send(&self, batch: &[Payload], _options: &SendOptions) -> DeliveryResult {
            self.batches.lock().unwrap().push(batch.to_vec());
            DeliveryResult::from_status(self.status, HashMap::new())
        }
    }

    fn spawn(transport: Arc<Recorder>) -> CoordinatorHandle {
        spawn_on(MemoryBackend::new(), transport)
    }

    fn spawn_on(backend: MemoryBackend, transport: Arc<Recorder>) -> CoordinatorHandle {
        let store = DurableStore::new(Arc::new(backend), "outbox_events");
        let config = OutboxConfig {
            auto_start: false,
            ..Default::default()
        };
        BatchCoordinator::spawn("events", Arc::new(DurableQueue::new(store)), transport, config, None)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ingest_counts_lines() {
        let handle = spawn(Recorder::new(200));
        let input = b"{\"event\":\"a\"}\n\n  \nnot json\n[1,2]\n" as &[u8];

        let stats = ingest(BufReader::new(input), &handle).await.unwrap();

        assert_eq!(
            stats,
            IngestStats {
                enqueued: 2,
                sent_directly: 0,
                invalid: 1,
                rejected: 0
            }
        );
        assert_eq!(handle.status().await.unwrap().pending, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_delivers_everything() {
        let transport = Recorder::new(200);
        let handle = spawn(transport.clone());
        let input = b"{\"n\":1}\n{\"n\":2}\n" as &[u8];
        ingest(BufReader::new(input), &handle).await.unwrap();

        let drained = drain(&handle, Duration::from_millis(50), Duration::from_secs(5)).await;

        assert!(drained);
        assert_eq!(
            *transport.batches.lock().unwrap(),
            vec![vec![json!({ "n": 1 }), json!({ "n": 2 })]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_after_limit() {
        let handle = spawn(Recorder::new(503));
        ingest(BufReader::new(b"{}\n" as &[u8]), &handle).await.unwrap();

        let drained = drain(&handle, Duration::from_millis(50), Duration::from_secs(2)).await;

        assert!(!drained);
        assert_eq!(handle.status().await.unwrap().pending, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ingest_sends_directly_when_storage_is_full() {
        let transport = Recorder::new(200);
        let handle = spawn_on(MemoryBackend::with_quota(0), transport.clone());
        let input = b"{\"n\":1}\n{\"n\":2}\n" as &[u8];

        let stats = ingest(BufReader::new(input), &handle).await.unwrap();

        assert_eq!(stats.enqueued, 0);
        assert_eq!(stats.sent_directly, 2);
        assert_eq!(stats.rejected, 0);
        assert_eq!(
            *transport.batches.lock().unwrap(),
            vec![vec![json!({ "n": 1 })], vec![json!({ "n": 2 })]]
        );
        assert_eq!(handle.status().await.unwrap().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ingest_counts_failed_direct_sends_as_rejected() {
        let handle = spawn_on(MemoryBackend::with_quota(0), Recorder::new(503));

        let stats = ingest(BufReader::new(b"{}\n" as &[u8]), &handle).await.unwrap();

        assert_eq!(stats.sent_directly, 0);
        assert_eq!(stats.rejected, 1);
    }
}
