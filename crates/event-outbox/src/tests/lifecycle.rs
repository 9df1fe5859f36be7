//! Stop/start, reconfiguration and storage failures.

use super::harness::{settle, test_config, CollectorResponse, TestHarness};
use crate::{Clock, CoordinatorState, OutboxConfig};
use serde_json::json;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn stopped_coordinator_only_flushes_on_request() {
    let harness = TestHarness::new();
    let handle = harness.spawn(OutboxConfig {
        batch_size: 1,
        auto_start: true,
        ..test_config()
    });
    settle().await;

    handle.stop().unwrap();
    handle.enqueue(json!(1)).await.unwrap();
    handle.enqueue(json!(2)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.transport.sent_count(), 0);
    assert_eq!(handle.status().await.unwrap().state, CoordinatorState::Stopped);

    // An explicit flush sends one batch and does not keep draining.
    handle.flush().unwrap();
    settle().await;
    assert_eq!(harness.transport.sent_payloads(), vec![vec![json!(1)]]);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.transport.sent_count(), 1);

    handle.start().unwrap();
    settle().await;
    assert_eq!(
        harness.transport.sent_payloads(),
        vec![vec![json!(1)], vec![json!(2)]]
    );
    assert_eq!(handle.status().await.unwrap().state, CoordinatorState::Idle);
}

#[tokio::test(start_paused = true)]
async fn reconfigure_resets_the_batch_size() {
    let harness = TestHarness::new();
    harness.transport.set_default_response(CollectorResponse::Status(413));
    let handle = harness.spawn(test_config());

    for n in 0..4 {
        handle.enqueue(json!(n)).await.unwrap();
    }
    handle.start().unwrap();
    settle().await;
    assert_eq!(handle.status().await.unwrap().batch_size, 3);

    let config = OutboxConfig {
        batch_size: 10,
        flush_interval_ms: 2_000,
        ..test_config()
    };
    handle.reconfigure(config.clone()).unwrap();

    let status = handle.status().await.unwrap();
    assert_eq!(status.batch_size, 10);
    assert_eq!(status.flush_interval, Duration::from_secs(2));
    assert_eq!(handle.config(), config);
}

#[tokio::test(start_paused = true)]
async fn reconfigure_rejects_invalid_config() {
    let harness = TestHarness::new();
    let handle = harness.spawn(test_config());

    let invalid = OutboxConfig {
        batch_size: 0,
        ..test_config()
    };
    assert!(handle.reconfigure(invalid).is_err());
    assert_eq!(handle.config(), test_config());
}

#[tokio::test(start_paused = true)]
async fn enqueue_uses_the_reconfigured_interval_for_the_reclaim_window() {
    let harness = TestHarness::new();
    let handle = harness.spawn(test_config());

    handle
        .reconfigure(OutboxConfig {
            flush_interval_ms: 4_000,
            max_retry_interval_ms: 60_000,
            ..test_config()
        })
        .unwrap();
    handle.status().await.unwrap();
    handle.enqueue(json!(1)).await.unwrap();

    let stored = harness.stored();
    // Stored timestamps have millisecond precision.
    let window = (stored[0].flush_eligible_at - harness.clock.now()).num_milliseconds();
    assert!((7_999..=8_000).contains(&window), "window was {window}ms");
}

#[tokio::test(start_paused = true)]
async fn reset_batch_size_restores_the_default() {
    let harness = TestHarness::new();
    harness.transport.set_default_response(CollectorResponse::Status(413));
    let handle = harness.spawn(test_config());

    handle.enqueue(json!(1)).await.unwrap();
    handle.enqueue(json!(2)).await.unwrap();
    handle.start().unwrap();
    settle().await;
    assert_eq!(handle.status().await.unwrap().batch_size, 1);

    handle.reset_batch_size().unwrap();
    assert_eq!(handle.status().await.unwrap().batch_size, 50);
}

#[tokio::test(start_paused = true)]
async fn failed_persist_rejects_the_enqueue() {
    let harness = TestHarness::new();
    let handle = harness.spawn(test_config());

    harness.backend.set_quota(Some(0));
    assert!(handle.enqueue(json!("lost")).await.is_none());
    assert_eq!(handle.status().await.unwrap().pending, 0);

    harness.backend.set_quota(None);
    assert!(handle.enqueue(json!("kept")).await.is_some());
    assert_eq!(handle.status().await.unwrap().pending, 1);
}

#[tokio::test(start_paused = true)]
async fn failed_removal_leaves_the_stored_copy_for_reclaim() {
    let harness = TestHarness::new();
    harness
        .transport
        .queue_response(CollectorResponse::DelayThenStatus(Duration::from_secs(1), 200));
    let handle = harness.spawn(test_config());

    handle.enqueue(json!("delivered")).await.unwrap();
    handle.start().unwrap();
    settle().await;

    harness.backend.set_quota(Some(0));
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert_eq!(harness.transport.sent_count(), 1);
    assert_eq!(handle.status().await.unwrap().pending, 0);
    assert_eq!(harness.stored().len(), 1);
}
