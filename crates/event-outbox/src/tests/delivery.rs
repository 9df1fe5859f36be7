//! Ordered delivery and acknowledgement.

use super::harness::{assert_gap, settle, test_config, CollectorResponse, TestHarness};
use crate::{CoordinatorState, OutboxConfig};
use serde_json::json;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn delivers_in_insertion_order_and_drains_eagerly() {
    let harness = TestHarness::new();
    let handle = harness.spawn(OutboxConfig {
        batch_size: 2,
        ..test_config()
    });

    for n in 1..=3 {
        assert!(handle.enqueue(json!({ "n": n })).await.is_some());
    }
    handle.start().unwrap();
    settle().await;

    assert_eq!(
        harness.transport.sent_payloads(),
        vec![
            vec![json!({ "n": 1 }), json!({ "n": 2 })],
            vec![json!({ "n": 3 })],
        ]
    );
    // The second batch follows removal of the first without waiting.
    assert_gap(harness.transport.gaps()[0], Duration::ZERO);
    assert!(harness.stored().is_empty());

    let status = handle.status().await.unwrap();
    assert_eq!(status.state, CoordinatorState::Idle);
    assert_eq!(status.pending, 0);
    assert_eq!(status.stored, 0);
}

#[tokio::test(start_paused = true)]
async fn auto_start_flushes_on_the_configured_interval() {
    let harness = TestHarness::new();
    let handle = harness.spawn(OutboxConfig {
        auto_start: true,
        ..test_config()
    });
    settle().await;
    assert_eq!(harness.transport.sent_count(), 0);

    handle.enqueue(json!("a")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(harness.transport.sent_count(), 0);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(harness.transport.sent_payloads(), vec![vec![json!("a")]]);
    assert!(harness.stored().is_empty());
}

#[tokio::test(start_paused = true)]
async fn rejected_batch_is_removed() {
    let harness = TestHarness::new();
    harness.transport.set_default_response(CollectorResponse::Status(400));
    let handle = harness.spawn(test_config());

    handle.enqueue(json!(1)).await.unwrap();
    handle.enqueue(json!(2)).await.unwrap();
    handle.start().unwrap();
    settle().await;

    assert_eq!(harness.transport.sent_count(), 1);
    assert!(harness.stored().is_empty());
    assert_eq!(handle.status().await.unwrap().pending, 0);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_entries_stay_queued() {
    let harness = TestHarness::new();
    harness.transport.set_default_response(CollectorResponse::Status(503));
    let handle = harness.spawn(test_config());

    let id = handle.enqueue(json!("keep")).await.unwrap();
    handle.start().unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(harness.transport.sent_count() > 1);
    for batch in harness.transport.sent_payloads() {
        assert_eq!(batch, vec![json!("keep")]);
    }
    let stored = harness.stored();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, id);
}
