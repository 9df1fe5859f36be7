//! At most one request per destination.

use super::harness::{settle, test_config, CollectorResponse, TestHarness};
use crate::{CoordinatorState, OutboxConfig};
use serde_json::json;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn flush_while_in_flight_is_a_no_op() {
    let harness = TestHarness::new();
    harness
        .transport
        .queue_response(CollectorResponse::DelayThenStatus(Duration::from_secs(3), 200));
    let handle = harness.spawn(OutboxConfig {
        batch_size: 1,
        ..test_config()
    });

    handle.enqueue(json!(1)).await.unwrap();
    handle.enqueue(json!(2)).await.unwrap();
    handle.start().unwrap();
    settle().await;

    for _ in 0..5 {
        handle.flush().unwrap();
    }
    settle().await;

    assert_eq!(harness.transport.sent_count(), 1);
    assert_eq!(handle.status().await.unwrap().state, CoordinatorState::Flushing);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(
        harness.transport.sent_payloads(),
        vec![vec![json!(1)], vec![json!(2)]]
    );
    assert_eq!(harness.transport.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_triggers_never_overlap_requests() {
    let harness = TestHarness::new();
    harness
        .transport
        .set_default_response(CollectorResponse::DelayThenStatus(Duration::from_millis(700), 200));
    let handle = harness.spawn(OutboxConfig {
        batch_size: 2,
        auto_start: true,
        ..test_config()
    });

    let mut producers = Vec::new();
    for p in 0..4 {
        let handle = handle.clone();
        producers.push(tokio::spawn(async move {
            for n in 0..10 {
                handle.enqueue(json!({ "producer": p, "n": n })).await.unwrap();
                handle.flush().unwrap();
                tokio::time::sleep(Duration::from_millis(150)).await;
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(harness.transport.max_in_flight(), 1);
    let delivered: usize = harness.transport.sent_payloads().iter().map(|b| b.len()).sum();
    assert_eq!(delivered, 40);
    assert!(harness.stored().is_empty());
}
