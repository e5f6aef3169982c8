//! Integration tests for the Redis work queue.
//!
//! These tests talk to a real Redis server.
//! Run with: REDIS_URL=redis://localhost:6379 cargo test --test redis_queue -- --ignored

use std::collections::HashSet;
use std::sync::Arc;

use registry_loadgen::scheduler::{
    pop_batch, reset_queue, Operation, RedisWorkQueue, UserSegment, WorkQueue,
};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

async fn connect() -> RedisWorkQueue {
    RedisWorkQueue::connect(&redis_url())
        .await
        .expect("Redis must be reachable for integration tests")
}

fn segment(name: &str) -> UserSegment {
    UserSegment::new(format!("it_{}_{}", name, uuid::Uuid::new_v4().simple()))
        .expect("valid segment")
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_queue -- --ignored
async fn test_fifo_and_reset() {
    let queue = connect().await;
    let segment = segment("fifo");
    let items: Vec<String> = (0..2500).map(|i| format!("host/org/repo:{}", i)).collect();

    reset_queue(&queue, &segment, Operation::Push, &items)
        .await
        .expect("reset should succeed");
    assert_eq!(queue.length(&segment, Operation::Push).await.unwrap(), 2500);

    // Resetting again replaces rather than appends.
    reset_queue(&queue, &segment, Operation::Push, &items)
        .await
        .expect("reset should succeed");
    assert_eq!(queue.length(&segment, Operation::Push).await.unwrap(), 2500);

    let batch = pop_batch(&queue, &segment, Operation::Push, 3).await.unwrap();
    assert_eq!(batch, items[..3].to_vec());

    queue.clear(&segment, Operation::Push).await.unwrap();
    assert_eq!(queue.length(&segment, Operation::Push).await.unwrap(), 0);
    assert!(queue.pop_one(&segment, Operation::Push).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn test_concurrent_pops_deliver_once() {
    let queue = Arc::new(connect().await);
    let segment = segment("pops");
    let items: Vec<String> = (0..500).map(|i| format!("host/org/repo:{}", i)).collect();
    reset_queue(queue.as_ref(), &segment, Operation::Pull, &items)
        .await
        .unwrap();

    let mut consumers = Vec::new();
    for _ in 0..8 {
        let queue = Arc::clone(&queue);
        let segment = segment.clone();
        consumers.push(tokio::spawn(async move {
            let mut popped = Vec::new();
            while let Some(item) = queue.pop_one(&segment, Operation::Pull).await.unwrap() {
                popped.push(item);
            }
            popped
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for consumer in consumers {
        for item in consumer.await.unwrap() {
            total += 1;
            assert!(seen.insert(item), "item delivered twice");
        }
    }
    assert_eq!(total, 500);
    assert_eq!(seen.len(), 500);
}
