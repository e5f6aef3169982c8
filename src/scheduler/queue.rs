//! Work queues of image references, one per user segment and operation.
//!
//! The queue is the only mutable state shared between execution units. Every
//! mutation is a single atomic list operation, so concurrent consumers of the
//! same segment never receive the same item twice.
//!
//! # Queue Structure
//!
//! Each segment owns two Redis lists:
//!
//! - `tags_to_push-{slug}`: items waiting to be built and pushed
//! - `tags_to_pull-{slug}`: items waiting to be pulled
//!
//! Items are appended on the right (RPUSH) and popped from the left (LPOP),
//! which gives best-effort FIFO order. Consumers do not rely on ordering.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;

use super::job::Operation;
use super::segment::UserSegment;

/// Items sent per RPUSH command when enqueueing large lists.
const ENQUEUE_CHUNK: usize = 1000;

/// An opaque work item: a fully-qualified image reference.
pub type WorkItem = String;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),
}

/// Returns the store key for a segment's queue of the given kind.
pub fn queue_key(segment: &UserSegment, kind: Operation) -> String {
    format!("tags_to_{}-{}", kind, segment.slug())
}

/// A shared FIFO list of work items per segment and operation.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Removes every item from the queue.
    async fn clear(&self, segment: &UserSegment, kind: Operation) -> Result<(), QueueError>;

    /// Appends items to the queue. Only idempotent when preceded by `clear`.
    async fn enqueue_many(
        &self,
        segment: &UserSegment,
        kind: Operation,
        items: &[WorkItem],
    ) -> Result<(), QueueError>;

    /// Removes and returns one item, or `None` when the queue is empty.
    async fn pop_one(
        &self,
        segment: &UserSegment,
        kind: Operation,
    ) -> Result<Option<WorkItem>, QueueError>;

    /// Number of items currently queued.
    async fn length(&self, segment: &UserSegment, kind: Operation) -> Result<usize, QueueError>;
}

/// Pops up to `max` items, stopping early when the queue runs dry.
pub async fn pop_batch(
    queue: &dyn WorkQueue,
    segment: &UserSegment,
    kind: Operation,
    max: usize,
) -> Result<Vec<WorkItem>, QueueError> {
    let mut items = Vec::with_capacity(max.min(1024));
    while items.len() < max {
        match queue.pop_one(segment, kind).await? {
            Some(item) => items.push(item),
            None => break,
        }
    }
    Ok(items)
}

/// Clears a queue and fills it with `items`.
pub async fn reset_queue(
    queue: &dyn WorkQueue,
    segment: &UserSegment,
    kind: Operation,
    items: &[WorkItem],
) -> Result<(), QueueError> {
    queue.clear(segment, kind).await?;
    queue.enqueue_many(segment, kind, items).await
}

/// Redis-backed work queue.
#[derive(Clone)]
pub struct RedisWorkQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
}

impl RedisWorkQueue {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self { redis })
    }

    /// Creates a queue from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn clear(&self, segment: &UserSegment, kind: Operation) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(queue_key(segment, kind)).await?;
        Ok(())
    }

    async fn enqueue_many(
        &self,
        segment: &UserSegment,
        kind: Operation,
        items: &[WorkItem],
    ) -> Result<(), QueueError> {
        if items.is_empty() {
            return Ok(());
        }

        let key = queue_key(segment, kind);
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        for chunk in items.chunks(ENQUEUE_CHUNK) {
            pipe.rpush(&key, chunk.to_vec()).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    async fn pop_one(
        &self,
        segment: &UserSegment,
        kind: Operation,
    ) -> Result<Option<WorkItem>, QueueError> {
        let mut conn = self.redis.clone();
        let item: Option<String> = conn.lpop(queue_key(segment, kind), None).await?;
        Ok(item)
    }

    async fn length(&self, segment: &UserSegment, kind: Operation) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(queue_key(segment, kind)).await?;
        Ok(len)
    }
}

/// In-process work queue.
///
/// Used by the local orchestrator and by tests. Shares the Redis queue's key
/// layout so logs read the same.
#[derive(Debug, Default)]
pub struct MemoryWorkQueue {
    lists: Mutex<HashMap<String, VecDeque<WorkItem>>>,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_lists<T>(&self, f: impl FnOnce(&mut HashMap<String, VecDeque<WorkItem>>) -> T) -> T {
        // A poisoned lock only means another task panicked mid-operation; the
        // map itself is still consistent for single list operations.
        let mut guard = self.lists.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn clear(&self, segment: &UserSegment, kind: Operation) -> Result<(), QueueError> {
        let key = queue_key(segment, kind);
        self.with_lists(|lists| {
            lists.remove(&key);
        });
        Ok(())
    }

    async fn enqueue_many(
        &self,
        segment: &UserSegment,
        kind: Operation,
        items: &[WorkItem],
    ) -> Result<(), QueueError> {
        if items.is_empty() {
            return Ok(());
        }
        let key = queue_key(segment, kind);
        self.with_lists(|lists| {
            lists.entry(key).or_default().extend(items.iter().cloned());
        });
        Ok(())
    }

    async fn pop_one(
        &self,
        segment: &UserSegment,
        kind: Operation,
    ) -> Result<Option<WorkItem>, QueueError> {
        let key = queue_key(segment, kind);
        Ok(self.with_lists(|lists| lists.get_mut(&key).and_then(VecDeque::pop_front)))
    }

    async fn length(&self, segment: &UserSegment, kind: Operation) -> Result<usize, QueueError> {
        let key = queue_key(segment, kind);
        Ok(self.with_lists(|lists| lists.get(&key).map_or(0, VecDeque::len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn segment(name: &str) -> UserSegment {
        UserSegment::new(name).unwrap()
    }

    fn items(n: usize) -> Vec<WorkItem> {
        (0..n)
            .map(|i| format!("quay.example.com/perf/repo_with_{}_tags:{}", n, i))
            .collect()
    }

    #[test]
    fn test_queue_key_layout() {
        let seg = segment("ab12_user_3");
        assert_eq!(queue_key(&seg, Operation::Push), "tags_to_push-ab12-user-3");
        assert_eq!(queue_key(&seg, Operation::Pull), "tags_to_pull-ab12-user-3");
    }

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));
    }

    #[tokio::test]
    async fn test_fifo_and_length() {
        let queue = MemoryWorkQueue::new();
        let seg = segment("u1");
        queue
            .enqueue_many(&seg, Operation::Push, &items(3))
            .await
            .unwrap();

        assert_eq!(queue.length(&seg, Operation::Push).await.unwrap(), 3);
        assert_eq!(queue.length(&seg, Operation::Pull).await.unwrap(), 0);

        let first = queue.pop_one(&seg, Operation::Push).await.unwrap();
        assert_eq!(first, Some(items(3)[0].clone()));
        assert_eq!(queue.length(&seg, Operation::Push).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_pop_empty_returns_none() {
        let queue = MemoryWorkQueue::new();
        let seg = segment("u1");
        assert_eq!(queue.pop_one(&seg, Operation::Pull).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_enqueue_empty_is_noop() {
        let queue = MemoryWorkQueue::new();
        let seg = segment("u1");
        queue.enqueue_many(&seg, Operation::Push, &[]).await.unwrap();
        assert_eq!(queue.length(&seg, Operation::Push).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear_then_enqueue_is_idempotent() {
        let queue = MemoryWorkQueue::new();
        let seg = segment("u1");
        let wanted = items(5);

        // Stale data from an earlier run.
        queue
            .enqueue_many(&seg, Operation::Push, &items(7))
            .await
            .unwrap();

        for _ in 0..2 {
            reset_queue(&queue, &seg, Operation::Push, &wanted)
                .await
                .unwrap();
        }

        let drained = pop_batch(&queue, &seg, Operation::Push, usize::MAX)
            .await
            .unwrap();
        assert_eq!(drained, wanted);
    }

    #[tokio::test]
    async fn test_pop_batch_bounded() {
        let queue = MemoryWorkQueue::new();
        let seg = segment("u1");
        queue
            .enqueue_many(&seg, Operation::Pull, &items(10))
            .await
            .unwrap();

        let batch = pop_batch(&queue, &seg, Operation::Pull, 4).await.unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(queue.length(&seg, Operation::Pull).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_segments_are_isolated() {
        let queue = MemoryWorkQueue::new();
        let a = segment("a");
        let b = segment("b");
        queue
            .enqueue_many(&a, Operation::Push, &items(2))
            .await
            .unwrap();

        assert_eq!(queue.pop_one(&b, Operation::Push).await.unwrap(), None);
        queue.clear(&b, Operation::Push).await.unwrap();
        assert_eq!(queue.length(&a, Operation::Push).await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumers_no_double_delivery() {
        let queue = Arc::new(MemoryWorkQueue::new());
        let seg = segment("u1");
        let wanted = items(500);
        queue
            .enqueue_many(&seg, Operation::Pull, &wanted)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            let seg = seg.clone();
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(item) = queue.pop_one(&seg, Operation::Pull).await.unwrap() {
                    got.push(item);
                    tokio::task::yield_now().await;
                }
                got
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }

        assert_eq!(all.len(), wanted.len());
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(unique.len(), wanted.len());
        let expected: HashSet<_> = wanted.iter().collect();
        assert_eq!(unique, expected);
    }
}
