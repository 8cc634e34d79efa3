//! Backpressure handling for the inbound feed
//!
//! A bounded queue between the feed adapter and the router. When it is full
//! the configured policy decides what to drop. Priority items (creates and
//! trades for the mint we hold or are about to hold) are never dropped, even
//! if that briefly pushes the queue past its capacity.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::DropPolicy;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct PrioritizedEvent<T> {
    pub event: T,
    pub is_priority: bool,
    pub received_at: Instant,
}

impl<T> PrioritizedEvent<T> {
    pub fn new(event: T, is_priority: bool) -> Self {
        Self {
            event,
            is_priority,
            received_at: Instant::now(),
        }
    }
}

struct Inner<T> {
    buffer: VecDeque<PrioritizedEvent<T>>,
    closed: bool,
}

/// Bounded multi-producer, single-consumer channel with drop policies
pub struct BackpressureChannel<T> {
    capacity: usize,
    drop_policy: DropPolicy,
    inner: Mutex<Inner<T>>,
    items: Notify,
    space: Notify,
    dropped_count: AtomicU64,
}

impl<T> BackpressureChannel<T> {
    pub fn new(capacity: usize, drop_policy: DropPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            drop_policy,
            inner: Mutex::new(Inner {
                buffer: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            items: Notify::new(),
            space: Notify::new(),
            dropped_count: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn count_drop(&self) {
        self.dropped_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Enqueue `event`. Returns `Ok(false)` if the incoming event itself was
    /// dropped, and fails once the channel is closed.
    pub async fn send(&self, event: T, is_priority: bool) -> Result<bool> {
        let mut pending = Some(PrioritizedEvent::new(event, is_priority));

        loop {
            let space = self.space.notified();
            {
                let mut inner = self.lock();
                if inner.closed {
                    return Err(Error::FeedDisconnected);
                }

                if inner.buffer.len() < self.capacity || is_priority {
                    if inner.buffer.len() >= self.capacity {
                        self.make_room(&mut inner);
                    }
                    if let Some(item) = pending.take() {
                        inner.buffer.push_back(item);
                    }
                    drop(inner);
                    self.items.notify_one();
                    return Ok(true);
                }

                match self.drop_policy {
                    DropPolicy::OldestNonPriority => {
                        if let Some(idx) = inner.buffer.iter().position(|e| !e.is_priority) {
                            inner.buffer.remove(idx);
                            self.count_drop();
                            debug!("Dropped oldest non-priority event due to backpressure");
                            if let Some(item) = pending.take() {
                                inner.buffer.push_back(item);
                            }
                            drop(inner);
                            self.items.notify_one();
                            return Ok(true);
                        }
                        // everything queued is priority
                        self.count_drop();
                        debug!("Dropped incoming event, queue holds only priority events");
                        return Ok(false);
                    }
                    DropPolicy::Newest => {
                        self.count_drop();
                        debug!("Dropped newest event due to backpressure");
                        return Ok(false);
                    }
                    DropPolicy::Block => {
                        warn!("Backpressure channel is full, blocking");
                    }
                }
            }
            space.await;
        }
    }

    /// Over capacity with a priority item incoming: evict the oldest
    /// non-priority item if there is one, otherwise let the queue grow.
    fn make_room(&self, inner: &mut Inner<T>) {
        if self.drop_policy == DropPolicy::Block {
            return;
        }
        if let Some(idx) = inner.buffer.iter().position(|e| !e.is_priority) {
            inner.buffer.remove(idx);
            self.count_drop();
            debug!("Dropped oldest non-priority event to admit a priority event");
        }
    }

    /// Next event, or `None` once closed and drained
    pub async fn recv(&self) -> Option<PrioritizedEvent<T>> {
        loop {
            let items = self.items.notified();
            {
                let mut inner = self.lock();
                if let Some(item) = inner.buffer.pop_front() {
                    drop(inner);
                    self.space.notify_one();
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            items.await;
        }
    }

    pub fn try_recv(&self) -> Option<PrioritizedEvent<T>> {
        let item = self.lock().buffer.pop_front();
        if item.is_some() {
            self.space.notify_one();
        }
        item
    }

    /// Stop accepting events; queued events can still be received
    pub fn close(&self) {
        self.lock().closed = true;
        self.items.notify_waiters();
        self.space.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn utilization(&self) -> f64 {
        (self.len() as f64 / self.capacity as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    async fn drain(channel: &BackpressureChannel<i32>) -> Vec<i32> {
        let mut out = Vec::new();
        while let Some(item) = channel.try_recv() {
            out.push(item.event);
        }
        out
    }

    #[tokio::test]
    async fn test_backpressure_oldest_non_priority() {
        let channel = BackpressureChannel::new(3, DropPolicy::OldestNonPriority);

        channel.send(1, false).await.unwrap();
        channel.send(2, true).await.unwrap();
        channel.send(3, false).await.unwrap();
        assert!(channel.send(4, false).await.unwrap());

        assert_eq!(channel.len(), 3);
        assert_eq!(channel.dropped_count(), 1);
        assert_eq!(drain(&channel).await, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_backpressure_newest() {
        let channel = BackpressureChannel::new(2, DropPolicy::Newest);

        channel.send(1, false).await.unwrap();
        channel.send(2, false).await.unwrap();
        assert!(!channel.send(3, false).await.unwrap());

        assert_eq!(channel.len(), 2);
        assert_eq!(channel.dropped_count(), 1);
    }

    #[tokio::test]
    async fn test_priority_events_are_never_dropped() {
        let channel = BackpressureChannel::new(2, DropPolicy::Newest);
        channel.send(1, true).await.unwrap();
        channel.send(2, true).await.unwrap();

        // full of priority: a normal event is dropped, a priority one is kept
        assert!(!channel.send(3, false).await.unwrap());
        assert!(channel.send(4, true).await.unwrap());
        assert_eq!(drain(&channel).await, vec![1, 2, 4]);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let channel = BackpressureChannel::new(4, DropPolicy::OldestNonPriority);
        channel.send(1, false).await.unwrap();
        channel.close();

        assert!(channel.send(2, false).await.is_err());
        assert_eq!(channel.recv().await.map(|e| e.event), Some(1));
        assert!(channel.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_block_waits_for_space() {
        let channel = Arc::new(BackpressureChannel::new(1, DropPolicy::Block));
        channel.send(1, false).await.unwrap();

        let sender = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.send(2, false).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sender.is_finished());

        assert_eq!(channel.recv().await.map(|e| e.event), Some(1));
        assert!(sender.await.unwrap().unwrap());
        assert_eq!(channel.recv().await.map(|e| e.event), Some(2));
        assert_eq!(channel.dropped_count(), 0);
    }
}
