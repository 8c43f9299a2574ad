//! The reliable, per-host envelope queue (§4.2).
//!
//! One concrete `ReliableQueue` type is parameterised by `QueueType` at
//! construction rather than by trait objects per discipline: one store
//! struct behind a small set of runtime-chosen behaviours instead of a
//! trait per variant.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout, Duration};

use crate::error::QueueError;
use crate::types::{Envelope, OverflowPolicy, QueueType};

struct PriorityItem {
    priority: u8,
    seq: u64,
    env: Envelope,
}

impl PartialEq for PriorityItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for PriorityItem {}
impl PartialOrd for PriorityItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PriorityItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; we want lowest priority number (0 =
        // highest) and, on ties, earliest insertion-sequence, returned
        // first. Reverse both so the heap's "greatest" is what Get wants.
        Reverse(self.priority)
            .cmp(&Reverse(other.priority))
            .then(Reverse(self.seq).cmp(&Reverse(other.seq)))
    }
}

enum Storage {
    Fifo(VecDeque<Envelope>),
    Lifo(VecDeque<Envelope>),
    Unordered(VecDeque<Envelope>),
    Priority(BinaryHeap<PriorityItem>),
}

struct Inner {
    storage: Storage,
    capacity: usize,
    closed: bool,
    next_seq: u64,
    /// retry_count threshold beyond which a Nack(requeue) goes to the
    /// dead-letter sink instead of back onto the queue.
    max_retries: u32,
    dead_letters: VecDeque<Envelope>,
}

impl Inner {
    fn len(&self) -> usize {
        match &self.storage {
            Storage::Fifo(d) | Storage::Lifo(d) | Storage::Unordered(d) => d.len(),
            Storage::Priority(h) => h.len(),
        }
    }

    fn push(&mut self, env: Envelope, priority: u8) {
        match &mut self.storage {
            Storage::Fifo(d) | Storage::Lifo(d) | Storage::Unordered(d) => d.push_back(env),
            Storage::Priority(h) => {
                let seq = self.next_seq;
                self.next_seq += 1;
                h.push(PriorityItem {
                    priority,
                    seq,
                    env,
                });
            }
        }
    }

    /// Remove and return the element that would be returned next by `Get`,
    /// without blocking. Used both by `Get` and by `DropOldest`.
    fn pop_front_logical(&mut self) -> Option<Envelope> {
        match &mut self.storage {
            Storage::Fifo(d) | Storage::Unordered(d) => d.pop_front(),
            Storage::Lifo(d) => d.pop_back(),
            Storage::Priority(h) => h.pop().map(|item| item.env),
        }
    }
}

/// Buffer envelopes destined for a host's workers with a configurable
/// ordering discipline and bounded capacity (§4.2).
pub struct ReliableQueue {
    queue_type: QueueType,
    overflow: OverflowPolicy,
    inner: Mutex<Inner>,
    not_empty: Notify,
    not_full: Notify,
}

impl ReliableQueue {
    pub fn new(
        queue_type: QueueType,
        capacity: usize,
        overflow: OverflowPolicy,
        max_retries: u32,
    ) -> Self {
        let storage = match queue_type {
            QueueType::Fifo => Storage::Fifo(VecDeque::new()),
            QueueType::Lifo => Storage::Lifo(VecDeque::new()),
            QueueType::Unordered => Storage::Unordered(VecDeque::new()),
            QueueType::Priority => Storage::Priority(BinaryHeap::new()),
        };
        Self {
            queue_type,
            overflow,
            inner: Mutex::new(Inner {
                storage,
                capacity,
                closed: false,
                next_seq: 0,
                max_retries,
                dead_letters: VecDeque::new(),
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    /// Admit an envelope, or apply the overflow policy once at capacity.
    /// Returns `Some(discarded)` when an element was displaced (DropOldest)
    /// so the caller can update its trace header to `discarded`.
    pub async fn put(&self, env: Envelope, priority: u8) -> Result<Option<Envelope>, QueueError> {
        loop {
            let mut guard = self.inner.lock().await;
            if guard.closed {
                return Err(QueueError::Closed);
            }
            if guard.len() < guard.capacity {
                guard.push(env, priority);
                drop(guard);
                self.not_empty.notify_one();
                return Ok(None);
            }
            match self.overflow {
                OverflowPolicy::Block => {
                    drop(guard);
                    self.not_full.notified().await;
                    continue;
                }
                OverflowPolicy::DropOldest => {
                    let discarded = guard.pop_front_logical();
                    guard.push(env, priority);
                    drop(guard);
                    self.not_empty.notify_one();
                    return Ok(discarded);
                }
                OverflowPolicy::DropNewest | OverflowPolicy::Reject => {
                    return Err(QueueError::Rejected);
                }
            }
        }
    }

    /// Block until an envelope is available, the queue closes, or
    /// `max_wait` elapses.
    pub async fn get(&self, max_wait: Duration) -> Result<Envelope, QueueError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            {
                let mut guard = self.inner.lock().await;
                if let Some(env) = guard.pop_front_logical() {
                    drop(guard);
                    self.not_full.notify_one();
                    return Ok(env);
                }
                if guard.closed {
                    return Err(QueueError::Closed);
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(QueueError::Cancelled);
            }
            let _ = timeout(remaining, self.not_empty.notified()).await;
        }
    }

    /// Successful processing: nothing further to do (the trace update is
    /// the caller's responsibility, per the worker loop in §4.3 step 8).
    pub async fn ack(&self, _env: &Envelope) {}

    /// Failed processing. If `requeue` and under `max_retries`, push the
    /// envelope back on with an incremented retry count; otherwise move it
    /// to the dead-letter sink and return `true` to signal dead-lettering.
    pub async fn nack(&self, mut env: Envelope, requeue: bool) -> bool {
        let mut guard = self.inner.lock().await;
        if requeue && env.retry_count < guard.max_retries {
            env.retry_count += 1;
            let priority = env.priority;
            guard.push(env, priority);
            drop(guard);
            self.not_empty.notify_one();
            false
        } else {
            guard.dead_letters.push_back(env);
            true
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Close the queue: no further `Put` succeeds; pending `Get`s drain the
    /// remainder, then observe `Closed`.
    pub async fn close(&self) {
        let mut guard = self.inner.lock().await;
        guard.closed = true;
        drop(guard);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub async fn drain_remaining(&self) -> Vec<Envelope> {
        let mut guard = self.inner.lock().await;
        let mut out = Vec::new();
        while let Some(e) = guard.pop_front_logical() {
            out.push(e);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn env(priority: u8) -> Envelope {
        Envelope::new_session("src", vec![1, 2, 3], "application/hl7", "ADT", Uuid::now_v7(), Uuid::now_v7())
            .tap_priority(priority)
    }

    trait TapPriority {
        fn tap_priority(self, p: u8) -> Self;
    }
    impl TapPriority for Envelope {
        fn tap_priority(mut self, p: u8) -> Self {
            self.priority = p;
            self
        }
    }

    #[tokio::test]
    async fn fifo_preserves_insertion_order() {
        let q = ReliableQueue::new(QueueType::Fifo, 10, OverflowPolicy::Reject, 3);
        q.put(env(5), 5).await.unwrap();
        q.put(env(5), 5).await.unwrap();
        let first = q.get(Duration::from_millis(50)).await.unwrap();
        let second = q.get(Duration::from_millis(50)).await.unwrap();
        assert_ne!(first.message_id, second.message_id);
    }

    #[tokio::test]
    async fn priority_breaks_ties_by_insertion_order() {
        let q = ReliableQueue::new(QueueType::Priority, 10, OverflowPolicy::Reject, 3);
        let a = env(3);
        let a_id = a.message_id;
        q.put(a, 3).await.unwrap();
        q.put(env(1), 1).await.unwrap();
        q.put(env(3), 3).await.unwrap();
        let first = q.get(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.priority, 1);
        let second = q.get(Duration::from_millis(50)).await.unwrap();
        assert_eq!(second.message_id, a_id, "priority-3 ties broken by insertion order");
    }

    #[tokio::test]
    async fn reject_overflow_returns_error_without_displacing() {
        let q = ReliableQueue::new(QueueType::Fifo, 1, OverflowPolicy::Reject, 3);
        q.put(env(5), 5).await.unwrap();
        let err = q.put(env(5), 5).await.unwrap_err();
        assert!(matches!(err, QueueError::Rejected));
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn drop_oldest_discards_head_and_admits_new() {
        let q = ReliableQueue::new(QueueType::Fifo, 2, OverflowPolicy::DropOldest, 3);
        let first = env(5);
        let first_id = first.message_id;
        q.put(first, 5).await.unwrap();
        q.put(env(5), 5).await.unwrap();
        let discarded = q.put(env(5), 5).await.unwrap();
        assert_eq!(discarded.unwrap().message_id, first_id);
        assert_eq!(q.len().await, 2);
    }

    #[tokio::test]
    async fn close_then_get_drains_then_closed() {
        let q = ReliableQueue::new(QueueType::Fifo, 2, OverflowPolicy::Reject, 3);
        q.put(env(5), 5).await.unwrap();
        q.close().await;
        assert!(q.put(env(5), 5).await.is_err());
        let _ = q.get(Duration::from_millis(10)).await.unwrap();
        assert!(matches!(
            q.get(Duration::from_millis(10)).await,
            Err(QueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn nack_requeues_until_max_retries_then_dead_letters() {
        let q = ReliableQueue::new(QueueType::Fifo, 10, OverflowPolicy::Reject, 1);
        let e = env(5);
        assert!(!q.nack(e.clone(), true).await);
        let mut requeued = q.get(Duration::from_millis(10)).await.unwrap();
        requeued.retry_count = 1;
        assert!(q.nack(requeued, true).await, "exceeds max_retries, dead-lettered");
    }
}
