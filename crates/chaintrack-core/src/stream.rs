//! Multi-reader broadcast of tracker output.
//!
//! Items live in an append-only singly linked list. Each node carries a
//! successor slot and its own readiness signal; a subscriber only holds a
//! cursor to the last node it read, so readers never coordinate with each
//! other and never block the producer. Nodes nobody points at any more are
//! dropped.
//!
//! [`Broker::bounded`] additionally caps how far a reader may lag: once an
//! unread item is evicted, the reader gets [`TrackerError::FellBehind`] and
//! must [`Subscription::flush`] to the current tail. Evicted nodes are
//! unlinked, so a stalled reader pins at most one node beyond its cursor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::TrackerError;
use crate::types::BlockEvent;

/// Stream of window deltas published by the block tracker.
pub type BlockStream = Broker<BlockEvent>;

struct Node<T> {
    seq: u64,
    item: Option<T>,
    next: Mutex<Option<Arc<Node<T>>>>,
    ready: Notify,
}

impl<T> Node<T> {
    fn new(seq: u64, item: Option<T>) -> Self {
        Self {
            seq,
            item,
            next: Mutex::new(None),
            ready: Notify::new(),
        }
    }

    fn successor(&self) -> Option<Arc<Node<T>>> {
        self.next.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn link(&self, next: Arc<Node<T>>) {
        *self.next.lock().unwrap_or_else(PoisonError::into_inner) = Some(next);
    }

    /// Cut the successor link and wake readers parked on this node.
    fn unlink(&self) {
        drop(self.next.lock().unwrap_or_else(PoisonError::into_inner).take());
        self.ready.notify_waiters();
    }
}

impl<T> Drop for Node<T> {
    // Unlink iteratively so dropping a long unread chain cannot overflow the stack.
    fn drop(&mut self) {
        let mut next = self.next.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut node) => next = node.next.get_mut().unwrap_or_else(PoisonError::into_inner).take(),
                Err(_) => break,
            }
        }
    }
}

struct State<T> {
    tail: Arc<Node<T>>,
    /// Bounded brokers only: the newest `capacity` nodes, preceded by the
    /// last node a reader can still advance from.
    retained: VecDeque<Arc<Node<T>>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    capacity: Option<usize>,
    /// Sequence number of the oldest retained item (bounded brokers only).
    oldest: AtomicU64,
}

/// Append-only broadcast with independent per-subscriber cursors.
pub struct Broker<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Broker<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone> Default for Broker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Broker<T> {
    /// Unbounded broker: a slow reader keeps its unread history alive.
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Broker that retains at most `capacity` items for lagging readers.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    tail: Arc::new(Node::new(0, None)),
                    retained: VecDeque::new(),
                }),
                capacity,
                oldest: AtomicU64::new(0),
            }),
        }
    }

    /// Append an item and wake every reader waiting on the old tail.
    pub fn publish(&self, item: T) {
        let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        let node = Arc::new(Node::new(state.tail.seq + 1, Some(item)));
        let prev = std::mem::replace(&mut state.tail, node.clone());
        // Only the producer links nodes, under the state lock.
        prev.link(node.clone());
        prev.ready.notify_waiters();

        if let Some(capacity) = self.shared.capacity {
            state.retained.push_back(node);
            let first = state.retained.len().saturating_sub(capacity);
            if let Some(oldest) = state.retained.get(first) {
                self.shared.oldest.store(oldest.seq, Ordering::Release);
            }
            // `oldest` is published before links are cut, so a reader that
            // finds its link gone also sees that it fell behind.
            while state.retained.len() > capacity + 1 {
                if let Some(evicted) = state.retained.pop_front() {
                    evicted.unlink();
                }
            }
        }
    }

    /// Subscribe at the current tail: only items published afterwards are seen.
    pub fn subscribe(&self) -> Subscription<T> {
        let state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        Subscription {
            cursor: state.tail.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Subscribe so that the retained backlog is replayed before live items.
    ///
    /// Same as [`subscribe`](Self::subscribe) on an unbounded broker.
    pub fn subscribe_backlog(&self) -> Subscription<T> {
        let state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        let first = match self.shared.capacity {
            Some(capacity) => state.retained.get(state.retained.len().saturating_sub(capacity)),
            None => None,
        };
        let cursor = match first {
            Some(first) => {
                let anchor = Node::new(first.seq - 1, None);
                anchor.link(first.clone());
                Arc::new(anchor)
            }
            None => state.tail.clone(),
        };
        Subscription {
            cursor,
            shared: self.shared.clone(),
        }
    }

    /// Number of items published so far.
    pub fn published(&self) -> u64 {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tail
            .seq
    }
}

/// A reader's cursor into a [`Broker`].
pub struct Subscription<T> {
    cursor: Arc<Node<T>>,
    shared: Arc<Shared<T>>,
}

impl<T: Clone> Subscription<T> {
    /// Return the next item if it has already been published.
    pub fn try_next(&mut self) -> Result<Option<T>, TrackerError> {
        let next = self.cursor.successor();
        if self.shared.capacity.is_some()
            && self.cursor.seq + 1 < self.shared.oldest.load(Ordering::Acquire)
        {
            return Err(TrackerError::FellBehind);
        }
        let Some(next) = next else {
            return Ok(None);
        };
        self.cursor = next;
        Ok(self.cursor.item.clone())
    }

    /// Wait for the next item, or return [`TrackerError::Canceled`].
    pub async fn next(&mut self, cancel: &CancellationToken) -> Result<T, TrackerError> {
        loop {
            let node = self.cursor.clone();
            // Registered before the check so a concurrent publish is not missed.
            let notified = node.ready.notified();
            if let Some(item) = self.try_next()? {
                return Ok(item);
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return Err(TrackerError::Canceled),
            }
        }
    }

    /// Skip all unread items and continue from the current tail.
    pub fn flush(&mut self) {
        let state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.cursor = state.tail.clone();
    }

    /// Items published but not yet read (best effort; for diagnostics).
    pub fn lag(&self) -> u64 {
        let tail = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tail
            .seq;
        tail.saturating_sub(self.cursor.seq)
    }
}
