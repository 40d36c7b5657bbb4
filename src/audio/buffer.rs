//! Bounded FIFO shared between a device thread and the async coordinator.
//!
//! [`ChunkQueue`] bridges the two worlds the pipeline lives in: capture and
//! playback run on dedicated OS threads that block on device I/O, while the
//! coordinator runs inside a tokio task. The queue therefore offers both
//! blocking (`Condvar`) and awaitable (`Notify`) ends:
//!
//! ```text
//! capture thread ──push_blocking / push_drop_oldest──▶ ChunkQueue ──pop().await──▶ coordinator
//! coordinator    ──try_push──▶ ChunkQueue ──pop_timeout──▶ playback thread
//! ```
//!
//! Closing the queue wakes every waiter on both ends, which is how the
//! shutdown sequence unblocks an activity that is mid-wait.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Why a push was refused; the item is handed back.
#[derive(Debug, PartialEq, Eq)]
pub enum PushError<T> {
    /// The queue is at capacity.
    Full(T),
    /// The queue has been closed.
    Closed(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(item) | PushError::Closed(item) => item,
        }
    }
}

/// Outcome of [`ChunkQueue::pop_timeout`].
#[derive(Debug, PartialEq, Eq)]
pub enum Pop<T> {
    Item(T),
    /// Nothing arrived before the timeout.
    Empty,
    /// Closed and fully drained.
    Closed,
}

// ---------------------------------------------------------------------------
// ChunkQueue
// ---------------------------------------------------------------------------

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Fixed-capacity FIFO with blocking and async ends.
///
/// ```rust
/// use duplex_voice::audio::ChunkQueue;
///
/// let queue = ChunkQueue::new(2);
/// queue.try_push(1).unwrap();
/// queue.try_push(2).unwrap();
/// assert!(queue.try_push(3).is_err());
///
/// assert_eq!(queue.push_drop_oldest(3).unwrap(), Some(1));
/// assert_eq!(queue.clear(), 2);
/// ```
pub struct ChunkQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    not_full: Condvar,
    not_empty: Condvar,
    item_ready: Notify,
    space_ready: Notify,
}

impl<T> ChunkQueue<T> {
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ChunkQueue capacity must be > 0");
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            item_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn announce_item(&self) {
        self.not_empty.notify_one();
        self.item_ready.notify_one();
    }

    fn announce_space(&self) {
        self.not_full.notify_one();
        self.space_ready.notify_one();
    }

    // -----------------------------------------------------------------------
    // Producer side
    // -----------------------------------------------------------------------

    /// Append `item`, failing immediately when full or closed.
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(PushError::Closed(item));
            }
            if inner.items.len() >= self.capacity {
                return Err(PushError::Full(item));
            }
            inner.items.push_back(item);
        }
        self.announce_item();
        Ok(())
    }

    /// Append `item`, blocking the calling thread while the queue is full.
    ///
    /// Must not be called from an async task. Returns `Closed` if the queue
    /// is closed before space frees up.
    pub fn push_blocking(&self, item: T) -> Result<(), PushError<T>> {
        {
            let mut inner = self.lock();
            while !inner.closed && inner.items.len() >= self.capacity {
                inner = self
                    .not_full
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if inner.closed {
                return Err(PushError::Closed(item));
            }
            inner.items.push_back(item);
        }
        self.announce_item();
        Ok(())
    }

    /// Append `item`, evicting and returning the oldest entry when full.
    pub fn push_drop_oldest(&self, item: T) -> Result<Option<T>, PushError<T>> {
        let evicted = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(PushError::Closed(item));
            }
            let evicted = if inner.items.len() >= self.capacity {
                inner.items.pop_front()
            } else {
                None
            };
            inner.items.push_back(item);
            evicted
        };
        self.announce_item();
        Ok(evicted)
    }

    /// Resolve once at least one slot is free (or the queue is closed).
    pub async fn wait_for_space(&self) {
        loop {
            {
                let inner = self.lock();
                if inner.closed || inner.items.len() < self.capacity {
                    return;
                }
            }
            self.space_ready.notified().await;
        }
    }

    // -----------------------------------------------------------------------
    // Consumer side
    // -----------------------------------------------------------------------

    /// Await the next item; `None` once the queue is closed and drained.
    ///
    /// Cancel-safe: dropping the future never loses an item.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    drop(inner);
                    self.announce_space();
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.item_ready.notified().await;
        }
    }

    /// Block the calling thread for up to `timeout` waiting for an item.
    pub fn pop_timeout(&self, timeout: Duration) -> Pop<T> {
        let mut inner = self.lock();
        if inner.items.is_empty() && !inner.closed {
            inner = self
                .not_empty
                .wait_timeout_while(inner, timeout, |i| i.items.is_empty() && !i.closed)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        match inner.items.pop_front() {
            Some(item) => {
                drop(inner);
                self.announce_space();
                Pop::Item(item)
            }
            None if inner.closed => Pop::Closed,
            None => Pop::Empty,
        }
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    /// Drop every queued item, returning how many were discarded.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut inner = self.lock();
            let n = inner.items.len();
            inner.items.clear();
            n
        };
        if dropped > 0 {
            self.not_full.notify_all();
            self.space_ready.notify_one();
        }
        dropped
    }

    /// Refuse further pushes and wake every waiter. Queued items can still be
    /// popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
        self.item_ready.notify_one();
        self.space_ready.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
