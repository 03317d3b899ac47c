//! Bounded, ordered request channel.
//!
//! A fixed-capacity FIFO guarded by one mutex and two condition variables.
//! `enqueue` blocks while the channel is full, `dequeue` blocks while it is
//! empty. The capacity is the only backpressure between the ingestion and
//! transmission roles: a slow consumer stalls the producer here.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Returned by `enqueue` once the channel has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClosed;

impl std::fmt::Display for ChannelClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel closed")
    }
}

impl std::error::Error for ChannelClosed {}

struct State<T> {
    queue: VecDeque<T>,
    closed: bool,
}

/// Fixed-capacity multi-producer, single-consumer queue.
pub struct BoundedChannel<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedChannel<T> {
    /// Create a channel holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    // The queue is never left half-updated, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `item`, blocking while the channel is full.
    ///
    /// Fails if the channel is closed before or while waiting; the item is
    /// dropped.
    pub fn enqueue(&self, item: T) -> Result<(), ChannelClosed> {
        let mut state = self.lock();
        while state.queue.len() >= self.capacity && !state.closed {
            state = self
                .not_full
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.closed {
            return Err(ChannelClosed);
        }
        state.queue.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove the oldest item, blocking while the channel is empty.
    ///
    /// After `close`, remaining items are still drained in order; `None`
    /// signals end of stream.
    pub fn dequeue(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.queue.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Refuse further items and wake every waiter.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let channel = BoundedChannel::new(4);
        for i in 0..4 {
            channel.enqueue(i).unwrap();
        }
        assert_eq!(channel.len(), 4);

        for i in 0..4 {
            assert_eq!(channel.dequeue(), Some(i));
        }
        assert!(channel.is_empty());
    }

    #[test]
    fn test_fifo_across_threads() {
        let channel = Arc::new(BoundedChannel::new(8));

        let producer = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                for i in 0..1000u32 {
                    channel.enqueue(i).unwrap();
                }
                channel.close();
            })
        };

        let mut received = Vec::new();
        while let Some(i) = channel.dequeue() {
            received.push(i);
        }
        producer.join().unwrap();

        assert_eq!(received, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_backpressure() {
        let capacity = 4;
        let channel = Arc::new(BoundedChannel::new(capacity));
        let enqueued = Arc::new(AtomicUsize::new(0));

        let producer = {
            let channel = Arc::clone(&channel);
            let enqueued = Arc::clone(&enqueued);
            thread::spawn(move || {
                for i in 0..=capacity {
                    channel.enqueue(i).unwrap();
                    enqueued.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        // The producer fills the channel, then blocks on the extra item.
        while enqueued.load(Ordering::SeqCst) < capacity {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(100));
        assert_eq!(enqueued.load(Ordering::SeqCst), capacity);
        assert_eq!(channel.len(), capacity);

        assert_eq!(channel.dequeue(), Some(0));
        producer.join().unwrap();
        assert_eq!(enqueued.load(Ordering::SeqCst), capacity + 1);
        assert_eq!(channel.len(), capacity);
    }

    #[test]
    fn test_close_drains_then_ends() {
        let channel = BoundedChannel::new(4);
        channel.enqueue("a").unwrap();
        channel.enqueue("b").unwrap();
        channel.close();

        assert_eq!(channel.enqueue("c"), Err(ChannelClosed));
        assert_eq!(channel.dequeue(), Some("a"));
        assert_eq!(channel.dequeue(), Some("b"));
        assert_eq!(channel.dequeue(), None);
        assert!(channel.is_empty());
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let channel = Arc::new(BoundedChannel::<u8>::new(1));

        let consumer = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.dequeue())
        };

        thread::sleep(Duration::from_millis(50));
        channel.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_close_wakes_blocked_producer() {
        let channel = Arc::new(BoundedChannel::new(1));
        channel.enqueue(1).unwrap();

        let producer = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.enqueue(2))
        };

        thread::sleep(Duration::from_millis(50));
        channel.close();
        assert_eq!(producer.join().unwrap(), Err(ChannelClosed));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let channel = BoundedChannel::new(0);
        assert_eq!(channel.capacity(), 1);
        channel.enqueue(()).unwrap();
        assert_eq!(channel.dequeue(), Some(()));
    }
}
