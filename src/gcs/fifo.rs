/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A fixed-capacity blocking FIFO for actions: multi-producer, single-consumer.
//!
//! Capacity is rounded up to a power of two. Producers block on `not_full`, the consumer
//! blocks on `not_empty`, and closing wakes every waiter: producers observe the closure
//! and get their item back, while the consumer is allowed to drain whatever is already
//! queued. The queue's storage lives as long as any handle, so closure never races
//! destruction — a waiter that wakes up after close always finds consistent state.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

struct FifoState<T> {
    queue: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

struct FifoShared<T> {
    state: Mutex<FifoState<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

/// A handle onto a shared FIFO. Clone freely; all handles refer to the same queue.
pub struct ActionFifo<T> {
    shared: Arc<FifoShared<T>>,
}

impl<T> Clone for ActionFifo<T> {
    fn clone(&self) -> Self {
        ActionFifo {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Returned by [`ActionFifo::push`] when the queue has been closed; carries the
/// rejected item back to the caller.
#[derive(Debug)]
pub struct FifoClosed<T>(pub T);

impl<T> ActionFifo<T> {
    /// Create a FIFO with at least `capacity` slots (rounded up to a power of two).
    pub fn new(capacity: usize) -> ActionFifo<T> {
        let capacity = capacity.max(1).next_power_of_two();
        ActionFifo {
            shared: Arc::new(FifoShared {
                state: Mutex::new(FifoState {
                    queue: VecDeque::with_capacity(capacity),
                    capacity,
                    closed: false,
                }),
                not_full: Condvar::new(),
                not_empty: Condvar::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.state.lock().expect("fifo lock poisoned").capacity
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().expect("fifo lock poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().expect("fifo lock poisoned").closed
    }

    /// Enqueue, blocking while the queue is full. Fails only when the queue is closed.
    pub fn push(&self, item: T) -> Result<(), FifoClosed<T>> {
        let mut state = self.shared.state.lock().expect("fifo lock poisoned");
        loop {
            if state.closed {
                return Err(FifoClosed(item));
            }
            if state.queue.len() < state.capacity {
                state.queue.push_back(item);
                self.shared.not_empty.notify_one();
                return Ok(());
            }
            state = self
                .shared
                .not_full
                .wait(state)
                .expect("fifo lock poisoned");
        }
    }

    /// Enqueue without blocking. Returns the item if the queue is full or closed.
    pub fn try_push(&self, item: T) -> Result<(), FifoClosed<T>> {
        let mut state = self.shared.state.lock().expect("fifo lock poisoned");
        if state.closed || state.queue.len() >= state.capacity {
            return Err(FifoClosed(item));
        }
        state.queue.push_back(item);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue, blocking while the queue is empty. Returns `None` only once the queue
    /// is closed *and* drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.shared.state.lock().expect("fifo lock poisoned");
        loop {
            if let Some(item) = state.queue.pop_front() {
                self.shared.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self
                .shared
                .not_empty
                .wait(state)
                .expect("fifo lock poisoned");
        }
    }

    /// Dequeue, waiting at most `timeout`. `Ok(None)` means the queue closed and
    /// drained; `Err(())` means the wait timed out.
    pub fn pop_timeout(&self, timeout: std::time::Duration) -> Result<Option<T>, ()> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.shared.state.lock().expect("fifo lock poisoned");
        loop {
            if let Some(item) = state.queue.pop_front() {
                self.shared.not_full.notify_one();
                return Ok(Some(item));
            }
            if state.closed {
                return Ok(None);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(());
            }
            let (next, _timed_out) = self
                .shared
                .not_empty
                .wait_timeout(state, deadline - now)
                .expect("fifo lock poisoned");
            state = next;
        }
    }

    /// Dequeue without blocking.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.shared.state.lock().expect("fifo lock poisoned");
        let item = state.queue.pop_front();
        if item.is_some() {
            self.shared.not_full.notify_one();
        }
        item
    }

    /// Close the queue: every blocked producer fails with its item returned, and the
    /// consumer drains what remains.
    pub fn close(&self) {
        let mut state = self.shared.state.lock().expect("fifo lock poisoned");
        state.closed = true;
        self.shared.not_full.notify_all();
        self.shared.not_empty.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        assert_eq!(ActionFifo::<u32>::new(1).capacity(), 1);
        assert_eq!(ActionFifo::<u32>::new(3).capacity(), 4);
        assert_eq!(ActionFifo::<u32>::new(1000).capacity(), 1024);
    }

    #[test]
    fn push_pop_preserves_order() {
        let fifo = ActionFifo::new(8);
        for value in 0..5 {
            fifo.push(value).unwrap();
        }
        for value in 0..5 {
            assert_eq!(fifo.pop(), Some(value));
        }
    }

    #[test]
    fn full_queue_blocks_producer_until_consumer_pops() {
        let fifo = ActionFifo::new(2);
        fifo.push(0u32).unwrap();
        fifo.push(1).unwrap();

        let producer_fifo = fifo.clone();
        let producer = thread::spawn(move || producer_fifo.push(2).is_ok());

        thread::sleep(Duration::from_millis(20));
        assert_eq!(fifo.pop(), Some(0));
        assert!(producer.join().unwrap());
        assert_eq!(fifo.pop(), Some(1));
        assert_eq!(fifo.pop(), Some(2));
    }

    #[test]
    fn close_wakes_blocked_producer_and_returns_item() {
        let fifo = ActionFifo::new(1);
        fifo.push(0u32).unwrap();

        let producer_fifo = fifo.clone();
        let producer = thread::spawn(move || producer_fifo.push(1));

        thread::sleep(Duration::from_millis(20));
        fifo.close();
        let result = producer.join().unwrap();
        assert_eq!(result.unwrap_err().0, 1);
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let fifo: ActionFifo<u32> = ActionFifo::new(4);
        let consumer_fifo = fifo.clone();
        let consumer = thread::spawn(move || consumer_fifo.pop());

        thread::sleep(Duration::from_millis(20));
        fifo.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn consumer_drains_after_close() {
        let fifo = ActionFifo::new(4);
        fifo.push(7u32).unwrap();
        fifo.push(8).unwrap();
        fifo.close();
        assert!(fifo.push(9).is_err());
        assert_eq!(fifo.pop(), Some(7));
        assert_eq!(fifo.pop(), Some(8));
        assert_eq!(fifo.pop(), None);
    }
}
