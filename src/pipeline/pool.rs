//! Bounded object pools and the best-effort output queue.
//!
//! A pooled object is owned by exactly one party at a time: it sits in the
//! pool's free queue, is held by whoever acquired it, or sits in the filled
//! queue waiting for the consumer. Hand-off is a channel send, so ownership
//! moves with the value and no locking of the objects themselves is needed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use crossbeam::channel::{bounded, Receiver, Select, Sender, TryRecvError};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool '{0}' has no free object")]
    Exhausted(String),

    #[error("pool '{0}' is closed")]
    Closed(String),
}

/// What `acquire` does when no object is free.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AcquirePolicy {
    /// Wait until one is released.
    #[default]
    Block,
    /// Return `PoolError::Exhausted` immediately.
    Fail,
}

/// One-shot shutdown signal that wakes every blocked receiver.
#[derive(Debug)]
struct Shutdown {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
    fired: AtomicBool,
}

impl Shutdown {
    fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
            fired: AtomicBool::new(false),
        }
    }

    fn fire(&self) {
        self.fired.store(true, Ordering::Release);
        // Dropping the sender disconnects `rx` and wakes selectors. A
        // poisoned lock still guards a valid `Option`.
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Receive from `rx`, or `None` once the signal fired and `rx` is empty.
    fn recv<T>(&self, rx: &Receiver<T>) -> Option<T> {
        match rx.try_recv() {
            Ok(item) => return Some(item),
            Err(TryRecvError::Disconnected) => return None,
            Err(TryRecvError::Empty) => {}
        }
        let mut sel = Select::new();
        let item = sel.recv(rx);
        sel.recv(&self.rx);
        let op = sel.select();
        if op.index() == item {
            op.recv(rx).ok()
        } else {
            let _ = op.recv(&self.rx);
            rx.try_recv().ok()
        }
    }
}

/// Fixed set of reusable objects with a free and a filled queue.
#[derive(Debug)]
pub struct Pool<T> {
    name: String,
    capacity: usize,
    free_tx: Sender<T>,
    free_rx: Receiver<T>,

    /// `None` marks end of stream.
    filled_tx: Sender<Option<T>>,
    filled_rx: Receiver<Option<T>>,

    shutdown: Shutdown,
}

impl<T: Send> Pool<T> {
    /// Pool of `capacity` objects built by `make`.
    pub fn with_capacity(name: &str, capacity: usize, mut make: impl FnMut() -> T) -> Self {
        let (free_tx, free_rx) = bounded(capacity);
        let (filled_tx, filled_rx) = bounded(capacity + 1);
        for _ in 0..capacity {
            // Cannot fail: the channel holds exactly `capacity` slots.
            let _ = free_tx.try_send(make());
        }
        Self {
            name: name.to_string(),
            capacity,
            free_tx,
            free_rx,
            filled_tx,
            filled_rx,
            shutdown: Shutdown::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn nr_free(&self) -> usize {
        self.free_rx.len()
    }

    pub fn nr_filled(&self) -> usize {
        self.filled_rx.len()
    }

    /// Take a free object.
    pub fn acquire(&self, policy: AcquirePolicy) -> Result<T, PoolError> {
        if self.shutdown.fired() {
            return Err(PoolError::Closed(self.name.clone()));
        }
        match policy {
            AcquirePolicy::Fail => self.free_rx.try_recv().map_err(|e| match e {
                TryRecvError::Empty => PoolError::Exhausted(self.name.clone()),
                TryRecvError::Disconnected => PoolError::Closed(self.name.clone()),
            }),
            AcquirePolicy::Block => self
                .shutdown
                .recv(&self.free_rx)
                .ok_or_else(|| PoolError::Closed(self.name.clone())),
        }
    }

    /// Hand an object back for reuse.
    pub fn release(&self, item: T) -> Result<(), PoolError> {
        self.free_tx
            .send(item)
            .map_err(|_| PoolError::Closed(self.name.clone()))
    }

    /// Pass a filled object to the consumer.
    pub fn submit(&self, item: T) -> Result<(), PoolError> {
        self.filled_tx
            .send(Some(item))
            .map_err(|_| PoolError::Closed(self.name.clone()))
    }

    /// Signal end of stream to the consumer.
    pub fn finish(&self) -> Result<(), PoolError> {
        self.filled_tx
            .send(None)
            .map_err(|_| PoolError::Closed(self.name.clone()))
    }

    /// Next filled object; `Ok(None)` at end of stream.
    pub fn next_filled(&self) -> Result<Option<T>, PoolError> {
        if self.shutdown.fired() {
            return Err(PoolError::Closed(self.name.clone()));
        }
        self.shutdown
            .recv(&self.filled_rx)
            .ok_or_else(|| PoolError::Closed(self.name.clone()))
    }

    /// Abort: wake every blocked party with `PoolError::Closed`.
    pub fn close(&self) {
        self.shutdown.fire();
    }
}

/// Bounded queue that refuses, rather than waits, when full.
#[derive(Debug)]
pub struct BestEffortQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    done: Shutdown,
}

impl<T: Send> BestEffortQueue<T> {
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = bounded(depth);
        Self {
            tx,
            rx,
            done: Shutdown::new(),
        }
    }

    /// Queue `item`, or hand it back when the queue is full or finished.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        if self.done.fired() {
            return Err(item);
        }
        self.tx.try_send(item).map_err(|e| e.into_inner())
    }

    /// Next item; `None` once finished and drained.
    pub fn pop(&self) -> Option<T> {
        self.done.recv(&self.rx)
    }

    /// No more pushes; `pop` drains what is queued, then returns `None`.
    pub fn finish(&self) {
        self.done.fire();
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_acquire_release_cycle() {
        let pool = Pool::with_capacity("test", 2, Vec::<u8>::new);
        let a = pool.acquire(AcquirePolicy::Fail).unwrap();
        let b = pool.acquire(AcquirePolicy::Fail).unwrap();
        assert_eq!(pool.nr_free(), 0);
        assert_eq!(
            pool.acquire(AcquirePolicy::Fail),
            Err(PoolError::Exhausted("test".into()))
        );
        pool.release(a).unwrap();
        pool.release(b).unwrap();
        assert_eq!(pool.nr_free(), 2);
    }

    #[test]
    fn test_filled_queue_preserves_order_and_end_of_stream() {
        let mut n = 0;
        let pool = Pool::with_capacity("in", 3, || {
            n += 1;
            n
        });
        for _ in 0..3 {
            let item = pool.acquire(AcquirePolicy::Block).unwrap();
            pool.submit(item).unwrap();
        }
        pool.finish().unwrap();
        let got: Vec<_> = std::iter::from_fn(|| pool.next_filled().unwrap()).collect();
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[test]
    fn test_blocked_acquire_wakes_on_release() {
        let pool = Pool::with_capacity("blocking", 1, || 7u32);
        let held = pool.acquire(AcquirePolicy::Block).unwrap();
        thread::scope(|s| {
            let waiter = s.spawn(|| pool.acquire(AcquirePolicy::Block));
            thread::sleep(Duration::from_millis(20));
            pool.release(held).unwrap();
            assert_eq!(waiter.join().unwrap(), Ok(7));
        });
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let pool = Pool::with_capacity("closing", 1, || 0u8);
        thread::scope(|s| {
            let consumer = s.spawn(|| pool.next_filled());
            thread::sleep(Duration::from_millis(20));
            pool.close();
            assert_eq!(
                consumer.join().unwrap(),
                Err(PoolError::Closed("closing".into()))
            );
        });
        assert!(pool.acquire(AcquirePolicy::Fail).is_err());
    }

    #[test]
    fn test_close_wakes_consumer_despite_poisoned_signal() {
        let pool = Pool::with_capacity("poisoned", 1, || 0u8);
        thread::scope(|s| {
            let _ = s
                .spawn(|| {
                    let _held = pool.shutdown.tx.lock().unwrap();
                    panic!("holder died");
                })
                .join();
        });
        assert!(pool.shutdown.tx.is_poisoned());

        thread::scope(|s| {
            let consumer = s.spawn(|| pool.next_filled());
            thread::sleep(Duration::from_millis(20));
            pool.close();
            assert_eq!(
                consumer.join().unwrap(),
                Err(PoolError::Closed("poisoned".into()))
            );
        });
    }

    #[test]
    fn test_best_effort_queue_rejects_when_full() {
        let q = BestEffortQueue::new(2);
        assert!(q.try_push(1).is_ok());
        assert!(q.try_push(2).is_ok());
        assert_eq!(q.try_push(3), Err(3));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop(), Some(1));
        assert!(q.try_push(4).is_ok());
    }

    #[test]
    fn test_best_effort_queue_drains_after_finish() {
        let q = BestEffortQueue::new(4);
        q.try_push("a").unwrap();
        q.try_push("b").unwrap();
        q.finish();
        assert_eq!(q.try_push("c"), Err("c"));
        assert_eq!(q.pop(), Some("a"));
        assert_eq!(q.pop(), Some("b"));
        assert_eq!(q.pop(), None);
    }
}
