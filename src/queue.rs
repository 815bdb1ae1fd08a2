//! Bounded command/event queue for the connection manager.
//!
//! The manager is the sole consumer; producers are the public async API,
//! the radio event handlers and the single-shot timers. The queue is small
//! and applies backpressure by blocking the sender until a slot frees,
//! never by dropping a message.
//!
//! Ordering is strict FIFO with one exception: [`Sender::send_front`]
//! queues at the head. This priority path exists so the access-point
//! shutdown command stays responsive even when the queue is busy.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

/// Capacity of the manager queue. Kept deliberately small; producers block
/// while the manager catches up.
pub const QUEUE_CAPACITY: usize = 3;

struct Shared<T> {
    inner: Mutex<VecDeque<T>>,
    /// Signalled when an item is pushed.
    not_empty: Condvar,
    /// Signalled when an item is popped.
    not_full: Condvar,
    capacity: usize,
}

/// Producer half of the queue. Cloneable; every producer shares the same
/// bounded buffer.
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// Consumer half of the queue. Exactly one exists per queue.
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

/// Create a bounded queue with the given capacity.
pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(VecDeque::with_capacity(capacity)),
        not_empty: Condvar::new(),
        not_full: Condvar::new(),
        capacity,
    });
    (
        Sender {
            shared: shared.clone(),
        },
        Receiver { shared },
    )
}

impl<T> Sender<T> {
    /// Append a message at the tail, blocking while the queue is full.
    pub fn send(&self, value: T) {
        let mut queue = self
            .shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while queue.len() >= self.shared.capacity {
            queue = self
                .shared
                .not_full
                .wait(queue)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        queue.push_back(value);
        self.shared.not_empty.notify_one();
    }

    /// Queue a message at the head, blocking while the queue is full.
    ///
    /// Deliberate priority inversion: used to keep AP-lifecycle commands
    /// responsive ahead of already-queued work.
    pub fn send_front(&self, value: T) {
        let mut queue = self
            .shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while queue.len() >= self.shared.capacity {
            queue = self
                .shared
                .not_full
                .wait(queue)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        queue.push_front(value);
        self.shared.not_empty.notify_one();
    }
}

impl<T> Receiver<T> {
    /// Pop the next message, blocking indefinitely while the queue is
    /// empty. This is the manager's idle state.
    pub fn recv(&self) -> T {
        let mut queue = self
            .shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if let Some(value) = queue.pop_front() {
                self.shared.not_full.notify_one();
                return value;
            }
            queue = self
                .shared
                .not_empty
                .wait(queue)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Pop the next message if one is immediately available.
    pub fn try_recv(&self) -> Option<T> {
        let mut queue = self
            .shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let value = queue.pop_front();
        if value.is_some() {
            self.shared.not_full.notify_one();
        }
        value
    }
}
