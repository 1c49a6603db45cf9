//! Cancellable multi-producer / single-consumer handoff queue.
//!
//! Producers call [`HandoffQueue::enqueue`] from any thread; it never blocks
//! on I/O and never fails. The single consumer awaits
//! [`HandoffQueue::take_batch`], which hands over everything buffered at
//! once. [`HandoffQueue::cancel`] closes the queue: the consumer receives
//! whatever is still buffered, then an empty batch, and never suspends again.
//!
//! ```text
//!  producer ──enqueue──┐
//!  producer ──enqueue──┼──► [ Mutex<Vec<T>> + closed ] ──take_batch──► consumer
//!  producer ──enqueue──┘              │
//!                                  Notify (one stored permit)
//! ```
//!
//! The wake-up uses [`Notify::notify_one`], which stores a permit when the
//! consumer is not currently parked. An `enqueue` that lands between the
//! consumer's emptiness check and its `.await` therefore completes that same
//! wait instead of being missed until the next item arrives.

use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

#[derive(Debug)]
struct State<T> {
    items: Vec<T>,
    closed: bool,
}

/// Unbounded buffer between result producers and the reporting consumer.
#[derive(Debug)]
pub struct HandoffQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T> HandoffQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: Vec::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    // A producer that panicked mid-push leaves the Vec intact, so a poisoned
    // lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends an item and wakes the consumer.
    ///
    /// Items enqueued after [`cancel`](Self::cancel) are still buffered and
    /// returned by the next `take_batch`.
    pub fn enqueue(&self, item: T) {
        self.lock().items.push(item);
        self.notify.notify_one();
    }

    /// Appends an item unless the queue is cancelled, handing it back if so.
    ///
    /// The closed check and the push happen under one lock, so an item is
    /// either returned by a later `take_batch` or refused here.
    pub fn try_enqueue(&self, item: T) -> Result<(), T> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(item);
            }
            state.items.push(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Waits for at least one item or cancellation, then takes everything.
    ///
    /// Returns an empty `Vec` only when the queue is cancelled and drained.
    pub async fn take_batch(&self) -> Vec<T> {
        loop {
            {
                let mut state = self.lock();
                if !state.items.is_empty() {
                    return std::mem::take(&mut state.items);
                }
                if state.closed {
                    return Vec::new();
                }
            }
            self.notify.notified().await;
        }
    }

    /// Takes everything buffered right now without waiting.
    pub fn try_take_batch(&self) -> Vec<T> {
        std::mem::take(&mut self.lock().items)
    }

    /// Closes the queue and wakes a suspended consumer. Idempotent.
    pub fn cancel(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}

impl<T> Default for HandoffQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
