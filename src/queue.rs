use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use concurrent_queue::{ConcurrentQueue, PopError, PushError};

use crate::waker::Waker;
use crate::{Poller, Token};

/// An MPMC queue that is itself pollable: pushing onto an empty queue
/// arms its `Waker`, and draining it back to empty disarms it.
///
/// `Pump` and `Worker` both hand work to each other through a `Queue`
/// rather than shared-state locking: a pump accepts a connection, then
/// pushes the new dev onto a worker's queue instead of calling into the
/// worker directly. `pending` tracks how many pushes have not yet been
/// matched by a pop, independent of the underlying `ConcurrentQueue`'s own
/// length, purely to decide when the readiness edge needs re-arming.
pub struct EventQueue<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    queue: ConcurrentQueue<T>,
    pending: AtomicUsize,
    waker: Waker,
}

impl<T> EventQueue<T> {
    pub fn new(poller: &Poller, token: Token) -> io::Result<EventQueue<T>> {
        Ok(EventQueue {
            inner: Arc::new(Inner {
                queue: ConcurrentQueue::unbounded(),
                pending: AtomicUsize::new(0),
                waker: Waker::new(poller, token)?,
            }),
        })
    }

    pub fn push(&self, value: T) -> Result<(), PushError<T>> {
        self.inner.queue.push(value)?;
        if self.inner.pending.fetch_add(1, Ordering::AcqRel) == 0 {
            let _ = self.inner.waker.wake();
        }
        Ok(())
    }

    pub fn pop(&self) -> Result<T, PopError> {
        let value = self.inner.queue.pop()?;
        self.inner.pending.fetch_sub(1, Ordering::AcqRel);
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    /// Called once per dispatch-loop iteration after the queue's token
    /// fires, to drop the wake-up edge before draining.
    pub fn ack(&self) -> io::Result<()> {
        self.inner.waker.reset()
    }

    /// Arms the queue's waker without pushing any value, for callers that
    /// only need to interrupt the consumer's `poller.dispatch` (e.g.
    /// `core.stop()` broadcasting quit).
    pub fn wake(&self) -> io::Result<()> {
        self.inner.waker.wake()
    }
}

impl<T> Clone for EventQueue<T> {
    fn clone(&self) -> EventQueue<T> {
        EventQueue {
            inner: self.inner.clone(),
        }
    }
}
