//! Thread-safe FIFO of bus requests.
//!
//! Client threads push requests and wait for their completion, the bus
//! worker consumes them; both sides are decoupled by a mutex-protected
//! deque with a condition variable broadcast on every push and removal.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use super::request::BusRequest;

/// A FIFO of [`BusRequest`] boxes supporting removal by request id.
#[derive(Default)]
pub struct RequestQueue {
    inner: Mutex<VecDeque<Box<BusRequest>>>,
    cond: Condvar,
}

impl RequestQueue {
    pub fn new() -> Self {
        RequestQueue::default()
    }

    /// Append a request at the tail.
    pub fn push(&self, request: Box<BusRequest>) {
        self.inner.lock().unwrap().push_back(request);
        self.cond.notify_all();
    }

    /// Prepend a request at the head (re-queueing after lost arbitration
    /// keeps FIFO order for the remaining requests).
    pub fn push_front(&self, request: Box<BusRequest>) {
        self.inner.lock().unwrap().push_front(request);
        self.cond.notify_all();
    }

    /// Remove and return the head, or `None` when empty.
    pub fn pop(&self) -> Option<Box<BusRequest>> {
        let popped = self.inner.lock().unwrap().pop_front();
        if popped.is_some() {
            self.cond.notify_all();
        }
        popped
    }

    /// Returns whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Returns the number of queued requests.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Remove the request with the given id, or `None` if it is not queued
    /// (e.g. already owned by the bus worker).
    pub fn remove(&self, id: u64) -> Option<Box<BusRequest>> {
        let mut inner = self.inner.lock().unwrap();
        let pos = inner.iter().position(|r| r.id == id)?;
        let removed = inner.remove(pos);
        if removed.is_some() {
            self.cond.notify_all();
        }
        removed
    }

    /// Wait until the request with the given id appears, remove and return
    /// it, or `None` on timeout.
    pub fn remove_wait(&self, id: u64, timeout: Duration) -> Option<Box<BusRequest>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(pos) = inner.iter().position(|r| r.id == id) {
                let removed = inner.remove(pos);
                self.cond.notify_all();
                return removed;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self.cond.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
            if result.timed_out() && !inner.iter().any(|r| r.id == id) {
                return None;
            }
        }
    }

    /// Remove and return all queued requests.
    pub fn drain(&self) -> Vec<Box<BusRequest>> {
        let mut inner = self.inner.lock().unwrap();
        let drained: Vec<_> = inner.drain(..).collect();
        if !drained.is_empty() {
            self.cond.notify_all();
        }
        drained
    }
}
