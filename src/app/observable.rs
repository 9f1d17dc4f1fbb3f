//! Attach/detach value streams.
//!
//! An [`Observable`] keeps the last published value and replays it to every
//! new subscriber before any later update, so a late observer never misses the
//! current state. Subscribers detach by dropping their [`Subscription`]; dead
//! receivers are pruned on the next publish.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Subscription<T> {
    rx: Receiver<T>,
}

impl<T> Subscription<T> {
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn recv(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Some(value),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Drains pending updates and returns the newest one.
    pub fn latest(&self) -> Option<T> {
        let mut newest = None;
        while let Ok(value) = self.rx.try_recv() {
            newest = Some(value);
        }
        newest
    }

    /// Waits until an update satisfies `predicate`.
    pub fn wait_for(&self, timeout: Duration, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let value = self.recv_timeout(remaining)?;
            if predicate(&value) {
                return Some(value);
            }
        }
    }
}

impl<T> Iterator for Subscription<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.rx.recv().ok()
    }
}

/// Fan-out list of subscriber channels. Callers serialize access.
pub(crate) struct Subscribers<T> {
    senders: Vec<Sender<T>>,
}

impl<T: Clone> Subscribers<T> {
    pub(crate) fn new() -> Self {
        Self {
            senders: Vec::new(),
        }
    }

    pub(crate) fn attach(&mut self, replay: impl IntoIterator<Item = T>) -> Subscription<T> {
        let (tx, rx) = mpsc::channel();
        for value in replay {
            let _ = tx.send(value);
        }
        self.senders.push(tx);
        Subscription { rx }
    }

    pub(crate) fn broadcast(&mut self, value: &T) {
        self.senders.retain(|tx| tx.send(value.clone()).is_ok());
    }

    pub(crate) fn len(&self) -> usize {
        self.senders.len()
    }
}

struct ObservableInner<T> {
    value: T,
    subscribers: Subscribers<T>,
}

pub struct Observable<T> {
    inner: Arc<Mutex<ObservableInner<T>>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Observable<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ObservableInner {
                value: initial,
                subscribers: Subscribers::new(),
            })),
        }
    }

    pub fn get(&self) -> T {
        lock(&self.inner).value.clone()
    }

    pub fn set(&self, value: T) {
        let mut guard = lock(&self.inner);
        guard.subscribers.broadcast(&value);
        guard.value = value;
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let mut guard = lock(&self.inner);
        let current = guard.value.clone();
        guard.subscribers.attach(Some(current))
    }

    /// Counts attached receivers, including ones dropped since the last publish.
    pub fn observer_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }
}

impl<T: Clone + PartialEq> Observable<T> {
    /// Publishes only when the value differs. Returns whether it did.
    pub fn set_if_changed(&self, value: T) -> bool {
        let mut guard = lock(&self.inner);
        if guard.value == value {
            return false;
        }
        guard.subscribers.broadcast(&value);
        guard.value = value;
        true
    }
}
