//! Cooperative building blocks for handing work back to the pump thread.
//!
//! The transport itself never uses these: a [`Connection`](crate::Connection)
//! is driven from one thread. Applications that do blocking work elsewhere
//! can run it on a [`WorkerThread`] and collect results from their pump loop.

use crossbeam::channel::{self, Receiver, Sender};
use std::io;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Counting semaphore.
#[derive(Debug)]
pub struct Semaphore {
    available: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(resources: usize) -> Self {
        Self {
            available: Mutex::new(resources),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.available.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a resource is free and take it.
    pub fn acquire(&self) {
        let mut available = self.lock();
        while *available == 0 {
            available = self
                .cond
                .wait(available)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *available -= 1;
    }

    /// Take a resource if one is free right now.
    pub fn try_acquire(&self) -> bool {
        let mut available = self.lock();
        if *available == 0 {
            return false;
        }
        *available -= 1;
        true
    }

    /// Wait at most `timeout` for a resource.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let available = self.lock();
        let (mut available, _) = self
            .cond
            .wait_timeout_while(available, timeout, |n| *n == 0)
            .unwrap_or_else(PoisonError::into_inner);
        if *available == 0 {
            return false;
        }
        *available -= 1;
        true
    }

    pub fn release(&self) {
        *self.lock() += 1;
        self.cond.notify_one();
    }

    pub fn available(&self) -> usize {
        *self.lock()
    }

    /// Acquire and release automatically when the guard drops.
    pub fn guard(&self) -> SemaphoreGuard<'_> {
        self.acquire();
        SemaphoreGuard { semaphore: self }
    }
}

pub struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// A named thread that reports results over a channel.
pub struct WorkerThread<T> {
    handle: Option<JoinHandle<()>>,
    results: Receiver<T>,
}

impl<T: Send + 'static> WorkerThread<T> {
    /// Start `work` on a new thread. It receives the sending half of the
    /// result channel.
    pub fn spawn<F>(name: &str, work: F) -> io::Result<Self>
    where
        F: FnOnce(Sender<T>) + Send + 'static,
    {
        let (tx, rx) = channel::unbounded();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || work(tx))?;
        Ok(Self {
            handle: Some(handle),
            results: rx,
        })
    }

    /// Next result, if one is ready.
    pub fn try_recv(&self) -> Option<T> {
        self.results.try_recv().ok()
    }

    /// Drain every result that is ready.
    pub fn drain(&self) -> Vec<T> {
        self.results.try_iter().collect()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the thread to exit. Returns `false` if it panicked.
    pub fn join(mut self) -> bool {
        self.handle.take().map_or(true, |h| h.join().is_ok())
    }
}
