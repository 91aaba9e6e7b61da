// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Blocking primitives shared by the pool, the FIFO and the encoder ring.
//!
//! Every resource that a thread may have to wait on (a free pool buffer,
//! ring space, an empty FIFO during a flush) is expressed as state guarded by
//! a [`Monitor`]: mutate under the lock, then wake, and wait on a predicate
//! evaluated under the same lock. Because the predicate is always re-checked
//! while holding the mutex, a wake issued between a waiter's check and its
//! sleep cannot be lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::{Error, Result};

/// State guarded by a mutex plus the condition used to wait on it.
#[derive(Debug, Default)]
pub struct Monitor<T> {
    state: Mutex<T>,
    cond: Condvar,
}

impl<T> Monitor<T> {
    /// Creates a monitor around `state`.
    pub fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
            cond: Condvar::new(),
        }
    }

    /// Locks the state without waking anyone.
    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        self.state.lock().map_err(|_| Error::poisoned("monitor"))
    }

    /// Mutates the state and wakes every waiter.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let result = {
            let mut guard = self.lock()?;
            f(&mut guard)
        };
        self.cond.notify_all();
        Ok(result)
    }

    /// Wakes every waiter so it re-evaluates its predicate.
    pub fn notify_all(&self) {
        self.cond.notify_all();
    }

    /// Wakes one waiter.
    pub fn notify_one(&self) {
        self.cond.notify_one();
    }

    /// Blocks until `ready` yields a value.
    ///
    /// `ready` runs under the lock each time the monitor is signalled and may
    /// mutate the state (e.g. to claim the resource it was waiting for).
    pub fn wait_for<R>(&self, mut ready: impl FnMut(&mut T) -> Option<R>) -> Result<R> {
        let mut guard = self.lock()?;
        loop {
            if let Some(value) = ready(&mut guard) {
                return Ok(value);
            }
            guard = self
                .cond
                .wait(guard)
                .map_err(|_| Error::poisoned("monitor"))?;
        }
    }

    /// Like [`Self::wait_for`] but gives up after `timeout`, returning `None`.
    pub fn wait_for_timeout<R>(
        &self,
        timeout: Duration,
        mut ready: impl FnMut(&mut T) -> Option<R>,
    ) -> Result<Option<R>> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock()?;
        loop {
            if let Some(value) = ready(&mut guard) {
                return Ok(Some(value));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            guard = self
                .cond
                .wait_timeout(guard, deadline - now)
                .map_err(|_| Error::poisoned("monitor"))?
                .0;
        }
    }
}

/// Flushing flag shared between the pipeline thread and the parser.
///
/// Raised from the event thread while the streaming thread may be in the
/// middle of a scan, so it lives outside any lock.
#[derive(Debug, Clone, Default)]
pub struct FlushFlag(Arc<AtomicBool>);

impl FlushFlag {
    /// Creates a lowered flag.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
