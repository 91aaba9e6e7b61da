// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Bounded hand-off queue between the pipeline thread and the decode worker.

use std::collections::VecDeque;

use tracing::trace;

use crate::sync::Monitor;
use crate::{Error, Result};

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    capacity: usize,
    /// The consumer popped an item and has not finished with it yet.
    busy: bool,
    closed: bool,
}

/// A bounded FIFO with a non-blocking push and a blocking pop.
///
/// Besides ordering, the queue is the flush rendezvous: a flushing thread
/// waits in [`Self::wait_drained`] until the consumer has emptied the queue
/// and finished the item it was holding.
#[derive(Debug)]
pub struct WorkQueue<T> {
    state: Monitor<QueueState<T>>,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Monitor::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                capacity,
                busy: false,
                closed: false,
            }),
        }
    }

    /// Appends `item` without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Capacity`] when the queue is full and
    /// [`Error::Interrupted`] once it has been closed.
    pub fn push(&self, item: T) -> Result<()> {
        self.state.update(|state| {
            if state.closed {
                return Err(Error::Interrupted);
            }
            if state.items.len() >= state.capacity {
                return Err(Error::Capacity {
                    needed: state.items.len() + 1,
                    available: state.capacity,
                });
            }
            state.items.push_back(item);
            trace!(len = state.items.len(), "queued work item");
            Ok(())
        })?
    }

    /// Blocks until an item is available and marks the consumer busy.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub fn pop(&self) -> Result<Option<T>> {
        self.state.wait_for(|state| match state.items.pop_front() {
            Some(item) => {
                state.busy = true;
                Some(Some(item))
            }
            None if state.closed => Some(None),
            None => None,
        })
    }

    /// Removes the front item without blocking or marking anyone busy.
    pub fn try_pop(&self) -> Result<Option<T>> {
        let item = self.state.update(|state| state.items.pop_front())?;
        Ok(item)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.state.lock()?.items.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.state.lock()?.items.is_empty())
    }

    /// Called by the consumer once it is done with the item it popped.
    pub fn notify_drained(&self) -> Result<()> {
        self.state.update(|state| state.busy = false)
    }

    /// Blocks until the queue is empty and the consumer is idle, or the
    /// queue was closed.
    pub fn wait_drained(&self) -> Result<()> {
        self.state
            .wait_for(|state| (state.closed || (state.items.is_empty() && !state.busy)).then_some(()))
    }

    /// Rejects further pushes; pending pops return what is left, then `None`.
    pub fn close(&self) -> Result<()> {
        self.state.update(|state| {
            state.closed = true;
            state.busy = false;
        })
    }

    pub fn is_closed(&self) -> Result<bool> {
        Ok(self.state.lock()?.closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn pops_in_push_order() {
        let queue = WorkQueue::new(4);
        for item in ["a", "b", "c"] {
            queue.push(item).unwrap();
        }
        assert_eq!(queue.pop().unwrap(), Some("a"));
        assert_eq!(queue.pop().unwrap(), Some("b"));
        assert_eq!(queue.try_pop().unwrap(), Some("c"));
        assert_eq!(queue.try_pop().unwrap(), None);
    }

    #[test]
    fn push_into_full_queue_fails_without_blocking() {
        let queue = WorkQueue::new(1);
        queue.push(1).unwrap();
        assert!(matches!(queue.push(2), Err(Error::Capacity { .. })));
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let queue = Arc::new(WorkQueue::<u32>::new(2));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.close().unwrap();
        assert_eq!(consumer.join().unwrap().unwrap(), None);
        assert!(matches!(queue.push(1), Err(Error::Interrupted)));
    }

    #[test]
    fn drained_waits_for_consumer_to_finish_last_item() {
        let queue = Arc::new(WorkQueue::new(4));
        queue.push(1).unwrap();
        queue.push(2).unwrap();

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                while seen.len() < 2 {
                    if let Some(item) = queue.pop().unwrap() {
                        thread::sleep(Duration::from_millis(10));
                        seen.push(item);
                        queue.notify_drained().unwrap();
                    }
                }
                seen
            })
        };

        queue.wait_drained().unwrap();
        assert!(queue.is_empty().unwrap());
        assert_eq!(consumer.join().unwrap(), vec![1, 2]);
    }
}
