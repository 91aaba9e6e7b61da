// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Circular output region shared by every encoded frame.
//!
//! Frames are carved out of one region at `head` and handed downstream as
//! [`Transport`] views. Downstream must release them in allocation order;
//! each release moves `tail` past the frame. When the head cannot fit one
//! more frame before the end of the region it wraps to 0 and `head_wrap`
//! remembers where the valid data ends.
//!
//! ```text
//!  0            tail              head        head_wrap  size
//!  |   free     |### in flight ###|    free   |          |
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, error, trace};

use crate::memory::Region;
use crate::sync::{FlushFlag, Monitor};
use crate::transport::Transport;
use crate::{Error, Result};

#[derive(Debug)]
struct RingState {
    head: usize,
    tail: usize,
    head_wrap: usize,
    /// `(offset, len)` of every region handed out and not yet released.
    outstanding: VecDeque<(usize, usize)>,
    violation: Option<String>,
}

impl RingState {
    fn new(size: usize) -> Self {
        Self {
            head: 0,
            tail: 0,
            head_wrap: size,
            outstanding: VecDeque::new(),
            violation: None,
        }
    }

    /// Contiguous bytes free at `head`, wrapping the head when fewer than
    /// `need` bytes are left before the end of the region.
    fn space(&mut self, size: usize, need: usize) -> usize {
        if self.outstanding.is_empty() {
            self.head = 0;
            self.tail = 0;
            self.head_wrap = size;
            return size;
        }
        if self.head > self.tail {
            let room = size - self.head;
            if room >= need {
                return room;
            }
            trace!(head = self.head, tail = self.tail, "wrapping the head");
            self.head_wrap = self.head;
            self.head = 0;
        }
        // The head is behind the tail: free space ends where in-flight data starts.
        self.tail - self.head
    }

    fn release(&mut self, size: usize, offset: usize, len: usize) -> Result<()> {
        match self.outstanding.front() {
            Some(&(front, front_len)) if front == offset && front_len == len => {}
            other => {
                let reason = format!(
                    "released region {offset}+{len} but the oldest outstanding one is {other:?}"
                );
                self.violation = Some(reason.clone());
                return Err(Error::ProtocolViolation(reason));
            }
        }
        self.outstanding.pop_front();
        self.tail = offset + len;
        if self.tail >= self.head_wrap {
            self.head_wrap = size;
            self.tail = 0;
        }
        if self.outstanding.is_empty() {
            self.head = 0;
            self.tail = 0;
            self.head_wrap = size;
        }
        trace!(tail = self.tail, outstanding = self.outstanding.len(), "released ring region");
        Ok(())
    }

    fn check(&self) -> Result<()> {
        match &self.violation {
            Some(reason) => Err(Error::ProtocolViolation(reason.clone())),
            None => Ok(()),
        }
    }
}

struct RingShared {
    region: Arc<Region>,
    state: Monitor<RingState>,
}

/// A space reserved at the head of the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSlot {
    pub offset: usize,
    pub capacity: usize,
}

/// The encoder's output ring. Cloning shares the ring.
#[derive(Clone)]
pub struct OutputRing {
    shared: Arc<RingShared>,
}

impl OutputRing {
    /// Allocates a ring of `size` bytes.
    pub fn new(size: usize) -> Result<Self> {
        let region = Region::allocate(size)?;
        if region.as_ptr().is_none() {
            return Err(Error::Allocation("output ring needs a non-empty region".into()));
        }
        debug!(size, "created output ring");
        Ok(Self {
            shared: Arc::new(RingShared {
                region: Arc::new(region),
                state: Monitor::new(RingState::new(size)),
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.shared.region.len()
    }

    /// Blocks until `need` contiguous bytes are free at the head.
    ///
    /// # Errors
    ///
    /// [`Error::Capacity`] if `need` exceeds the ring, [`Error::Interrupted`]
    /// if `flushing` is raised while waiting, and the recorded
    /// [`Error::ProtocolViolation`] after an out-of-order release.
    pub fn acquire(&self, need: usize, flushing: &FlushFlag) -> Result<RingSlot> {
        let size = self.size();
        if need > size {
            return Err(Error::Capacity {
                needed: need,
                available: size,
            });
        }
        self.shared.state.wait_for(|state| {
            if let Err(err) = state.check() {
                return Some(Err(err));
            }
            if flushing.is_raised() {
                return Some(Err(Error::Interrupted));
            }
            let space = state.space(size, need);
            if space < need {
                trace!(space, need, "waiting for ring space");
                return None;
            }
            Some(Ok(RingSlot {
                offset: state.head,
                capacity: space,
            }))
        })?
    }

    /// Writable view of a slot returned by [`Self::acquire`].
    ///
    /// # Safety
    ///
    /// `slot` must come from the latest `acquire` on this ring and must not
    /// have been committed yet.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slot_mut(&self, slot: RingSlot) -> &mut [u8] {
        unsafe { self.shared.region.slice_mut(slot.offset, slot.capacity) }
    }

    /// Hands `len` bytes at `offset` downstream and advances the head.
    ///
    /// The returned transport releases the region when dropped.
    pub fn commit(&self, offset: usize, len: usize) -> Result<Transport> {
        let mut transport = Transport::view(self.shared.region.clone(), offset, len)?;
        self.shared.state.update(|state| {
            state.outstanding.push_back((offset, len));
            state.head = offset + len;
            trace!(head = state.head, tail = state.tail, len, "committed ring region");
        })?;

        let shared = self.shared.clone();
        transport.set_release_callback(Box::new(move |transport| {
            let size = shared.region.len();
            let (offset, len) = (transport.offset(), transport.len());
            let released = shared
                .state
                .update(|state| state.release(size, offset, len))?;
            if let Err(err) = &released {
                error!("Out of order ring release: {}", err);
            }
            released
        }));
        Ok(transport)
    }

    /// Number of regions still held downstream.
    pub fn outstanding(&self) -> Result<usize> {
        Ok(self.shared.state.lock()?.outstanding.len())
    }

    /// Current `(head, tail)` offsets.
    pub fn positions(&self) -> Result<(usize, usize)> {
        let state = self.shared.state.lock()?;
        Ok((state.head, state.tail))
    }

    /// Wakes a producer blocked in [`Self::acquire`] so it re-checks its flag.
    pub fn wake(&self) {
        self.shared.state.notify_all();
    }

    /// Blocks until every committed region has been released.
    pub fn wait_idle(&self) -> Result<()> {
        self.shared.state.wait_for(|state| {
            if let Err(err) = state.check() {
                return Some(Err(err));
            }
            state.outstanding.is_empty().then_some(Ok(()))
        })?
    }
}
