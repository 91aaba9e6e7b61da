// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Fixed-size pools of codec-addressable buffers.
//!
//! A [`BufferPool`] owns `count` identically sized [`Region`]s. Each buffer
//! carries a use-mask recording which logical owners (the pipeline, the
//! codec) currently hold a reference. A buffer is handed out again only once
//! its mask is empty.
//!
//! All masks of a pool live in one [`Monitor`], so clearing a bit and waking
//! the threads blocked on "this pool has a free buffer" is a single guarded
//! operation, and a release in one pool never wakes waiters of another.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::ColorSpace;
use crate::memory::Region;
use crate::sync::{FlushFlag, Monitor};
use crate::{Error, Result};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Set of owners holding a reference on a pool buffer.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Owners(u8);

impl Owners {
    /// No owner: the buffer may be handed out.
    pub const NONE: Owners = Owners(0);
    /// The pipeline side (a transport is in flight downstream).
    pub const PIPELINE: Owners = Owners(0x1);
    /// The codec side (the hardware still reads or displays from it).
    pub const CODEC: Owners = Owners(0x2);
    /// Both owners.
    pub const ALL: Owners = Owners(0x3);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Owners) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Owners) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns `self` with the bits of `other` cleared.
    pub fn without(self, other: Owners) -> Owners {
        Owners(self.0 & !other.0)
    }
}

impl BitOr for Owners {
    type Output = Owners;

    fn bitor(self, rhs: Owners) -> Owners {
        Owners(self.0 | rhs.0)
    }
}

impl BitOrAssign for Owners {
    fn bitor_assign(&mut self, rhs: Owners) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Owners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Geometry of a buffer holding a video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphicsAttrs {
    pub width: u32,
    pub height: u32,
    /// Bytes per line, including padding.
    pub line_length: u32,
    pub color_space: ColorSpace,
}

impl GraphicsAttrs {
    /// Builds attributes with the line length derived from the color space.
    pub fn new(width: u32, height: u32, color_space: ColorSpace) -> Self {
        Self {
            width,
            height,
            line_length: color_space.line_length(width),
            color_space,
        }
    }

    /// Bytes needed to hold one frame with these attributes.
    pub fn frame_size(&self) -> usize {
        self.line_length as usize * self.height as usize
    }
}

/// Creation attributes shared by every buffer of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAttrs {
    /// Mask applied to a buffer when it is acquired.
    pub use_mask: Owners,
    pub graphics: Option<GraphicsAttrs>,
}

impl Default for BufferAttrs {
    fn default() -> Self {
        Self {
            use_mask: Owners::ALL,
            graphics: None,
        }
    }
}

struct Slot {
    region: Region,
    bytes_used: AtomicUsize,
    graphics: Mutex<Option<GraphicsAttrs>>,
}

#[derive(Debug)]
struct PoolState {
    masks: Vec<Owners>,
    interrupted: bool,
}

struct PoolShared {
    id: u64,
    size: usize,
    attrs: BufferAttrs,
    slots: Vec<Slot>,
    state: Monitor<PoolState>,
}

impl PoolShared {
    fn slot(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    /// Clears `owner` on buffer `index`; returns `true` if the buffer became free.
    fn clear(&self, index: usize, owner: Owners) -> Result<bool> {
        let mut state = self.state.lock()?;
        let mask = state
            .masks
            .get_mut(index)
            .ok_or_else(|| Error::Other(format!("buffer index {index} out of range")))?;
        *mask = mask.without(owner);
        trace!(pool = self.id, index, mask = ?*mask, "cleared {:?}", owner);
        Ok(mask.is_empty())
    }
}

/// A fixed set of identically sized buffers reused by availability.
///
/// Cloning the pool clones a handle; buffers keep the backing memory alive
/// for as long as any [`PoolBuffer`] referencing them exists.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Allocates `count` buffers of `size` bytes each.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] if any region cannot be reserved; no
    /// partially built pool is returned.
    pub fn create(count: usize, size: usize, attrs: BufferAttrs) -> Result<Self> {
        if count == 0 {
            return Err(Error::Allocation("pool needs at least one buffer".into()));
        }
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            slots.push(Slot {
                region: Region::allocate(size)?,
                bytes_used: AtomicUsize::new(0),
                graphics: Mutex::new(attrs.graphics),
            });
        }
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        debug!(pool = id, count, size, "created buffer pool");
        Ok(Self {
            shared: Arc::new(PoolShared {
                id,
                size,
                attrs,
                slots,
                state: Monitor::new(PoolState {
                    masks: vec![Owners::NONE; count],
                    interrupted: false,
                }),
            }),
        })
    }

    /// Identifier used in log output.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Number of buffers in the pool.
    pub fn len(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.slots.is_empty()
    }

    /// Size in bytes of every buffer.
    pub fn buffer_size(&self) -> usize {
        self.shared.size
    }

    pub fn attrs(&self) -> BufferAttrs {
        self.shared.attrs
    }

    /// Returns a handle to buffer `index` regardless of its mask.
    pub fn get(&self, index: usize) -> Option<PoolBuffer> {
        (index < self.len()).then(|| PoolBuffer {
            shared: self.shared.clone(),
            index,
        })
    }

    /// Claims the first buffer whose use-mask is empty.
    ///
    /// Never blocks; returns `None` when every buffer is owned. The claimed
    /// buffer's mask is set to the pool's creation use-mask.
    pub fn acquire_free(&self) -> Result<Option<PoolBuffer>> {
        let mut state = self.shared.state.lock()?;
        Ok(self.claim(&mut state))
    }

    fn claim(&self, state: &mut PoolState) -> Option<PoolBuffer> {
        let index = state.masks.iter().position(|mask| mask.is_empty())?;
        state.masks[index] = self.shared.attrs.use_mask;
        self.shared
            .slot(index)
            .bytes_used
            .store(0, Ordering::Release);
        trace!(pool = self.shared.id, index, "acquired buffer");
        Some(PoolBuffer {
            shared: self.shared.clone(),
            index,
        })
    }

    /// Blocks until a buffer is free and claims it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] if the pool was interrupted (see
    /// [`Self::interrupt`]) or `flushing` is raised while waiting.
    pub fn wait_free(&self, flushing: Option<&FlushFlag>) -> Result<PoolBuffer> {
        self.shared.state.wait_for(|state| {
            if state.interrupted || flushing.is_some_and(FlushFlag::is_raised) {
                return Some(Err(Error::Interrupted));
            }
            self.claim(state).map(Ok)
        })?
    }

    /// Clears `owner` on `buffer` and wakes this pool's waiters if it became free.
    ///
    /// Safe to call from any thread.
    pub fn mark_released(&self, buffer: &PoolBuffer, owner: Owners) -> Result<bool> {
        if !Arc::ptr_eq(&self.shared, &buffer.shared) {
            return Err(Error::ProtocolViolation(format!(
                "buffer {} of pool {} released into pool {}",
                buffer.index, buffer.shared.id, self.shared.id
            )));
        }
        buffer.release(owner)
    }

    /// Clears `owner` on every buffer, e.g. once the codec holding them is gone.
    pub fn release_all(&self, owner: Owners) -> Result<()> {
        self.shared.state.update(|state| {
            for mask in state.masks.iter_mut() {
                *mask = mask.without(owner);
            }
        })
    }

    /// Current use-mask of every buffer.
    pub fn masks(&self) -> Result<Vec<Owners>> {
        Ok(self.shared.state.lock()?.masks.clone())
    }

    /// Number of buffers with an empty use-mask.
    pub fn free_count(&self) -> Result<usize> {
        Ok(self
            .shared
            .state
            .lock()?
            .masks
            .iter()
            .filter(|mask| mask.is_empty())
            .count())
    }

    /// Makes every current and future [`Self::wait_free`] return
    /// [`Error::Interrupted`] until [`Self::resume`].
    pub fn interrupt(&self) -> Result<()> {
        self.shared.state.update(|state| state.interrupted = true)
    }

    pub fn resume(&self) -> Result<()> {
        self.shared.state.update(|state| state.interrupted = false)
    }

    /// Wakes every waiter so it re-checks its wait condition.
    pub fn wake_all(&self) {
        self.shared.state.notify_all();
    }

    /// Handle that lets a transport wake one waiter of this pool.
    pub fn wait_handle(&self) -> WaitHandle {
        WaitHandle {
            shared: self.shared.clone(),
        }
    }

    /// Destroys the pool once no buffer is held by the codec.
    ///
    /// Blocks until every codec reference has been released. Buffers still
    /// in flight downstream keep their memory alive until their transports
    /// are finalized.
    pub fn destroy(self) -> Result<()> {
        self.shared.state.wait_for(|state| {
            (!state
                .masks
                .iter()
                .any(|mask| mask.intersects(Owners::CODEC)))
            .then_some(())
        })?;
        debug!(pool = self.shared.id, "destroyed buffer pool");
        Ok(())
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.shared.id)
            .field("count", &self.len())
            .field("size", &self.shared.size)
            .finish()
    }
}

/// Lets the holder wake exactly one thread waiting for a free buffer.
#[derive(Clone)]
pub struct WaitHandle {
    shared: Arc<PoolShared>,
}

impl WaitHandle {
    pub fn wake_one(&self) {
        self.shared.state.notify_one();
    }

    /// Returns `true` if `buffer` belongs to the pool this handle wakes.
    pub fn is_for(&self, buffer: &PoolBuffer) -> bool {
        Arc::ptr_eq(&self.shared, &buffer.shared)
    }
}

impl fmt::Debug for WaitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WaitHandle(pool {})", self.shared.id)
    }
}

/// Handle to one buffer of a [`BufferPool`].
///
/// Handles are cheap to clone; ownership is tracked by the use-mask, not by
/// the number of handles.
#[derive(Clone)]
pub struct PoolBuffer {
    shared: Arc<PoolShared>,
    index: usize,
}

impl PoolBuffer {
    /// Position of the buffer inside its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Identifier of the owning pool.
    pub fn pool_id(&self) -> u64 {
        self.shared.id
    }

    /// Capacity in bytes.
    pub fn size(&self) -> usize {
        self.shared.size
    }

    pub fn bytes_used(&self) -> usize {
        self.shared.slot(self.index).bytes_used.load(Ordering::Acquire)
    }

    pub fn set_bytes_used(&self, bytes: usize) {
        self.shared
            .slot(self.index)
            .bytes_used
            .store(bytes.min(self.size()), Ordering::Release);
    }

    /// Base address of the buffer, `None` if it has no region.
    pub fn as_ptr(&self) -> Option<std::ptr::NonNull<u8>> {
        self.shared.slot(self.index).region.as_ptr()
    }

    /// Current use-mask.
    pub fn mask(&self) -> Result<Owners> {
        Ok(self.shared.state.lock()?.masks[self.index])
    }

    pub fn graphics(&self) -> Option<GraphicsAttrs> {
        self.shared
            .slot(self.index)
            .graphics
            .lock()
            .ok()
            .and_then(|attrs| *attrs)
    }

    /// Records the geometry of the frame the codec wrote into this buffer.
    pub fn set_graphics(&self, attrs: GraphicsAttrs) -> Result<()> {
        *self
            .shared
            .slot(self.index)
            .graphics
            .lock()
            .map_err(|_| Error::poisoned("buffer graphics"))? = Some(attrs);
        Ok(())
    }

    /// The used bytes of the buffer.
    ///
    /// # Safety
    ///
    /// No owner may be writing the buffer while the slice is alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        unsafe { self.shared.slot(self.index).region.slice(0, self.bytes_used()) }
    }

    /// The whole buffer, writable.
    ///
    /// # Safety
    ///
    /// The caller must be the only owner touching the bytes for the lifetime
    /// of the slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        unsafe { self.shared.slot(self.index).region.slice_mut(0, self.size()) }
    }

    /// Copies `src` to the start of the buffer and records it as used.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Capacity`] if `src` does not fit.
    pub fn fill(&self, src: &[u8]) -> Result<usize> {
        if src.len() > self.size() {
            return Err(Error::Capacity {
                needed: src.len(),
                available: self.size(),
            });
        }
        // SAFETY: filling happens right after acquisition, before the buffer
        // is shared with the codec or downstream.
        unsafe { self.as_mut_slice()[..src.len()].copy_from_slice(src) };
        self.set_bytes_used(src.len());
        Ok(src.len())
    }

    /// Clears `owner` and wakes every waiter of this pool.
    ///
    /// [`BufferPool::destroy`] sleeps on the same monitor as
    /// [`BufferPool::wait_free`] callers and must see every cleared codec
    /// bit, so this is a broadcast. A finalized
    /// [`Transport`](crate::Transport) only clears the pipeline bit and
    /// wakes a single waiter.
    pub fn release(&self, owner: Owners) -> Result<bool> {
        let freed = self.shared.state.update(|state| {
            let mask = &mut state.masks[self.index];
            *mask = mask.without(owner);
            trace!(pool = self.shared.id, index = self.index, mask = ?*mask, "released {:?}", owner);
            mask.is_empty()
        })?;
        Ok(freed)
    }

    /// Clears `owner` without waking anyone; returns `true` if the buffer became free.
    pub(crate) fn clear_owner(&self, owner: Owners) -> Result<bool> {
        self.shared.clear(self.index, owner)
    }

    /// Returns `true` if both handles refer to the same buffer.
    pub fn same_buffer(&self, other: &PoolBuffer) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared) && self.index == other.index
    }

    pub fn belongs_to(&self, pool: &BufferPool) -> bool {
        Arc::ptr_eq(&self.shared, &pool.shared)
    }
}

impl PartialEq for PoolBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.same_buffer(other)
    }
}

impl Eq for PoolBuffer {}

impl fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("pool", &self.shared.id)
            .field("index", &self.index)
            .field("bytes_used", &self.bytes_used())
            .finish()
    }
}
