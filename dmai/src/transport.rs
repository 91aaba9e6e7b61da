// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Pipeline-visible wrappers around codec buffers.
//!
//! A [`Transport`] is what travels downstream. Dropping the last transport
//! for a buffer finalizes it:
//!
//! 1. the release callback runs, while the wrapped buffer is still owned;
//! 2. a pool buffer loses its pipeline owner bit and, if that left the
//!    use-mask empty and a [`WaitHandle`] was supplied, one waiter of the
//!    pool is woken;
//! 3. a plain buffer is freed outright.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, trace};

use crate::memory::Region;
use crate::pool::{Owners, PoolBuffer, WaitHandle};
use crate::{Error, Result};

/// Callback invoked once when a transport is finalized.
pub type ReleaseCallback = Box<dyn FnOnce(&Transport) -> Result<()> + Send>;

/// Timing and flags carried alongside the payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameMeta {
    pub pts: Option<Duration>,
    pub duration: Option<Duration>,
    /// The frame depends on previous frames (not a key frame).
    pub delta_unit: bool,
    pub discont: bool,
}

/// What a transport wraps.
pub enum BufferKind {
    /// A buffer owned by a pool; returned to it on finalize.
    Pool {
        buffer: PoolBuffer,
        wait: Option<WaitHandle>,
    },
    /// An ad-hoc region, or a window into one, freed when the last view goes.
    Plain {
        region: Arc<Region>,
        offset: usize,
        len: usize,
    },
}

impl fmt::Debug for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferKind::Pool { buffer, wait } => f
                .debug_struct("Pool")
                .field("buffer", buffer)
                .field("wait", wait)
                .finish(),
            BufferKind::Plain { offset, len, .. } => f
                .debug_struct("Plain")
                .field("offset", offset)
                .field("len", len)
                .finish(),
        }
    }
}

/// A finalizable handle on one codec buffer.
pub struct Transport {
    kind: BufferKind,
    meta: FrameMeta,
    release: Option<ReleaseCallback>,
}

impl Transport {
    /// Wraps a pool buffer that the pipeline now co-owns.
    ///
    /// The buffer's pipeline owner bit is cleared when the transport is
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NullData`] if the buffer has no memory.
    pub fn wrap(buffer: PoolBuffer, wait: Option<WaitHandle>) -> Result<Self> {
        if buffer.as_ptr().is_none() {
            return Err(Error::NullData);
        }
        trace!(pool = buffer.pool_id(), index = buffer.index(), "wrapping pool buffer");
        Ok(Self {
            kind: BufferKind::Pool { buffer, wait },
            meta: FrameMeta::default(),
            release: None,
        })
    }

    /// Copies `data` into a freshly allocated plain buffer.
    pub fn plain(data: &[u8]) -> Result<Self> {
        let region = Region::allocate(data.len())?;
        if region.as_ptr().is_none() {
            return Err(Error::NullData);
        }
        // SAFETY: the region was just allocated and is not shared yet.
        unsafe { region.slice_mut(0, data.len()).copy_from_slice(data) };
        Self::view(Arc::new(region), 0, data.len())
    }

    /// A window of `len` bytes at `offset` into a shared region.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NullData`] if the region has no memory and
    /// [`Error::Capacity`] if the window does not fit.
    pub fn view(region: Arc<Region>, offset: usize, len: usize) -> Result<Self> {
        if region.as_ptr().is_none() {
            return Err(Error::NullData);
        }
        if offset.checked_add(len).is_none_or(|end| end > region.len()) {
            return Err(Error::Capacity {
                needed: offset.saturating_add(len),
                available: region.len(),
            });
        }
        Ok(Self {
            kind: BufferKind::Plain {
                region,
                offset,
                len,
            },
            meta: FrameMeta::default(),
            release: None,
        })
    }

    /// Installs the callback run first thing on finalize, replacing any previous one.
    pub fn set_release_callback(&mut self, callback: ReleaseCallback) {
        self.release = Some(callback);
    }

    pub fn meta(&self) -> &FrameMeta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut FrameMeta {
        &mut self.meta
    }

    pub fn kind(&self) -> &BufferKind {
        &self.kind
    }

    /// The wrapped pool buffer, if any.
    pub fn pool_buffer(&self) -> Option<&PoolBuffer> {
        match &self.kind {
            BufferKind::Pool { buffer, .. } => Some(buffer),
            BufferKind::Plain { .. } => None,
        }
    }

    /// Offset of the payload inside its region.
    pub fn offset(&self) -> usize {
        match &self.kind {
            BufferKind::Pool { .. } => 0,
            BufferKind::Plain { offset, .. } => *offset,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match &self.kind {
            BufferKind::Pool { buffer, .. } => buffer.bytes_used(),
            BufferKind::Plain { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn finalize(&mut self) -> Result<()> {
        let released = match self.release.take() {
            Some(callback) => {
                trace!("running release callback");
                callback(self)
            }
            None => Ok(()),
        };
        match &self.kind {
            BufferKind::Pool { buffer, wait } => {
                let freed = buffer.clear_owner(Owners::PIPELINE)?;
                trace!(pool = buffer.pool_id(), index = buffer.index(), freed, "finalized transport");
                if freed && let Some(wait) = wait {
                    wait.wake_one();
                }
            }
            BufferKind::Plain { .. } => trace!("freeing plain buffer"),
        }
        released
    }
}

impl AsRef<[u8]> for Transport {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: the pipeline owner bit is held until drop; the codec only
        // keeps the buffer as a reference while it is displayed.
        match &self.kind {
            BufferKind::Pool { buffer, .. } => unsafe { buffer.as_slice() },
            BufferKind::Plain {
                region,
                offset,
                len,
            } => unsafe { region.slice(*offset, *len) },
        }
    }
}

impl AsMut<[u8]> for Transport {
    fn as_mut(&mut self) -> &mut [u8] {
        // SAFETY: see `as_ref`; a transport is the single pipeline-side handle.
        match &self.kind {
            BufferKind::Pool { buffer, .. } => {
                let used = buffer.bytes_used();
                unsafe { &mut buffer.as_mut_slice()[..used] }
            }
            BufferKind::Plain {
                region,
                offset,
                len,
            } => unsafe { region.slice_mut(*offset, *len) },
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Err(err) = self.finalize() {
            error!("Failed to finalize transport: {}", err);
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("kind", &self.kind)
            .field("meta", &self.meta)
            .field("has_release_callback", &self.release.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BufferAttrs, BufferPool};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn pool(count: usize) -> BufferPool {
        BufferPool::create(count, 32, BufferAttrs::default()).unwrap()
    }

    #[test]
    fn drop_clears_pipeline_bit_only() {
        let pool = pool(1);
        let buffer = pool.acquire_free().unwrap().unwrap();
        buffer.fill(b"frame").unwrap();

        let transport = Transport::wrap(buffer.clone(), Some(pool.wait_handle())).unwrap();
        assert_eq!(transport.as_ref(), b"frame");
        drop(transport);

        assert_eq!(buffer.mask().unwrap(), Owners::CODEC);
        assert!(pool.acquire_free().unwrap().is_none());
        buffer.release(Owners::CODEC).unwrap();
        assert!(pool.acquire_free().unwrap().is_some());
    }

    #[test]
    fn release_callback_runs_before_mask_clear() {
        let pool = pool(1);
        let buffer = pool.acquire_free().unwrap().unwrap();
        buffer.set_bytes_used(4);
        let seen = Arc::new(Mutex::new(None));

        let mut transport = Transport::wrap(buffer.clone(), None).unwrap();
        let recorder = seen.clone();
        transport.set_release_callback(Box::new(move |t| {
            let mask = t.pool_buffer().map(|b| b.mask()).transpose()?;
            *recorder.lock().unwrap() = mask;
            Ok(())
        }));
        drop(transport);

        assert_eq!(*seen.lock().unwrap(), Some(Owners::ALL));
        assert_eq!(buffer.mask().unwrap(), Owners::CODEC);
    }

    #[test]
    fn zero_sized_pool_buffer_cannot_be_wrapped() {
        let pool = BufferPool::create(1, 0, BufferAttrs::default()).unwrap();
        let buffer = pool.acquire_free().unwrap().unwrap();
        assert!(matches!(Transport::wrap(buffer, None), Err(Error::NullData)));
        assert!(matches!(Transport::plain(&[]), Err(Error::NullData)));
    }

    #[test]
    fn plain_views_share_one_region() {
        let region = Arc::new(Region::allocate(8).unwrap());
        unsafe { region.slice_mut(0, 8).copy_from_slice(b"abcdefgh") };
        let first = Transport::view(region.clone(), 0, 3).unwrap();
        let second = Transport::view(region.clone(), 3, 5).unwrap();
        assert_eq!(first.as_ref(), b"abc");
        assert_eq!(second.as_ref(), b"defgh");
        assert!(matches!(
            Transport::view(region, 6, 4),
            Err(Error::Capacity { .. })
        ));
    }

    #[test]
    fn overflowing_window_is_a_capacity_error() {
        let region = Arc::new(Region::allocate(8).unwrap());
        assert!(matches!(
            Transport::view(region.clone(), 4, usize::MAX),
            Err(Error::Capacity {
                needed: usize::MAX,
                available: 8
            })
        ));
        assert!(matches!(
            Transport::view(region, usize::MAX, 1),
            Err(Error::Capacity { .. })
        ));
    }

    #[test]
    fn failing_callback_still_releases_buffer() {
        let pool = BufferPool::create(
            1,
            16,
            BufferAttrs {
                use_mask: Owners::PIPELINE,
                graphics: None,
            },
        )
        .unwrap();
        let buffer = pool.acquire_free().unwrap().unwrap();
        buffer.set_bytes_used(1);
        let called = Arc::new(AtomicBool::new(false));

        let mut transport = Transport::wrap(buffer, None).unwrap();
        let flag = called.clone();
        transport.set_release_callback(Box::new(move |_| {
            flag.store(true, Ordering::SeqCst);
            Err(Error::ProtocolViolation("out of order".into()))
        }));
        drop(transport);

        assert!(called.load(Ordering::SeqCst));
        assert!(pool.acquire_free().unwrap().is_some());
    }
}
