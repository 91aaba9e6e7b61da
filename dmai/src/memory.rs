// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Contiguous memory regions handed to the codec.

use std::ptr::NonNull;

use crate::{Error, Result};

/// A fixed-size, heap allocated region with a stable address.
///
/// The codec and the pipeline access a region through raw pointers; which
/// side may touch the bytes at a given time is decided by the owner that
/// hands the region out (a pool use-mask or the encoder ring), not by Rust
/// borrows. A zero sized region has no address.
pub struct Region {
    ptr: Option<NonNull<u8>>,
    len: usize,
}

// Safety: the region is a plain heap allocation released only on drop.
// Concurrent access is arbitrated by the use-mask / ring bookkeeping of the
// owner, which never lets two writers hold the same bytes.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Allocates `len` zeroed bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] if the allocator cannot reserve the memory.
    pub fn allocate(len: usize) -> Result<Self> {
        if len == 0 {
            return Ok(Self { ptr: None, len: 0 });
        }
        let mut bytes: Vec<u8> = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|e| Error::Allocation(format!("{len} byte region: {e}")))?;
        bytes.resize(len, 0);
        let raw = Box::into_raw(bytes.into_boxed_slice()) as *mut u8;
        Ok(Self {
            ptr: NonNull::new(raw),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address, or `None` for a zero sized region.
    pub fn as_ptr(&self) -> Option<NonNull<u8>> {
        self.ptr
    }

    /// Returns `len` bytes starting at `offset`.
    ///
    /// # Safety
    ///
    /// No other party may be writing the range for the lifetime of the slice.
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        match self.ptr {
            Some(ptr) if offset.checked_add(len).is_some_and(|end| end <= self.len) => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr().add(offset), len)
            },
            _ => &[],
        }
    }

    /// Returns `len` writable bytes starting at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive ownership of the range for the
    /// lifetime of the slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        match self.ptr {
            Some(ptr) if offset.checked_add(len).is_some_and(|end| end <= self.len) => unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr().add(offset), len)
            },
            _ => &mut [],
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            let slice = std::ptr::slice_from_raw_parts_mut(ptr.as_ptr(), self.len);
            drop(unsafe { Box::from_raw(slice) });
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sized_region_has_no_address() {
        let region = Region::allocate(0).unwrap();
        assert!(region.as_ptr().is_none());
        assert!(unsafe { region.slice(0, 0) }.is_empty());
    }

    #[test]
    fn out_of_bounds_views_are_empty() {
        let region = Region::allocate(16).unwrap();
        unsafe {
            region.slice_mut(0, 4).copy_from_slice(&[1, 2, 3, 4]);
            assert_eq!(region.slice(0, 4), &[1, 2, 3, 4]);
            assert!(region.slice(12, 8).is_empty());
            assert!(region.slice(8, usize::MAX).is_empty());
        }
    }
}
