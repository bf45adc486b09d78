//! Pinned DMA staging arena.
//!
//! Backends cannot address guest memory directly, so every transfer is
//! staged through a slot in a page-aligned, mlocked arena. The arena is a
//! single mapping carved into fixed-size slots handed out from a free list;
//! a slot stays owned by its request until the completion path releases it.

use std::io;

use crate::error::Error;

const PAGE: usize = 4096;

/// An unowned view of (part of) a DMA slot, passed to backends. The slot
/// outlives the slice: the owning [`DmaBuffer`] is held by the request's
/// in-flight state until the backend's completion is reaped.
#[derive(Clone, Copy, Debug)]
pub struct DmaSlice {
    ptr: *mut u8,
    pub len: u32,
}

// Safety: points into the pool arena, which is stable for the pool's
// lifetime; cross-thread access is serialized by the submit/complete
// protocol.
unsafe impl Send for DmaSlice {}

impl DmaSlice {
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len as usize) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len as usize) }
    }
}

/// An owned DMA slot. Returned to the pool explicitly via
/// [`DmaPool::release`]; the pool tracks leaks only through `available()`.
#[derive(Debug)]
pub struct DmaBuffer {
    slot: u16,
    ptr: *mut u8,
    len: u32,
}

// Safety: same arena-lifetime argument as DmaSlice; a DmaBuffer is the
// unique owner of its slot between acquire and release.
unsafe impl Send for DmaBuffer {}

impl DmaBuffer {
    pub fn slot(&self) -> u16 {
        self.slot
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len as usize) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len as usize) }
    }

    /// A backend-facing view of the first `len` bytes.
    pub fn slice(&self, len: u32) -> DmaSlice {
        debug_assert!(len <= self.len);
        DmaSlice { ptr: self.ptr, len }
    }
}

/// Fixed-size slot pool over one pinned mapping.
pub struct DmaPool {
    base: *mut u8,
    arena_len: usize,
    slot_len: u32,
    free: Vec<u16>,
}

unsafe impl Send for DmaPool {}

impl DmaPool {
    pub fn new(slots: u16, slot_len: u32) -> Result<Self, Error> {
        if slots == 0 || slot_len == 0 {
            return Err(Error::InvalidConfig("dma pool must be non-empty".into()));
        }
        let slot_len = (slot_len as usize).next_multiple_of(PAGE) as u32;
        let arena_len = slot_len as usize * slots as usize;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                arena_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        // Pinning is best-effort: RLIMIT_MEMLOCK may be too small in a
        // sandboxed test environment, and an unpinned arena still works.
        if unsafe { libc::mlock(base, arena_len) } != 0 {
            log::warn!(
                "failed to pin {arena_len} byte dma arena: {}",
                io::Error::last_os_error()
            );
        }
        // LIFO free list so recently-touched slots are reused first.
        let free = (0..slots).rev().collect();
        Ok(DmaPool {
            base: base as *mut u8,
            arena_len,
            slot_len,
            free,
        })
    }

    pub fn slot_len(&self) -> u32 {
        self.slot_len
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Take a slot, or `None` if the pool is exhausted.
    pub fn try_acquire(&mut self) -> Option<DmaBuffer> {
        let slot = self.free.pop()?;
        let ptr = unsafe { self.base.add(slot as usize * self.slot_len as usize) };
        Some(DmaBuffer {
            slot,
            ptr,
            len: self.slot_len,
        })
    }

    pub fn release(&mut self, buf: DmaBuffer) {
        debug_assert!(!self.free.contains(&buf.slot));
        self.free.push(buf.slot);
    }
}

impl Drop for DmaPool {
    fn drop(&mut self) {
        unsafe {
            libc::munlock(self.base as *const libc::c_void, self.arena_len);
            libc::munmap(self.base as *mut libc::c_void, self.arena_len);
        }
    }
}
