//! Shared guest memory region.
//!
//! The guest and the engine run on different execution contexts but address
//! the same ring memory. All access goes through [`GuestRegion`], which
//! bounds-checks every range before touching it: ring contents are untrusted
//! input. The avail/used index words additionally cross the guest boundary
//! with acquire/release atomics; bulk data moves with plain copies, which is
//! sufficient once the index publication order is respected.

use std::io;
use std::sync::atomic::{AtomicU16, Ordering};

use crate::error::Error;

/// A shared memory region addressed by guest-physical offsets starting at 0.
///
/// Backed by an anonymous mmap so the base is page-aligned, matching what a
/// real backend expects of guest RAM. The region is the single allocation
/// both sides see; descriptor addresses are offsets into it.
pub struct GuestRegion {
    base: *mut u8,
    len: usize,
}

// Safety: the region is plain memory with a stable base for its lifetime.
// Concurrent access discipline (atomic index words, data copies ordered by
// them) is enforced by the ring protocol, not by this type.
unsafe impl Send for GuestRegion {}
unsafe impl Sync for GuestRegion {}

impl GuestRegion {
    /// Allocate a zeroed region of `len` bytes.
    pub fn alloc(len: usize) -> Result<Self, Error> {
        if len == 0 {
            return Err(Error::InvalidConfig("guest region must be non-empty".into()));
        }
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(GuestRegion {
            base: base as *mut u8,
            len,
        })
    }

    /// Region length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bounds-check a range and return its offset.
    fn check(&self, addr: u64, len: usize) -> Result<usize, Error> {
        let start = usize::try_from(addr).map_err(|_| Error::BadAddress { addr, len })?;
        let end = start
            .checked_add(len)
            .ok_or(Error::BadAddress { addr, len })?;
        if end > self.len {
            return Err(Error::BadAddress { addr, len });
        }
        Ok(start)
    }

    /// Copy `dst.len()` bytes out of the region at `addr`.
    pub fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), Error> {
        let off = self.check(addr, dst.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.add(off), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Copy `src` into the region at `addr`.
    pub fn write(&self, addr: u64, src: &[u8]) -> Result<(), Error> {
        let off = self.check(addr, src.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(off), src.len());
        }
        Ok(())
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8, Error> {
        let mut b = [0u8; 1];
        self.read(addr, &mut b)?;
        Ok(b[0])
    }

    pub fn write_u8(&self, addr: u64, val: u8) -> Result<(), Error> {
        self.write(addr, &[val])
    }

    pub fn read_u16(&self, addr: u64) -> Result<u16, Error> {
        let mut b = [0u8; 2];
        self.read(addr, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn write_u16(&self, addr: u64, val: u16) -> Result<(), Error> {
        self.write(addr, &val.to_le_bytes())
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, Error> {
        let mut b = [0u8; 4];
        self.read(addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn write_u32(&self, addr: u64, val: u32) -> Result<(), Error> {
        self.write(addr, &val.to_le_bytes())
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, Error> {
        let mut b = [0u8; 8];
        self.read(addr, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn write_u64(&self, addr: u64, val: u64) -> Result<(), Error> {
        self.write(addr, &val.to_le_bytes())
    }

    fn atomic_u16(&self, addr: u64) -> Result<&AtomicU16, Error> {
        let off = self.check(addr, 2)?;
        if off % 2 != 0 {
            return Err(Error::BadAddress { addr, len: 2 });
        }
        // Safety: in range, 2-byte aligned, and the backing memory lives as
        // long as `self`.
        Ok(unsafe { AtomicU16::from_ptr(self.base.add(off) as *mut u16) })
    }

    /// Acquire-load a little-endian u16 index word.
    pub fn load_u16_acquire(&self, addr: u64) -> Result<u16, Error> {
        Ok(u16::from_le(self.atomic_u16(addr)?.load(Ordering::Acquire)))
    }

    /// Release-store a little-endian u16 index word.
    pub fn store_u16_release(&self, addr: u64, val: u16) -> Result<(), Error> {
        self.atomic_u16(addr)?.store(val.to_le(), Ordering::Release);
        Ok(())
    }
}

impl Drop for GuestRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}
