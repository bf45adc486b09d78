//! Split descriptor ring layout and index protocol.
//!
//! A queue is three guest-memory tables: a descriptor table, an available
//! ring (guest writes, engine reads) and a used ring (engine writes, guest
//! reads). Progress on each ring is a free-running u16 index; the engine
//! acquire-loads the available index before reading descriptors and
//! release-stores the used index after writing a used entry, so the guest
//! never observes an entry before its contents.

use crate::error::Error;
use crate::mem::GuestRegion;

/// Descriptor continues into the entry named by `next`.
pub const DESC_F_NEXT: u16 = 1;
/// Buffer is device-writable (engine writes, guest reads).
pub const DESC_F_WRITE: u16 = 2;

/// Guest suppresses completion notifications while set in `avail.flags`.
pub const AVAIL_F_NO_NOTIFY: u16 = 1;

/// Largest ring capacity accepted at activation.
pub const MAX_QUEUE_CAPACITY: u16 = 32768;

const DESC_ENTRY_LEN: u64 = 16;
const USED_ENTRY_LEN: u64 = 8;

/// One descriptor table entry, decoded from its 16-byte little-endian form.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Desc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl Desc {
    pub fn has_next(&self) -> bool {
        self.flags & DESC_F_NEXT != 0
    }

    pub fn device_writable(&self) -> bool {
        self.flags & DESC_F_WRITE != 0
    }
}

/// Guest-memory addresses of the three ring tables for a queue of a given
/// capacity. Shared between the engine and test drivers so both compute
/// entry offsets the same way.
#[derive(Clone, Copy, Debug)]
pub struct RingLayout {
    pub capacity: u16,
    pub desc: u64,
    pub avail: u64,
    pub used: u64,
}

impl RingLayout {
    pub fn new(capacity: u16, desc: u64, avail: u64, used: u64) -> Self {
        Self {
            capacity,
            desc,
            avail,
            used,
        }
    }

    pub fn desc_entry(&self, index: u16) -> u64 {
        self.desc + u64::from(index) * DESC_ENTRY_LEN
    }

    pub fn avail_flags_addr(&self) -> u64 {
        self.avail
    }

    pub fn avail_idx_addr(&self) -> u64 {
        self.avail + 2
    }

    pub fn avail_ring_entry(&self, slot: u16) -> u64 {
        self.avail + 4 + u64::from(slot) * 2
    }

    pub fn used_flags_addr(&self) -> u64 {
        self.used
    }

    pub fn used_idx_addr(&self) -> u64 {
        self.used + 2
    }

    pub fn used_ring_entry(&self, slot: u16) -> u64 {
        self.used + 4 + u64::from(slot) * USED_ENTRY_LEN
    }

    fn desc_table_len(&self) -> u64 {
        u64::from(self.capacity) * DESC_ENTRY_LEN
    }

    fn avail_len(&self) -> u64 {
        4 + u64::from(self.capacity) * 2
    }

    fn used_len(&self) -> u64 {
        4 + u64::from(self.capacity) * USED_ENTRY_LEN
    }
}

/// Engine-side view of one activated queue.
///
/// `last_avail` and `used_idx` are free-running; the ring slot is the index
/// masked by `capacity - 1`. Capacity is required to be a power of two at
/// activation, so wraparound is just u16 arithmetic.
#[derive(Debug)]
pub struct VirtQueue {
    layout: RingLayout,
    last_avail: u16,
    used_idx: u16,
}

impl VirtQueue {
    /// Validate geometry against the guest region and take ownership of the
    /// queue's progress indices (both start at the guest-published values,
    /// which are zero for a fresh queue).
    pub fn activate(layout: RingLayout, mem: &GuestRegion) -> Result<Self, Error> {
        let cap = layout.capacity;
        if cap == 0 || !cap.is_power_of_two() || cap > MAX_QUEUE_CAPACITY {
            return Err(Error::InvalidGeometry(format!(
                "capacity {cap} is not a power of two in 1..={MAX_QUEUE_CAPACITY}"
            )));
        }
        if layout.desc % 16 != 0 {
            return Err(Error::InvalidGeometry(format!(
                "descriptor table at {:#x} is not 16-byte aligned",
                layout.desc
            )));
        }
        if layout.avail % 2 != 0 || layout.used % 4 != 0 {
            return Err(Error::InvalidGeometry(format!(
                "ring tables misaligned (avail {:#x}, used {:#x})",
                layout.avail, layout.used
            )));
        }
        for (name, addr, len) in [
            ("descriptor table", layout.desc, layout.desc_table_len()),
            ("available ring", layout.avail, layout.avail_len()),
            ("used ring", layout.used, layout.used_len()),
        ] {
            let end = addr.checked_add(len);
            if end.is_none() || end.is_some_and(|e| e > mem.len() as u64) {
                return Err(Error::InvalidGeometry(format!(
                    "{name} at {addr:#x}+{len} exceeds guest memory"
                )));
            }
        }
        let last_avail = mem.load_u16_acquire(layout.avail_idx_addr())?;
        let used_idx = mem.read_u16(layout.used_idx_addr())?;
        Ok(VirtQueue {
            layout,
            last_avail,
            used_idx,
        })
    }

    pub fn capacity(&self) -> u16 {
        self.layout.capacity
    }

    fn mask(&self) -> u16 {
        self.layout.capacity - 1
    }

    /// Number of available-ring slots published but not yet consumed.
    pub fn pending(&self, mem: &GuestRegion) -> Result<u16, Error> {
        let avail = mem.load_u16_acquire(self.layout.avail_idx_addr())?;
        Ok(avail.wrapping_sub(self.last_avail))
    }

    /// Free-running index of the next unconsumed available-ring slot.
    pub fn next_avail(&self) -> u16 {
        self.last_avail
    }

    /// Head descriptor index published in available-ring slot `slot`
    /// (free-running; masked here).
    pub fn avail_head(&self, mem: &GuestRegion, slot: u16) -> Result<u16, Error> {
        mem.read_u16(self.layout.avail_ring_entry(slot & self.mask()))
    }

    /// Decode the descriptor table entry at `index`.
    pub fn desc_at(&self, mem: &GuestRegion, index: u16) -> Result<Desc, Error> {
        if index >= self.layout.capacity {
            return Err(Error::MalformedDescriptor {
                addr: self.layout.desc_entry(index),
                len: u32::from(index),
            });
        }
        let base = self.layout.desc_entry(index);
        Ok(Desc {
            addr: mem.read_u64(base)?,
            len: mem.read_u32(base + 8)?,
            flags: mem.read_u16(base + 12)?,
            next: mem.read_u16(base + 14)?,
        })
    }

    /// Consume `slots` available-ring entries.
    pub fn advance(&mut self, slots: u16) {
        self.last_avail = self.last_avail.wrapping_add(slots);
    }

    /// Retire one chain: write a used-ring entry for head descriptor `id`
    /// with `len` bytes written to device-writable buffers, then publish the
    /// new used index with release ordering. Returns whether the guest wants
    /// a notification.
    pub fn publish_completion(
        &mut self,
        mem: &GuestRegion,
        id: u32,
        len: u32,
    ) -> Result<bool, Error> {
        let entry = self.layout.used_ring_entry(self.used_idx & self.mask());
        mem.write_u32(entry, id)?;
        mem.write_u32(entry + 4, len)?;
        self.used_idx = self.used_idx.wrapping_add(1);
        mem.store_u16_release(self.layout.used_idx_addr(), self.used_idx)?;
        let flags = mem.read_u16(self.layout.avail_flags_addr())?;
        Ok(flags & AVAIL_F_NO_NOTIFY == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(cap: u16) -> RingLayout {
        RingLayout::new(cap, 0x1000, 0x2000, 0x3000)
    }

    fn write_desc(mem: &GuestRegion, l: &RingLayout, i: u16, d: Desc) {
        let base = l.desc_entry(i);
        mem.write_u64(base, d.addr).unwrap();
        mem.write_u32(base + 8, d.len).unwrap();
        mem.write_u16(base + 12, d.flags).unwrap();
        mem.write_u16(base + 14, d.next).unwrap();
    }

    #[test]
    fn used_idx_addr_sits_after_flags() {
        let l = layout(8);
        assert_eq!(l.used_idx_addr(), l.used + 2);
        assert_eq!(l.used_ring_entry(0), l.used + 4);
    }

    #[test]
    fn rejects_non_power_of_two_capacity() {
        let mem = GuestRegion::alloc(64 * 1024).unwrap();
        let err = VirtQueue::activate(layout(6), &mem).unwrap_err();
        assert!(matches!(err, Error::InvalidGeometry(_)));
    }

    #[test]
    fn rejects_tables_outside_guest_memory() {
        let mem = GuestRegion::alloc(8 * 1024).unwrap();
        let l = RingLayout::new(8, 0x1000, 0x2000, 0x1_0000);
        assert!(matches!(
            VirtQueue::activate(l, &mem),
            Err(Error::InvalidGeometry(_))
        ));
    }

    #[test]
    fn rejects_misaligned_descriptor_table() {
        let mem = GuestRegion::alloc(64 * 1024).unwrap();
        let l = RingLayout::new(8, 0x1004, 0x2000, 0x3000);
        assert!(matches!(
            VirtQueue::activate(l, &mem),
            Err(Error::InvalidGeometry(_))
        ));
    }

    #[test]
    fn sees_published_avail_entries() {
        let mem = GuestRegion::alloc(64 * 1024).unwrap();
        let l = layout(8);
        let vq = VirtQueue::activate(l, &mem).unwrap();
        assert_eq!(vq.pending(&mem).unwrap(), 0);

        write_desc(
            &mem,
            &l,
            3,
            Desc {
                addr: 0x5000,
                len: 512,
                flags: 0,
                next: 0,
            },
        );
        mem.write_u16(l.avail_ring_entry(0), 3).unwrap();
        mem.store_u16_release(l.avail_idx_addr(), 1).unwrap();

        assert_eq!(vq.pending(&mem).unwrap(), 1);
        assert_eq!(vq.avail_head(&mem, vq.next_avail()).unwrap(), 3);
        let d = vq.desc_at(&mem, 3).unwrap();
        assert_eq!(d.addr, 0x5000);
        assert_eq!(d.len, 512);
    }

    #[test]
    fn desc_index_beyond_table_is_malformed() {
        let mem = GuestRegion::alloc(64 * 1024).unwrap();
        let vq = VirtQueue::activate(layout(8), &mem).unwrap();
        assert!(matches!(
            vq.desc_at(&mem, 8),
            Err(Error::MalformedDescriptor { .. })
        ));
    }

    #[test]
    fn publish_bumps_used_idx_and_honors_no_notify() {
        let mem = GuestRegion::alloc(64 * 1024).unwrap();
        let l = layout(8);
        let mut vq = VirtQueue::activate(l, &mem).unwrap();

        assert!(vq.publish_completion(&mem, 3, 512).unwrap());
        assert_eq!(mem.read_u16(l.used_idx_addr()).unwrap(), 1);
        assert_eq!(mem.read_u32(l.used_ring_entry(0)).unwrap(), 3);
        assert_eq!(mem.read_u32(l.used_ring_entry(0) + 4).unwrap(), 512);

        mem.write_u16(l.avail_flags_addr(), AVAIL_F_NO_NOTIFY).unwrap();
        assert!(!vq.publish_completion(&mem, 4, 0).unwrap());
        assert_eq!(mem.read_u16(l.used_idx_addr()).unwrap(), 2);
    }

    #[test]
    fn indices_wrap_mod_capacity() {
        let mem = GuestRegion::alloc(64 * 1024).unwrap();
        let l = layout(4);
        let mut vq = VirtQueue::activate(l, &mem).unwrap();
        for id in 0..6u32 {
            vq.publish_completion(&mem, id, 0).unwrap();
        }
        // Sixth entry landed in slot 1 (5 & 3).
        assert_eq!(mem.read_u32(l.used_ring_entry(1)).unwrap(), 5);
        assert_eq!(mem.read_u16(l.used_idx_addr()).unwrap(), 6);
    }
}
