//! Request classification and in-flight command tracking.
//!
//! The block wire format is the standard one: a 16-byte little-endian header
//! (type, reserved, starting sector in 512-byte units), the data buffers,
//! then a single device-writable status byte as the final buffer. Commands
//! handed to the backend are tracked in a fixed slab; the slab index plus a
//! generation counter pack into the command's `user_data`, so a stale or
//! duplicated completion can never retire the wrong request.

use crate::chain::{ChainBuf, Request};
use crate::dma::DmaBuffer;
use crate::error::Error;
use crate::mem::GuestRegion;

/// Block request header length.
pub const BLK_HEADER_LEN: u32 = 16;
/// Header `sector` field unit.
pub const SECTOR_UNIT: u64 = 512;

pub const BLK_T_IN: u32 = 0;
pub const BLK_T_OUT: u32 = 1;
pub const BLK_T_FLUSH: u32 = 4;

pub const BLK_S_OK: u8 = 0;
pub const BLK_S_IOERR: u8 = 1;
pub const BLK_S_UNSUPP: u8 = 2;

/// Decoded block request header.
#[derive(Clone, Copy, Debug)]
pub struct BlkHeader {
    pub req_type: u32,
    pub sector: u64,
}

/// Read the request header out of the chain's first buffer.
///
/// The header must be a device-readable prefix of the chain; a chain whose
/// first buffer is writable or too short is not a decodable request.
pub fn read_header(mem: &GuestRegion, first: &ChainBuf) -> Result<BlkHeader, Error> {
    if first.device_writable || first.len < BLK_HEADER_LEN {
        return Err(Error::MalformedDescriptor {
            addr: first.addr,
            len: first.len,
        });
    }
    Ok(BlkHeader {
        req_type: mem.read_u32(first.addr)?,
        sector: mem.read_u64(first.addr + 8)?,
    })
}

/// The request's status trailer: the final buffer, which must be a
/// device-writable single byte.
pub fn status_buf(req: &Request) -> Option<&ChainBuf> {
    let last = req.bufs.last()?;
    if last.device_writable && last.len >= 1 {
        Some(last)
    } else {
        None
    }
}

// ── In-flight slab ───────────────────────────────────────────────────

/// Handle to a slab entry, packed into backend `user_data`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ticket {
    pub index: u16,
    pub generation: u32,
}

impl Ticket {
    pub fn pack(self) -> u64 {
        (u64::from(self.generation) << 16) | u64::from(self.index)
    }

    pub fn unpack(raw: u64) -> Self {
        Ticket {
            index: raw as u16,
            generation: (raw >> 16) as u32,
        }
    }
}

/// Everything needed to retire a request once its backend completion lands.
#[derive(Debug)]
pub struct InFlight {
    pub queue: u16,
    pub head: u32,
    pub dma: DmaBuffer,
    /// Bytes the guest expects in its writable data buffers on a read.
    pub data_len: u32,
    /// Guest ranges to scatter read data into, in chain order.
    pub writable: Vec<ChainBuf>,
    pub status_addr: u64,
    pub is_read: bool,
}

struct Slot {
    generation: u32,
    state: Option<InFlight>,
}

/// Fixed-capacity in-flight command table.
///
/// Entries are reused; each take bumps the generation so a ticket minted for
/// a previous occupant no longer matches.
pub struct CmdSlab {
    slots: Vec<Slot>,
    free: Vec<u16>,
}

impl CmdSlab {
    pub fn new(capacity: u16) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                state: None,
            })
            .collect();
        CmdSlab {
            slots,
            free: (0..capacity).rev().collect(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Park an in-flight record, returning its ticket. A full slab hands
    /// the record back so the caller can unwind its resources.
    pub fn allocate(&mut self, state: InFlight) -> Result<Ticket, InFlight> {
        let Some(index) = self.free.pop() else {
            return Err(state);
        };
        let slot = &mut self.slots[index as usize];
        slot.state = Some(state);
        Ok(Ticket {
            index,
            generation: slot.generation,
        })
    }

    /// Redeem a ticket. `None` if it is stale or was already taken.
    pub fn take(&mut self, ticket: Ticket) -> Option<InFlight> {
        let slot = self.slots.get_mut(ticket.index as usize)?;
        if slot.generation != ticket.generation {
            return None;
        }
        let state = slot.state.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(ticket.index);
        Some(state)
    }
}
