//! Descriptor chain assembly.
//!
//! Turns available-ring entries into flat buffer lists. Two walk modes
//! exist: block-style chains linked by the NEXT flag, and network-RX merge
//! mode where consecutive available-ring slots are coalesced into one
//! request up to a byte limit. Every descriptor is validated before use;
//! nothing read from guest memory is trusted.

use crate::error::Error;
use crate::mem::GuestRegion;
use crate::ring::VirtQueue;

/// How available-ring entries map to requests.
#[derive(Clone, Copy, Debug)]
pub enum WalkMode {
    /// One request per available-ring slot, following NEXT links.
    Chained,
    /// Coalesce consecutive slots (one single descriptor each) until the
    /// accumulated length reaches `max_len`.
    Merged { max_len: u32 },
}

/// One guest buffer within an assembled request.
#[derive(Clone, Copy, Debug)]
pub struct ChainBuf {
    pub addr: u64,
    pub len: u32,
    pub device_writable: bool,
}

/// A fully assembled request, ready for dispatch.
///
/// `slots_consumed` is how many available-ring entries the walk used: 1 in
/// chained mode, possibly more in merge mode. Retirement publishes one
/// used-ring entry per consumed slot regardless of outcome.
#[derive(Debug)]
pub struct Request {
    pub head: u16,
    pub bufs: Vec<ChainBuf>,
    pub slots_consumed: u16,
}

impl Request {
    pub fn total_len(&self) -> u32 {
        self.bufs.iter().map(|b| b.len).sum()
    }

    pub fn readable_len(&self) -> u32 {
        self.bufs
            .iter()
            .filter(|b| !b.device_writable)
            .map(|b| b.len)
            .sum()
    }

    pub fn writable_len(&self) -> u32 {
        self.bufs
            .iter()
            .filter(|b| b.device_writable)
            .map(|b| b.len)
            .sum()
    }
}

fn checked_buf(vq: &VirtQueue, mem: &GuestRegion, index: u16) -> Result<(ChainBuf, u16, bool), Error> {
    let desc = vq.desc_at(mem, index)?;
    if desc.addr == 0 || desc.len == 0 {
        return Err(Error::MalformedDescriptor {
            addr: desc.addr,
            len: desc.len,
        });
    }
    // Reject ranges outside guest memory up front so dispatch can copy
    // without re-validating.
    let end = desc.addr.checked_add(u64::from(desc.len));
    if end.is_none() || end.is_some_and(|e| e > mem.len() as u64) {
        return Err(Error::MalformedDescriptor {
            addr: desc.addr,
            len: desc.len,
        });
    }
    Ok((
        ChainBuf {
            addr: desc.addr,
            len: desc.len,
            device_writable: desc.device_writable(),
        },
        desc.next,
        desc.has_next(),
    ))
}

/// Assemble the next pending request, or `None` if the ring is idle.
///
/// Does not advance the queue; the caller advances by `slots_consumed` once
/// it commits to retiring the request. `max_bufs` bounds the buffer count in
/// both modes; a walk that exceeds it (including a NEXT cycle, which can
/// never terminate under the bound) fails with `ChainTooLong`.
pub fn assemble(
    vq: &VirtQueue,
    mem: &GuestRegion,
    mode: WalkMode,
    max_bufs: usize,
) -> Result<Option<Request>, Error> {
    let pending = vq.pending(mem)?;
    if pending == 0 {
        return Ok(None);
    }
    let head = vq.avail_head(mem, vq.next_avail())?;

    match mode {
        WalkMode::Chained => {
            let mut bufs = Vec::new();
            let mut index = head;
            loop {
                let (buf, next, has_next) = checked_buf(vq, mem, index)?;
                if bufs.len() == max_bufs {
                    return Err(Error::ChainTooLong);
                }
                bufs.push(buf);
                if !has_next {
                    break;
                }
                index = next;
            }
            Ok(Some(Request {
                head,
                bufs,
                slots_consumed: 1,
            }))
        }
        WalkMode::Merged { max_len } => {
            let mut bufs = Vec::new();
            let mut total = 0u32;
            let mut slots = 0u16;
            while slots < pending {
                let index = vq.avail_head(mem, vq.next_avail().wrapping_add(slots))?;
                let (buf, _, _) = checked_buf(vq, mem, index)?;
                if bufs.len() == max_bufs {
                    return Err(Error::ChainTooLong);
                }
                total = total.saturating_add(buf.len);
                bufs.push(buf);
                slots += 1;
                if total >= max_len {
                    break;
                }
            }
            Ok(Some(Request {
                head,
                bufs,
                slots_consumed: slots,
            }))
        }
    }
}
