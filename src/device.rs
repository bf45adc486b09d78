//! Block bridge: queue table, request processing and the drain state
//! machine.
//!
//! A [`BlockBridge`] owns one storage backend, a DMA arena, an in-flight
//! slab and a table of queues. Submission runs on the caller's thread
//! (`process_queue`); completions are reaped by a dedicated reactor thread
//! and published back to the used rings. The per-queue mutex is never held
//! across a backend, slab or DMA lock; the two halves meet only at the slab.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::backend::{BackendCommand, BackendCompletion, Opcode, StorageBackend};
use crate::chain::{assemble, ChainBuf, Request, WalkMode};
use crate::config::Config;
use crate::dispatch::{
    read_header, status_buf, CmdSlab, InFlight, Ticket, BLK_S_IOERR, BLK_S_OK, BLK_S_UNSUPP,
    BLK_T_FLUSH, BLK_T_IN, BLK_T_OUT, SECTOR_UNIT,
};
use crate::dma::{DmaBuffer, DmaPool};
use crate::error::Error;
use crate::mem::GuestRegion;
use crate::metrics;
use crate::reactor;
use crate::ring::{RingLayout, VirtQueue};

pub(crate) const STATE_ACTIVE: u8 = 0;
pub(crate) const STATE_DRAINING: u8 = 1;
pub(crate) const STATE_DETACHED: u8 = 2;

/// Completion notification, standing in for the guest interrupt line.
/// Delivered once per used-ring publish unless the guest suppressed
/// notifications for the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueEvent {
    pub queue: u16,
}

#[derive(Default)]
pub(crate) struct QueueSlot {
    vq: Option<VirtQueue>,
    halted: bool,
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, Error> {
    m.lock()
        .map_err(|_| Error::Io(io::Error::other("lock poisoned")))
}

/// State shared between submission threads and the reactor.
pub(crate) struct Shared<B: StorageBackend> {
    pub(crate) config: Config,
    mem: Arc<GuestRegion>,
    pub(crate) backend: Mutex<B>,
    sector_size: u32,
    capacity_sectors: u64,
    dma_slot_len: u32,
    dma: Mutex<DmaPool>,
    slab: Mutex<CmdSlab>,
    queues: Vec<Mutex<QueueSlot>>,
    outstanding: AtomicU32,
    state: AtomicU8,
    pub(crate) shutdown: AtomicBool,
    notify_tx: Sender<QueueEvent>,
}

/// One attached block device.
pub struct BlockBridge<B: StorageBackend + 'static> {
    shared: Arc<Shared<B>>,
    reactor: Option<JoinHandle<()>>,
}

impl<B: StorageBackend + 'static> BlockBridge<B> {
    /// Attach a backend: build the DMA arena and in-flight slab, start the
    /// completion reactor, and return the bridge plus the notification
    /// channel.
    pub fn attach(
        config: Config,
        mem: Arc<GuestRegion>,
        backend: B,
    ) -> Result<(Self, Receiver<QueueEvent>), Error> {
        config.validate()?;
        let sector_size = backend.sector_size();
        if sector_size == 0 || !sector_size.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "backend sector size {sector_size} is not a power of two"
            )));
        }
        let capacity_sectors = backend.capacity_sectors();
        let dma = DmaPool::new(config.dma_slots, config.dma_slot_len)?;
        let dma_slot_len = dma.slot_len();
        // One slab entry per DMA slot: a request holds exactly one of each
        // while in flight, so the slab can never fill before the pool.
        let slab = CmdSlab::new(config.dma_slots);
        let queues = (0..config.queues)
            .map(|_| Mutex::new(QueueSlot::default()))
            .collect();
        let (notify_tx, notify_rx) = crossbeam_channel::unbounded();

        let shared = Arc::new(Shared {
            config,
            mem,
            backend: Mutex::new(backend),
            sector_size,
            capacity_sectors,
            dma_slot_len,
            dma: Mutex::new(dma),
            slab: Mutex::new(slab),
            queues,
            outstanding: AtomicU32::new(0),
            state: AtomicU8::new(STATE_ACTIVE),
            shutdown: AtomicBool::new(false),
            notify_tx,
        });

        let reactor = thread::Builder::new()
            .name("ringbridge-reactor".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || reactor::run(shared)
            })?;

        Ok((
            BlockBridge {
                shared,
                reactor: Some(reactor),
            },
            notify_rx,
        ))
    }

    /// Validate ring geometry and bring a queue into service. Re-activation
    /// clears a halt left by an earlier descriptor fault.
    pub fn activate_queue(&self, queue: u16, layout: RingLayout) -> Result<(), Error> {
        if self.shared.state.load(Ordering::Acquire) == STATE_DETACHED {
            return Err(Error::Detached);
        }
        let slot = self
            .shared
            .queues
            .get(queue as usize)
            .ok_or(Error::UnknownQueue(queue))?;
        let vq = VirtQueue::activate(layout, &self.shared.mem)?;
        let mut slot = lock(slot)?;
        slot.vq = Some(vq);
        slot.halted = false;
        Ok(())
    }

    /// Consume every pending available-ring entry on `queue`, dispatching
    /// each assembled request to the backend. Returns the number of
    /// requests accepted.
    ///
    /// Call this after the guest publishes new entries (the doorbell). A
    /// malformed descriptor halts the queue: this call reports the fault,
    /// later calls report `QueueHalted` until the queue is re-activated.
    pub fn process_queue(&self, queue: u16) -> Result<usize, Error> {
        match self.shared.state.load(Ordering::Acquire) {
            STATE_DRAINING => return Err(Error::Draining),
            STATE_DETACHED => return Err(Error::Detached),
            _ => {}
        }
        let shared = &self.shared;
        let slot_mutex = shared
            .queues
            .get(queue as usize)
            .ok_or(Error::UnknownQueue(queue))?;

        let mut accepted = 0;
        loop {
            // Assemble and advance under the queue lock; dispatch without it.
            let req = {
                let mut slot = lock(slot_mutex)?;
                if slot.halted {
                    return Err(Error::QueueHalted(queue));
                }
                let vq = slot.vq.as_mut().ok_or(Error::QueueNotReady(queue))?;
                match assemble(
                    vq,
                    &shared.mem,
                    WalkMode::Chained,
                    shared.config.max_chain_buffers,
                ) {
                    Ok(None) => break,
                    Ok(Some(req)) => {
                        vq.advance(req.slots_consumed);
                        Some(req)
                    }
                    Err(Error::ChainTooLong) => {
                        // Drop the request without touching the backend,
                        // but still retire its ring slot so the guest sees
                        // exactly one used entry for the chain. The trailer
                        // position is unknowable here, so no status byte.
                        let head = vq.avail_head(&shared.mem, vq.next_avail())?;
                        vq.advance(1);
                        let notify =
                            vq.publish_completion(&shared.mem, u32::from(head), 0)?;
                        drop(slot);
                        metrics::CHAINS_TRUNCATED.increment();
                        metrics::REQUESTS_FAILED.increment();
                        metrics::COMPLETIONS_DELIVERED.increment();
                        shared.notify(queue, notify);
                        None
                    }
                    Err(e @ Error::MalformedDescriptor { .. }) => {
                        slot.halted = true;
                        metrics::DESCRIPTOR_FAULTS.increment();
                        log::error!("queue {queue} halted: {e}");
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                }
            };
            if let Some(req) = req {
                shared.handle_request(queue, req)?;
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    /// Stop accepting submissions. Idempotent; in-flight commands keep
    /// completing.
    pub fn begin_drain(&self) {
        self.shared.state.fetch_max(STATE_DRAINING, Ordering::AcqRel);
    }

    /// Block until no commands remain in flight, or the timeout elapses.
    /// A zero timeout performs a single check.
    pub fn wait_drained(&self, timeout: Duration) -> Result<(), Error> {
        let start = Instant::now();
        loop {
            if self.shared.outstanding.load(Ordering::Acquire) == 0 {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(Error::DrainTimeout);
            }
            thread::sleep(Duration::from_micros(
                self.shared.config.idle_backoff_us.max(1),
            ));
        }
    }

    /// Tear down: reject all further work and stop the reactor. Safe to
    /// call more than once; later calls are no-ops.
    pub fn detach(&mut self) {
        self.shared.state.store(STATE_DETACHED, Ordering::Release);
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.reactor.take() {
            let _ = handle.join();
        }
    }

    /// Commands currently in flight at the backend.
    pub fn outstanding(&self) -> u32 {
        self.shared.outstanding.load(Ordering::Acquire)
    }
}

impl<B: StorageBackend + 'static> Drop for BlockBridge<B> {
    fn drop(&mut self) {
        self.detach();
    }
}

impl<B: StorageBackend> Shared<B> {
    fn notify(&self, queue: u16, wanted: bool) {
        if wanted {
            metrics::NOTIFICATIONS_SENT.increment();
            let _ = self.notify_tx.send(QueueEvent { queue });
        }
    }

    /// Publish one used-ring entry for a retired chain.
    fn retire(&self, queue: u16, head: u32, len: u32) -> Result<(), Error> {
        let notify = {
            let mut slot = lock(&self.queues[queue as usize])?;
            let vq = slot.vq.as_mut().ok_or(Error::QueueNotReady(queue))?;
            vq.publish_completion(&self.mem, head, len)?
        };
        metrics::COMPLETIONS_DELIVERED.increment();
        self.notify(queue, notify);
        Ok(())
    }

    /// Retire a request that never reached the backend, with an error
    /// status in its trailer.
    fn fail(&self, queue: u16, head: u32, status_addr: u64, status: u8) -> Result<(), Error> {
        self.mem.write_u8(status_addr, status)?;
        metrics::REQUESTS_FAILED.increment();
        self.retire(queue, head, 1)
    }

    /// Acquire a DMA slot with bounded linear backoff.
    fn acquire_dma(&self) -> Result<Option<DmaBuffer>, Error> {
        let attempts = self.config.dma_retry_attempts;
        for attempt in 0..=attempts {
            if let Some(buf) = lock(&self.dma)?.try_acquire() {
                return Ok(Some(buf));
            }
            if attempt < attempts {
                thread::sleep(Duration::from_micros(
                    u64::from(attempt + 1) * self.config.dma_retry_backoff_us,
                ));
            }
        }
        Ok(None)
    }

    /// Classify, stage and submit one assembled request.
    fn handle_request(&self, queue: u16, req: Request) -> Result<(), Error> {
        let head = u32::from(req.head);
        let Some(status_addr) = status_buf(&req).map(|b| b.addr) else {
            // No trailer to report into; retire the slot empty-handed.
            metrics::REQUESTS_FAILED.increment();
            return self.retire(queue, head, 0);
        };
        let header = match read_header(&self.mem, &req.bufs[0]) {
            Ok(h) => h,
            Err(_) => return self.fail(queue, head, status_addr, BLK_S_UNSUPP),
        };
        let (opcode, is_read) = match header.req_type {
            BLK_T_IN => (Opcode::Read, true),
            BLK_T_OUT => (Opcode::Write, false),
            BLK_T_FLUSH => (Opcode::Flush, false),
            _ => return self.fail(queue, head, status_addr, BLK_S_UNSUPP),
        };

        // Data buffers sit between the header and the status trailer.
        let data: Vec<ChainBuf> = if opcode == Opcode::Flush || req.bufs.len() < 2 {
            Vec::new()
        } else {
            req.bufs[1..req.bufs.len() - 1]
                .iter()
                .copied()
                .filter(|b| b.device_writable == is_read)
                .collect()
        };
        let data_len: u32 = data.iter().map(|b| b.len).sum();

        let (lba, blocks) = if opcode == Opcode::Flush {
            (0, 0)
        } else {
            if data_len == 0
                || data_len % self.sector_size != 0
                || data_len > self.dma_slot_len
            {
                return self.fail(queue, head, status_addr, BLK_S_IOERR);
            }
            let Some(byte_off) = header.sector.checked_mul(SECTOR_UNIT) else {
                return self.fail(queue, head, status_addr, BLK_S_IOERR);
            };
            if byte_off % u64::from(self.sector_size) != 0 {
                return self.fail(queue, head, status_addr, BLK_S_IOERR);
            }
            let lba = byte_off / u64::from(self.sector_size);
            let blocks = data_len / self.sector_size;
            match lba.checked_add(u64::from(blocks)) {
                Some(end) if end <= self.capacity_sectors => {}
                _ => return self.fail(queue, head, status_addr, BLK_S_IOERR),
            }
            (lba, blocks)
        };

        let Some(mut dma) = self.acquire_dma()? else {
            metrics::DMA_EXHAUSTED.increment();
            return self.fail(queue, head, status_addr, BLK_S_IOERR);
        };
        if opcode == Opcode::Write {
            let mut off = 0usize;
            for b in &data {
                self.mem
                    .read(b.addr, &mut dma.bytes_mut()[off..off + b.len as usize])?;
                off += b.len as usize;
            }
        }

        let payload = dma.slice(data_len);
        let state = InFlight {
            queue,
            head,
            dma,
            data_len,
            writable: if is_read { data } else { Vec::new() },
            status_addr,
            is_read,
        };
        let ticket = match lock(&self.slab)?.allocate(state) {
            Ok(t) => t,
            Err(state) => {
                log::warn!("in-flight slab full, failing request on queue {queue}");
                lock(&self.dma)?.release(state.dma);
                return self.fail(queue, head, status_addr, BLK_S_IOERR);
            }
        };

        let cmd = BackendCommand {
            opcode,
            lba,
            blocks,
            data: payload,
            user_data: ticket.pack(),
        };
        if let Err(e) = lock(&self.backend)?.submit(cmd) {
            metrics::BACKEND_SUBMIT_ERRORS.increment();
            log::warn!("backend submit failed on queue {queue}: {e}");
            if let Some(state) = lock(&self.slab)?.take(ticket) {
                lock(&self.dma)?.release(state.dma);
            }
            return self.fail(queue, head, status_addr, BLK_S_IOERR);
        }

        self.outstanding.fetch_add(1, Ordering::AcqRel);
        metrics::REQUESTS_OUTSTANDING.increment();
        metrics::REQUESTS_SUBMITTED.increment();
        Ok(())
    }

    /// Retire the request behind one backend completion: scatter read data
    /// back to the guest, write the status trailer, publish the used entry
    /// and release the DMA slot.
    pub(crate) fn complete_one(&self, completion: BackendCompletion) {
        let ticket = Ticket::unpack(completion.user_data);
        let state = match self.slab.lock() {
            Ok(mut slab) => slab.take(ticket),
            Err(_) => None,
        };
        let Some(state) = state else {
            metrics::STALE_COMPLETIONS.increment();
            log::warn!("dropping completion with stale ticket {ticket:?}");
            return;
        };
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        metrics::REQUESTS_OUTSTANDING.decrement();

        let mut used_len = 1u32;
        let status = if completion.is_success() {
            BLK_S_OK
        } else {
            metrics::REQUESTS_FAILED.increment();
            log::debug!(
                "command on queue {} failed with result {}",
                state.queue,
                completion.result
            );
            BLK_S_IOERR
        };
        if completion.is_success() && state.is_read {
            // Buffer ranges were validated at assembly; a write can only
            // fail here if the guest region itself went away.
            let mut off = 0usize;
            for b in &state.writable {
                let chunk = &state.dma.bytes()[off..off + b.len as usize];
                if let Err(e) = self.mem.write(b.addr, chunk) {
                    log::error!("read scatter failed: {e}");
                    break;
                }
                off += b.len as usize;
            }
            used_len += state.data_len;
        }
        if let Err(e) = self.mem.write_u8(state.status_addr, status) {
            log::error!("status write failed: {e}");
        }
        if let Err(e) = self.retire(state.queue, state.head, used_len) {
            log::error!("used-ring publish failed on queue {}: {e}", state.queue);
        }
        if let Ok(mut dma) = self.dma.lock() {
            dma.release(state.dma);
        }
    }
}
