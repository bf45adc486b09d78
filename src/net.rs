//! Network bridge: polled TX/RX pump over a pair of rings.
//!
//! Queue 0 receives (guest posts writable buffers, the port fills them),
//! queue 1 transmits. Both directions are polled from the caller's thread;
//! there is no reactor because the port itself completes synchronously.
//! Frames carry a fixed 10-byte header: zero-filled on the way in, skipped
//! on the way out.
//!
//! The receive side runs the rings in merge mode: consecutive
//! available-ring slots, one descriptor each, are coalesced until the frame
//! fits, and every consumed slot gets its own used-ring entry carrying the
//! bytes written into its buffer.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};

use crate::backend::NetBackend;
use crate::chain::{assemble, Request, WalkMode};
use crate::config::Config;
use crate::device::{lock, QueueEvent, STATE_ACTIVE, STATE_DETACHED, STATE_DRAINING};
use crate::dma::DmaPool;
use crate::error::Error;
use crate::mem::GuestRegion;
use crate::metrics;
use crate::ring::{RingLayout, VirtQueue};

pub const RX_QUEUE: u16 = 0;
pub const TX_QUEUE: u16 = 1;
/// Fixed frame header length on both rings.
pub const NET_HDR_LEN: u32 = 10;

#[derive(Default)]
struct NetQueue {
    vq: Option<VirtQueue>,
    halted: bool,
}

/// One attached network port.
pub struct NetBridge<P: NetBackend> {
    config: Config,
    mem: Arc<GuestRegion>,
    port: Mutex<P>,
    dma: Mutex<DmaPool>,
    queues: [Mutex<NetQueue>; 2],
    state: AtomicU8,
    notify_tx: Sender<QueueEvent>,
}

impl<P: NetBackend> NetBridge<P> {
    pub fn attach(
        config: Config,
        mem: Arc<GuestRegion>,
        port: P,
    ) -> Result<(Self, Receiver<QueueEvent>), Error> {
        config.validate()?;
        if config.queues != 2 {
            return Err(Error::InvalidConfig(
                "network devices use exactly 2 queues (RX + TX)".into(),
            ));
        }
        let dma = DmaPool::new(config.dma_slots, config.dma_slot_len)?;
        let (notify_tx, notify_rx) = crossbeam_channel::unbounded();
        Ok((
            NetBridge {
                config,
                mem,
                port: Mutex::new(port),
                dma: Mutex::new(dma),
                queues: [Mutex::new(NetQueue::default()), Mutex::new(NetQueue::default())],
                state: AtomicU8::new(STATE_ACTIVE),
                notify_tx,
            },
            notify_rx,
        ))
    }

    pub fn activate_queue(&self, queue: u16, layout: RingLayout) -> Result<(), Error> {
        if self.state.load(Ordering::Acquire) == STATE_DETACHED {
            return Err(Error::Detached);
        }
        let slot = self
            .queues
            .get(queue as usize)
            .ok_or(Error::UnknownQueue(queue))?;
        let vq = VirtQueue::activate(layout, &self.mem)?;
        let mut slot = lock(slot)?;
        slot.vq = Some(vq);
        slot.halted = false;
        Ok(())
    }

    fn check_state(&self) -> Result<(), Error> {
        match self.state.load(Ordering::Acquire) {
            STATE_DRAINING => Err(Error::Draining),
            STATE_DETACHED => Err(Error::Detached),
            _ => Ok(()),
        }
    }

    fn notify(&self, queue: u16, wanted: bool) {
        if wanted {
            metrics::NOTIFICATIONS_SENT.increment();
            let _ = self.notify_tx.send(QueueEvent { queue });
        }
    }

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

    /// Drain the TX ring: gather each pending chain past its header and
    /// hand the frame to the port. Returns the number of frames sent.
    pub fn process_tx(&self) -> Result<usize, Error> {
        self.check_state()?;
        let mut sent = 0;
        loop {
            let req = {
                let mut slot = lock(&self.queues[TX_QUEUE as usize])?;
                if slot.halted {
                    return Err(Error::QueueHalted(TX_QUEUE));
                }
                let vq = slot.vq.as_mut().ok_or(Error::QueueNotReady(TX_QUEUE))?;
                match assemble(
                    vq,
                    &self.mem,
                    WalkMode::Chained,
                    self.config.max_chain_buffers,
                ) {
                    Ok(None) => break,
                    Ok(Some(req)) => {
                        vq.advance(req.slots_consumed);
                        Some(req)
                    }
                    Err(Error::ChainTooLong) => {
                        let head = vq.avail_head(&self.mem, vq.next_avail())?;
                        vq.advance(1);
                        let notify =
                            vq.publish_completion(&self.mem, u32::from(head), 0)?;
                        drop(slot);
                        metrics::CHAINS_TRUNCATED.increment();
                        metrics::REQUESTS_FAILED.increment();
                        metrics::COMPLETIONS_DELIVERED.increment();
                        self.notify(TX_QUEUE, notify);
                        None
                    }
                    Err(e @ Error::MalformedDescriptor { .. }) => {
                        slot.halted = true;
                        metrics::DESCRIPTOR_FAULTS.increment();
                        log::error!("tx queue halted: {e}");
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                }
            };
            if let Some(req) = req {
                if self.transmit_one(&req)? {
                    sent += 1;
                }
            }
        }
        Ok(sent)
    }

    /// Stage one TX chain through the DMA arena and transmit it. The ring
    /// slot is retired either way; the return value says whether a frame
    /// actually left.
    fn transmit_one(&self, req: &Request) -> Result<bool, Error> {
        let head = u32::from(req.head);
        let total = req.readable_len();
        let dma_slot_len = lock(&self.dma)?.slot_len();
        if total <= NET_HDR_LEN || total - NET_HDR_LEN > dma_slot_len {
            metrics::REQUESTS_FAILED.increment();
            log::debug!("dropping tx chain with unusable length {total}");
            self.retire(TX_QUEUE, head, 0)?;
            return Ok(false);
        }
        let frame_len = (total - NET_HDR_LEN) as usize;

        let Some(mut dma) = lock(&self.dma)?.try_acquire() else {
            metrics::DMA_EXHAUSTED.increment();
            metrics::REQUESTS_FAILED.increment();
            self.retire(TX_QUEUE, head, 0)?;
            return Ok(false);
        };
        // Gather the readable byte stream, skipping the header prefix.
        let mut skip = NET_HDR_LEN as usize;
        let mut off = 0usize;
        for buf in req.bufs.iter().filter(|b| !b.device_writable) {
            let len = buf.len as usize;
            let take = len.saturating_sub(skip);
            if take > 0 {
                self.mem.read(
                    buf.addr + (len - take) as u64,
                    &mut dma.bytes_mut()[off..off + take],
                )?;
                off += take;
            }
            skip = skip.saturating_sub(len);
        }

        let result = {
            let mut port = lock(&self.port)?;
            port.transmit(&dma.bytes()[..frame_len])
        };
        lock(&self.dma)?.release(dma);
        match result {
            Ok(()) => {
                metrics::NET_TX_FRAMES.increment();
                self.retire(TX_QUEUE, head, 0)?;
                Ok(true)
            }
            Err(e) => {
                metrics::BACKEND_SUBMIT_ERRORS.increment();
                metrics::REQUESTS_FAILED.increment();
                log::warn!("port transmit failed: {e}");
                self.retire(TX_QUEUE, head, 0)?;
                Ok(false)
            }
        }
    }

    /// Poll the port and deliver inbound frames into the RX ring. Returns
    /// the number of frames delivered. Frames that do not fit in the
    /// buffers currently posted are dropped, not queued.
    pub fn pump_rx(&self) -> Result<usize, Error> {
        self.check_state()?;
        let mut delivered = 0;
        loop {
            let Some(mut dma) = lock(&self.dma)?.try_acquire() else {
                metrics::DMA_EXHAUSTED.increment();
                break;
            };
            let window = self.config.rx_merge_len.min(dma.len()) as usize;
            let received = {
                let mut port = lock(&self.port)?;
                port.receive(&mut dma.bytes_mut()[..window])
            };
            let Some(frame_len) = received else {
                lock(&self.dma)?.release(dma);
                break;
            };
            let outcome = self.deliver_one(&dma.bytes()[..frame_len]);
            lock(&self.dma)?.release(dma);
            match outcome? {
                true => delivered += 1,
                false => break,
            }
        }
        Ok(delivered)
    }

    /// Scatter one inbound frame (behind a zeroed header) across merged RX
    /// buffers. Returns whether the frame was delivered; an undeliverable
    /// frame is dropped and the posted buffers are left alone.
    fn deliver_one(&self, frame: &[u8]) -> Result<bool, Error> {
        let needed = NET_HDR_LEN + frame.len() as u32;
        let mut slot = lock(&self.queues[RX_QUEUE as usize])?;
        if slot.halted {
            return Err(Error::QueueHalted(RX_QUEUE));
        }
        let vq = slot.vq.as_mut().ok_or(Error::QueueNotReady(RX_QUEUE))?;

        let req = match assemble(
            vq,
            &self.mem,
            WalkMode::Merged { max_len: needed },
            self.config.max_chain_buffers,
        ) {
            Ok(Some(req)) if req.total_len() >= needed => req,
            Ok(_) | Err(Error::ChainTooLong) => {
                metrics::NET_RX_DROPPED.increment();
                log::debug!("dropping {} byte rx frame, ring buffers exhausted", frame.len());
                return Ok(false);
            }
            Err(e @ Error::MalformedDescriptor { .. }) => {
                slot.halted = true;
                metrics::DESCRIPTOR_FAULTS.increment();
                log::error!("rx queue halted: {e}");
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        if req.bufs.iter().any(|b| !b.device_writable) {
            slot.halted = true;
            metrics::DESCRIPTOR_FAULTS.increment();
            log::error!("rx queue halted: read-only buffer posted for receive");
            return Err(Error::MalformedDescriptor {
                addr: req.bufs[0].addr,
                len: req.bufs[0].len,
            });
        }

        // Heads of every consumed slot, captured before the advance.
        let mut heads = Vec::with_capacity(req.slots_consumed as usize);
        for i in 0..req.slots_consumed {
            heads.push(vq.avail_head(&self.mem, vq.next_avail().wrapping_add(i))?);
        }
        vq.advance(req.slots_consumed);

        // Scatter header + payload across the merged buffers in order.
        let mut remaining = needed as usize;
        let mut src_off = 0usize;
        let mut notify = false;
        for (buf, head) in req.bufs.iter().zip(&heads) {
            let take = remaining.min(buf.len as usize);
            if take > 0 {
                let mut chunk = vec![0u8; take];
                for (i, byte) in chunk.iter_mut().enumerate() {
                    let pos = src_off + i;
                    if pos >= NET_HDR_LEN as usize {
                        *byte = frame[pos - NET_HDR_LEN as usize];
                    }
                }
                self.mem.write(buf.addr, &chunk)?;
                remaining -= take;
                src_off += take;
            }
            notify |= vq.publish_completion(&self.mem, u32::from(*head), take as u32)?;
            metrics::COMPLETIONS_DELIVERED.increment();
        }
        drop(slot);
        metrics::NET_RX_FRAMES.increment();
        self.notify(RX_QUEUE, notify);
        Ok(true)
    }

    /// Stop accepting ring work. Idempotent.
    pub fn begin_drain(&self) {
        self.state.fetch_max(STATE_DRAINING, Ordering::AcqRel);
    }

    /// Tear down. The pump is synchronous, so nothing can remain in
    /// flight; safe to call more than once.
    pub fn detach(&mut self) {
        self.state.store(STATE_DETACHED, Ordering::Release);
    }
}
