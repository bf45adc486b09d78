//! Host backend abstraction.
//!
//! A backend is the host-side device behind the rings: storage submits
//! commands and reports them through a completion poll, matching the
//! asynchronous submit/reap shape of an NVMe queue pair; network is a pair
//! of polled transmit/receive entry points. Backends see only DMA arena
//! slices, never guest memory.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::dma::DmaSlice;
use crate::error::Error;

/// Storage command opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    Read,
    Write,
    Flush,
}

/// One storage command. `user_data` is an opaque token round-tripped to the
/// matching completion; the engine packs its in-flight ticket into it.
#[derive(Debug)]
pub struct BackendCommand {
    pub opcode: Opcode,
    pub lba: u64,
    pub blocks: u32,
    pub data: DmaSlice,
    pub user_data: u64,
}

/// One reaped completion. Non-negative `result` is the byte count
/// transferred; negative is a negated errno.
#[derive(Clone, Copy, Debug)]
pub struct BackendCompletion {
    pub user_data: u64,
    pub result: i32,
}

impl BackendCompletion {
    pub fn is_success(&self) -> bool {
        self.result >= 0
    }
}

/// An NVMe-class block device namespace.
pub trait StorageBackend: Send {
    /// Logical block size in bytes.
    fn sector_size(&self) -> u32;

    /// Device capacity in sectors.
    fn capacity_sectors(&self) -> u64;

    /// Queue a command. Returns without waiting; the result arrives via
    /// [`poll_completions`](StorageBackend::poll_completions).
    fn submit(&mut self, cmd: BackendCommand) -> Result<(), Error>;

    /// Reap up to `max` finished commands into `out`. Returns the count.
    fn poll_completions(&mut self, out: &mut Vec<BackendCompletion>, max: usize) -> usize;
}

/// A polled network port.
pub trait NetBackend: Send {
    /// Hand one outbound frame to the port.
    fn transmit(&mut self, frame: &[u8]) -> Result<(), Error>;

    /// Poll for one inbound frame. Copies into `buf` and returns the frame
    /// length, or `None` when nothing is pending. Frames longer than `buf`
    /// are dropped.
    fn receive(&mut self, buf: &mut [u8]) -> Option<usize>;
}

// ── In-memory storage backend ────────────────────────────────────────

/// Block storage over a plain memory buffer.
///
/// Commands sit in a queue until polled, so completion ordering and the
/// submit/reap split behave like a real device. `pause_handle` freezes the
/// poll side to hold commands in flight deliberately.
pub struct RamDisk {
    data: Vec<u8>,
    sector_size: u32,
    pending: VecDeque<BackendCommand>,
    paused: Arc<AtomicBool>,
}

impl RamDisk {
    pub fn new(sectors: u64) -> Self {
        Self::with_sector_size(sectors, 512)
    }

    pub fn with_sector_size(sectors: u64, sector_size: u32) -> Self {
        RamDisk {
            data: vec![0u8; (sectors * u64::from(sector_size)) as usize],
            sector_size,
            pending: VecDeque::new(),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    /// While the returned flag is set, polls reap nothing and submitted
    /// commands stay in flight.
    pub fn pause_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.paused)
    }

    fn execute(&mut self, mut cmd: BackendCommand) -> BackendCompletion {
        let len = cmd.blocks as usize * self.sector_size as usize;
        let start = cmd.lba as usize * self.sector_size as usize;
        let result = match cmd.opcode {
            Opcode::Flush => 0,
            Opcode::Read | Opcode::Write => {
                match start.checked_add(len) {
                    Some(end) if end <= self.data.len() && len <= cmd.data.len as usize => {
                        if cmd.opcode == Opcode::Read {
                            cmd.data.as_mut_slice()[..len].copy_from_slice(&self.data[start..start + len]);
                        } else {
                            self.data[start..start + len].copy_from_slice(&cmd.data.as_slice()[..len]);
                        }
                        len as i32
                    }
                    _ => -libc::EIO,
                }
            }
        };
        BackendCompletion {
            user_data: cmd.user_data,
            result,
        }
    }
}

impl StorageBackend for RamDisk {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn capacity_sectors(&self) -> u64 {
        self.data.len() as u64 / u64::from(self.sector_size)
    }

    fn submit(&mut self, cmd: BackendCommand) -> Result<(), Error> {
        self.pending.push_back(cmd);
        Ok(())
    }

    fn poll_completions(&mut self, out: &mut Vec<BackendCompletion>, max: usize) -> usize {
        if self.paused.load(Ordering::Acquire) {
            return 0;
        }
        let mut reaped = 0;
        while reaped < max {
            let Some(cmd) = self.pending.pop_front() else {
                break;
            };
            let completion = self.execute(cmd);
            out.push(completion);
            reaped += 1;
        }
        reaped
    }
}

// ── In-memory network backend ────────────────────────────────────────

/// Shared frame queue handle for injecting RX traffic and draining TX
/// traffic from outside the port.
pub type FrameQueue = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// Network port over two in-memory frame queues.
pub struct LoopbackPort {
    rx: FrameQueue,
    tx: FrameQueue,
}

impl LoopbackPort {
    pub fn new() -> Self {
        LoopbackPort {
            rx: Arc::new(Mutex::new(VecDeque::new())),
            tx: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Queue feeding `receive`.
    pub fn rx_handle(&self) -> FrameQueue {
        Arc::clone(&self.rx)
    }

    /// Queue filled by `transmit`.
    pub fn tx_handle(&self) -> FrameQueue {
        Arc::clone(&self.tx)
    }
}

impl Default for LoopbackPort {
    fn default() -> Self {
        Self::new()
    }
}

impl NetBackend for LoopbackPort {
    fn transmit(&mut self, frame: &[u8]) -> Result<(), Error> {
        let mut tx = self.tx.lock().map_err(|_| poisoned())?;
        tx.push_back(frame.to_vec());
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Option<usize> {
        let mut rx = self.rx.lock().ok()?;
        loop {
            let frame = rx.pop_front()?;
            if frame.len() > buf.len() {
                log::debug!("dropping {} byte frame, receive buffer is {}", frame.len(), buf.len());
                continue;
            }
            buf[..frame.len()].copy_from_slice(&frame);
            return Some(frame.len());
        }
    }
}

fn poisoned() -> Error {
    Error::Io(std::io::Error::other("frame queue lock poisoned"))
}
