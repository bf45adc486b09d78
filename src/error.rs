use std::io;

use thiserror::Error;

/// Errors returned by the ringbridge engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Guest memory or DMA arena setup failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Configuration value out of range.
    #[error("config: {0}")]
    InvalidConfig(String),
    /// Ring geometry is unusable (capacity, alignment, or bounds).
    #[error("invalid ring geometry: {0}")]
    InvalidGeometry(String),
    /// Queue id is outside the configured queue table.
    #[error("unknown queue {0}")]
    UnknownQueue(u16),
    /// Queue has not been activated.
    #[error("queue {0} not ready")]
    QueueNotReady(u16),
    /// Queue processing was halted by a prior descriptor fault. Sticky:
    /// retrying without re-activation fails the same way.
    #[error("queue {0} halted after descriptor fault")]
    QueueHalted(u16),
    /// A published descriptor has a null address or zero length, or points
    /// outside the descriptor table. The ring is considered corrupted.
    #[error("malformed descriptor (addr {addr:#x}, len {len})")]
    MalformedDescriptor { addr: u64, len: u32 },
    /// A descriptor chain exceeded the configured buffer limit. The request
    /// is dropped and retired; the queue keeps running.
    #[error("descriptor chain too long")]
    ChainTooLong,
    /// A guest address range falls outside the shared memory region.
    #[error("guest address out of range: {addr:#x}+{len}")]
    BadAddress { addr: u64, len: usize },
    /// New submissions are rejected while draining.
    #[error("device is draining")]
    Draining,
    /// Outstanding commands did not reach zero within the drain timeout.
    /// Reported, non-fatal: the caller decides whether to force detach.
    #[error("drain timed out")]
    DrainTimeout,
    /// The device has been detached.
    #[error("device is detached")]
    Detached,
}
