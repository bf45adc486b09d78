//! ringbridge bridges guest ring queues to host I/O backends inside a
//! library-OS sandbox.
//!
//! The guest publishes descriptor chains on split rings in shared memory;
//! the engine assembles them into requests, stages data through a pinned
//! DMA arena, and dispatches to a backend. Block devices complete
//! asynchronously through a per-bridge reactor thread; network ports are
//! polled. Completions are published back on the used rings with one entry
//! per accepted chain, and a channel of [`QueueEvent`]s stands in for the
//! guest interrupt line.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ringbridge::{BlockBridge, Config, GuestRegion, RamDisk, RingLayout};
//!
//! # fn main() -> Result<(), ringbridge::Error> {
//! let mem = Arc::new(GuestRegion::alloc(1 << 20)?);
//! let (bridge, events) = BlockBridge::attach(Config::default(), mem, RamDisk::new(2048))?;
//! bridge.activate_queue(0, RingLayout::new(128, 0x1000, 0x2000, 0x3000))?;
//! // Doorbell: the guest published new chains.
//! bridge.process_queue(0)?;
//! // Completion notifications arrive on `events`.
//! # let _ = events;
//! # Ok(())
//! # }
//! ```

mod backend;
mod chain;
mod config;
mod device;
mod dispatch;
mod dma;
mod error;
mod mem;
pub mod metrics;
mod net;
mod reactor;
mod ring;

/// Backend traits and the in-memory implementations.
pub use backend::{
    BackendCommand, BackendCompletion, FrameQueue, LoopbackPort, NetBackend, Opcode, RamDisk,
    StorageBackend,
};
/// Chain assembly types, exposed for custom drivers and tests.
pub use chain::{ChainBuf, Request, WalkMode};
/// Bridge configuration.
pub use config::{Config, ConfigBuilder};
/// The block bridge and its notification events.
pub use device::{BlockBridge, QueueEvent};
/// Block wire-format constants and header decoding.
pub use dispatch::{
    BlkHeader, BLK_HEADER_LEN, BLK_S_IOERR, BLK_S_OK, BLK_S_UNSUPP, BLK_T_FLUSH, BLK_T_IN,
    BLK_T_OUT, SECTOR_UNIT,
};
/// DMA arena types passed across the backend boundary.
pub use dma::{DmaBuffer, DmaPool, DmaSlice};
/// Crate error type.
pub use error::Error;
/// Shared guest memory.
pub use mem::GuestRegion;
/// The network bridge and its queue roles.
pub use net::{NetBridge, NET_HDR_LEN, RX_QUEUE, TX_QUEUE};
/// Ring geometry and descriptor flags.
pub use ring::{
    Desc, RingLayout, VirtQueue, AVAIL_F_NO_NOTIFY, DESC_F_NEXT, DESC_F_WRITE, MAX_QUEUE_CAPACITY,
};
