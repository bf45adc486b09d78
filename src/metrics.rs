use metriken::{metric, Counter, Gauge};

#[metric(
    name = "ringbridge/requests/submitted",
    description = "requests accepted from the rings and handed to a backend"
)]
pub static REQUESTS_SUBMITTED: Counter = Counter::new();

#[metric(
    name = "ringbridge/requests/failed",
    description = "requests retired with an error status"
)]
pub static REQUESTS_FAILED: Counter = Counter::new();

#[metric(
    name = "ringbridge/requests/outstanding",
    description = "commands currently in flight at a backend"
)]
pub static REQUESTS_OUTSTANDING: Gauge = Gauge::new();

#[metric(
    name = "ringbridge/completions/delivered",
    description = "used-ring entries published"
)]
pub static COMPLETIONS_DELIVERED: Counter = Counter::new();

#[metric(
    name = "ringbridge/chains/truncated",
    description = "descriptor chains dropped for exceeding the buffer limit"
)]
pub static CHAINS_TRUNCATED: Counter = Counter::new();

#[metric(
    name = "ringbridge/descriptors/faults",
    description = "malformed descriptors that halted a queue"
)]
pub static DESCRIPTOR_FAULTS: Counter = Counter::new();

#[metric(
    name = "ringbridge/dma/exhausted",
    description = "requests failed after exhausting DMA slot retries"
)]
pub static DMA_EXHAUSTED: Counter = Counter::new();

#[metric(
    name = "ringbridge/backend/submit_errors",
    description = "backend submissions that failed synchronously"
)]
pub static BACKEND_SUBMIT_ERRORS: Counter = Counter::new();

#[metric(
    name = "ringbridge/completions/stale",
    description = "backend completions whose ticket no longer matched a slab entry"
)]
pub static STALE_COMPLETIONS: Counter = Counter::new();

#[metric(
    name = "ringbridge/notifications/sent",
    description = "completion notifications delivered to the guest side"
)]
pub static NOTIFICATIONS_SENT: Counter = Counter::new();

#[metric(
    name = "ringbridge/net/tx_frames",
    description = "frames transmitted from the TX ring"
)]
pub static NET_TX_FRAMES: Counter = Counter::new();

#[metric(
    name = "ringbridge/net/rx_frames",
    description = "frames delivered into the RX ring"
)]
pub static NET_RX_FRAMES: Counter = Counter::new();

#[metric(
    name = "ringbridge/net/rx_dropped",
    description = "inbound frames dropped for want of RX ring buffers"
)]
pub static NET_RX_DROPPED: Counter = Counter::new();
