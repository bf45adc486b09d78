//! End-to-end block device tests: a test driver builds descriptor chains in
//! guest memory, rings the doorbell, and watches the used ring.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ringbridge::{
    BlockBridge, Config, ConfigBuilder, Desc, Error, GuestRegion, QueueEvent, RamDisk, RingLayout,
    AVAIL_F_NO_NOTIFY, BLK_S_IOERR, BLK_S_OK, BLK_S_UNSUPP, BLK_T_FLUSH, BLK_T_IN, BLK_T_OUT,
    DESC_F_NEXT, DESC_F_WRITE,
};

const HDR_BASE: u64 = 0x10000;
const DATA_BASE: u64 = 0x40000;
const STATUS_SENTINEL: u8 = 0xee;

fn test_config() -> Config {
    ConfigBuilder::new()
        .dma_pool(32, 4096)
        .rx_merge_len(4096)
        .dma_retry(2, 10)
        .idle_backoff_us(50)
        .build()
        .expect("valid config")
}

/// Guest-side view of one queue: builds chains and publishes them.
struct Driver {
    mem: Arc<GuestRegion>,
    layout: RingLayout,
    avail: u16,
}

impl Driver {
    fn new(mem: Arc<GuestRegion>, layout: RingLayout) -> Self {
        Driver {
            mem,
            layout,
            avail: 0,
        }
    }

    fn write_desc(&self, i: u16, d: Desc) {
        let base = self.layout.desc_entry(i);
        self.mem.write_u64(base, d.addr).unwrap();
        self.mem.write_u32(base + 8, d.len).unwrap();
        self.mem.write_u16(base + 12, d.flags).unwrap();
        self.mem.write_u16(base + 14, d.next).unwrap();
    }

    /// Lay out a block request starting at descriptor `base`: header,
    /// optional data buffer, status trailer. Returns the trailer address.
    fn blk_request(
        &self,
        base: u16,
        req_type: u32,
        sector: u64,
        data: Option<(u64, u32, bool)>,
    ) -> u64 {
        let hdr = HDR_BASE + u64::from(base) * 0x20;
        let status = hdr + 0x10;
        self.mem.write_u32(hdr, req_type).unwrap();
        self.mem.write_u32(hdr + 4, 0).unwrap();
        self.mem.write_u64(hdr + 8, sector).unwrap();
        self.mem.write_u8(status, STATUS_SENTINEL).unwrap();

        match data {
            Some((addr, len, writable)) => {
                self.write_desc(base, Desc { addr: hdr, len: 16, flags: DESC_F_NEXT, next: base + 1 });
                let flags = DESC_F_NEXT | if writable { DESC_F_WRITE } else { 0 };
                self.write_desc(base + 1, Desc { addr, len, flags, next: base + 2 });
                self.write_desc(base + 2, Desc { addr: status, len: 1, flags: DESC_F_WRITE, next: 0 });
            }
            None => {
                self.write_desc(base, Desc { addr: hdr, len: 16, flags: DESC_F_NEXT, next: base + 1 });
                self.write_desc(base + 1, Desc { addr: status, len: 1, flags: DESC_F_WRITE, next: 0 });
            }
        }
        status
    }

    fn publish(&mut self, head: u16) {
        let mask = self.layout.capacity - 1;
        self.mem
            .write_u16(self.layout.avail_ring_entry(self.avail & mask), head)
            .unwrap();
        self.avail = self.avail.wrapping_add(1);
        self.mem
            .store_u16_release(self.layout.avail_idx_addr(), self.avail)
            .unwrap();
    }

    fn used_idx(&self) -> u16 {
        self.mem.read_u16(self.layout.used_idx_addr()).unwrap()
    }

    fn used_entry(&self, slot: u16) -> (u32, u32) {
        let addr = self.layout.used_ring_entry(slot & (self.layout.capacity - 1));
        (
            self.mem.read_u32(addr).unwrap(),
            self.mem.read_u32(addr + 4).unwrap(),
        )
    }

    fn wait_used(&self, target: u16) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.used_idx() != target {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for used index {target}, at {}",
                self.used_idx()
            );
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn status(&self, status_addr: u64) -> u8 {
        self.mem.read_u8(status_addr).unwrap()
    }
}

fn setup(capacity: u16) -> (BlockBridge<RamDisk>, Driver, crossbeam_channel::Receiver<QueueEvent>) {
    setup_with(capacity, test_config(), RamDisk::new(256))
}

fn setup_with(
    capacity: u16,
    config: Config,
    disk: RamDisk,
) -> (BlockBridge<RamDisk>, Driver, crossbeam_channel::Receiver<QueueEvent>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mem = Arc::new(GuestRegion::alloc(1 << 20).unwrap());
    let (bridge, events) = BlockBridge::attach(config, Arc::clone(&mem), disk).unwrap();
    let layout = RingLayout::new(capacity, 0x1000, 0x2000, 0x3000);
    bridge.activate_queue(0, layout).unwrap();
    (bridge, Driver::new(mem, layout), events)
}

#[test]
fn write_then_read_round_trip() {
    let (bridge, mut drv, _events) = setup(8);

    let wdata = DATA_BASE;
    drv.mem.write(wdata, &[0xab; 512]).unwrap();
    let wstatus = drv.blk_request(0, BLK_T_OUT, 4, Some((wdata, 512, false)));
    drv.publish(0);
    assert_eq!(bridge.process_queue(0).unwrap(), 1);
    drv.wait_used(1);
    assert_eq!(drv.status(wstatus), BLK_S_OK);
    assert_eq!(drv.used_entry(0), (0, 1));

    let rdata = DATA_BASE + 0x1000;
    let rstatus = drv.blk_request(4, BLK_T_IN, 4, Some((rdata, 512, true)));
    drv.publish(4);
    assert_eq!(bridge.process_queue(0).unwrap(), 1);
    drv.wait_used(2);
    assert_eq!(drv.status(rstatus), BLK_S_OK);
    // Read retires with the data length plus the status byte.
    assert_eq!(drv.used_entry(1), (4, 513));
    let mut out = [0u8; 512];
    drv.mem.read(rdata, &mut out).unwrap();
    assert!(out.iter().all(|&b| b == 0xab));
}

#[test]
fn flush_completes_with_ok_status() {
    let (bridge, mut drv, _events) = setup(8);
    let status = drv.blk_request(0, BLK_T_FLUSH, 0, None);
    drv.publish(0);
    assert_eq!(bridge.process_queue(0).unwrap(), 1);
    drv.wait_used(1);
    assert_eq!(drv.status(status), BLK_S_OK);
    assert_eq!(drv.used_entry(0), (0, 1));
}

#[test]
fn unknown_request_type_is_unsupported() {
    let (bridge, mut drv, _events) = setup(8);
    let status = drv.blk_request(0, 99, 0, Some((DATA_BASE, 512, false)));
    drv.publish(0);
    // Rejected synchronously: the used entry is published before return.
    assert_eq!(bridge.process_queue(0).unwrap(), 0);
    assert_eq!(drv.used_idx(), 1);
    assert_eq!(drv.status(status), BLK_S_UNSUPP);
    assert_eq!(drv.used_entry(0), (0, 1));
}

#[test]
fn out_of_range_sector_fails_with_ioerr() {
    let (bridge, mut drv, _events) = setup(8);
    // Device has 256 sectors.
    let status = drv.blk_request(0, BLK_T_OUT, 100_000, Some((DATA_BASE, 512, false)));
    drv.publish(0);
    assert_eq!(bridge.process_queue(0).unwrap(), 0);
    assert_eq!(drv.status(status), BLK_S_IOERR);
    assert_eq!(drv.used_idx(), 1);
}

#[test]
fn misaligned_transfer_fails_with_ioerr() {
    let (bridge, mut drv, _events) = setup(8);
    // 100 bytes is not a multiple of the 512-byte sector size.
    let status = drv.blk_request(0, BLK_T_IN, 0, Some((DATA_BASE, 100, true)));
    drv.publish(0);
    assert_eq!(bridge.process_queue(0).unwrap(), 0);
    assert_eq!(drv.status(status), BLK_S_IOERR);
    assert_eq!(drv.used_idx(), 1);
}

#[test]
fn pipelined_writes_then_reads() {
    let (bridge, mut drv, _events) = setup(64);
    let batch = 16u16;

    // Publish a whole batch of writes before ringing once.
    for i in 0..batch {
        let data = DATA_BASE + u64::from(i) * 0x1000;
        drv.mem.write(data, &[i as u8 + 1; 512]).unwrap();
        drv.blk_request(i * 3, BLK_T_OUT, u64::from(i), Some((data, 512, false)));
    }
    for i in 0..batch {
        drv.publish(i * 3);
    }
    assert_eq!(bridge.process_queue(0).unwrap(), batch as usize);
    drv.wait_used(batch);

    // Read everything back, again as one batch.
    for i in 0..batch {
        let data = DATA_BASE + 0x40000 + u64::from(i) * 0x1000;
        drv.blk_request(i * 3, BLK_T_IN, u64::from(i), Some((data, 512, true)));
    }
    for i in 0..batch {
        drv.publish(i * 3);
    }
    assert_eq!(bridge.process_queue(0).unwrap(), batch as usize);
    drv.wait_used(batch * 2);

    for i in 0..batch {
        let data = DATA_BASE + 0x40000 + u64::from(i) * 0x1000;
        let mut out = [0u8; 512];
        drv.mem.read(data, &mut out).unwrap();
        assert!(
            out.iter().all(|&b| b == i as u8 + 1),
            "sector {i} read back wrong data"
        );
    }
}

#[test]
fn thousand_requests_retire_exactly_once() {
    let (bridge, mut drv, _events) = setup(64);
    let window = 16u32;
    let total = 1000u32;

    // Keep `window` writes in flight; the reactor drains concurrently while
    // the driver refills freed ring slots. Every used entry must retire the
    // oldest outstanding head exactly once (the disk completes in order).
    let mut outstanding: std::collections::VecDeque<u32> = std::collections::VecDeque::new();
    let mut submitted = 0u32;
    let mut completed = 0u32;
    let mut next_used = 0u16;
    let deadline = Instant::now() + Duration::from_secs(30);

    while completed < total {
        assert!(Instant::now() < deadline, "stalled at {completed}/{total}");
        while submitted < total && submitted - completed < window {
            let slot = (submitted % window) as u16;
            let base = slot * 3;
            let data = DATA_BASE + u64::from(slot) * 0x1000;
            drv.mem.write(data, &[(submitted % 251) as u8; 512]).unwrap();
            drv.blk_request(base, BLK_T_OUT, u64::from(submitted % 200), Some((data, 512, false)));
            drv.publish(base);
            outstanding.push_back(u32::from(base));
            submitted += 1;
        }
        bridge.process_queue(0).unwrap();

        let used = drv.used_idx();
        while next_used != used {
            let (id, len) = drv.used_entry(next_used);
            assert_eq!(len, 1);
            let expected = outstanding.pop_front().expect("used entry with nothing in flight");
            assert_eq!(id, expected, "used entry retired the wrong head");
            next_used = next_used.wrapping_add(1);
            completed += 1;
        }
        if completed < total {
            std::thread::sleep(Duration::from_micros(200));
        }
    }
    assert!(outstanding.is_empty());
    assert_eq!(drv.used_idx(), (total % 65536) as u16);
}

#[test]
fn over_long_chain_never_reaches_the_disk() {
    let config = ConfigBuilder::new()
        .max_chain_buffers(4)
        .dma_pool(8, 4096)
        .rx_merge_len(4096)
        .build()
        .expect("valid config");
    let (bridge, mut drv, _events) = setup_with(8, config, RamDisk::new(256));

    // A six-descriptor write chain targeting sector 0.
    let hdr = HDR_BASE;
    drv.mem.write_u32(hdr, BLK_T_OUT).unwrap();
    drv.mem.write_u64(hdr + 8, 0).unwrap();
    drv.write_desc(0, Desc { addr: hdr, len: 16, flags: DESC_F_NEXT, next: 1 });
    for i in 1..5u16 {
        drv.mem.write(DATA_BASE + u64::from(i) * 0x1000, &[0x5a; 512]).unwrap();
        drv.write_desc(i, Desc {
            addr: DATA_BASE + u64::from(i) * 0x1000,
            len: 512,
            flags: DESC_F_NEXT,
            next: i + 1,
        });
    }
    drv.write_desc(5, Desc { addr: hdr + 0x10, len: 1, flags: DESC_F_WRITE, next: 0 });
    drv.publish(0);

    // Dropped without dispatch, but the slot is still retired: exactly one
    // zero-length used entry, no status byte.
    assert_eq!(bridge.process_queue(0).unwrap(), 0);
    assert_eq!(drv.used_idx(), 1);
    assert_eq!(drv.used_entry(0), (0, 0));

    // Sector 0 was never written.
    let rstatus = drv.blk_request(0, BLK_T_IN, 0, Some((DATA_BASE, 512, true)));
    drv.publish(0);
    assert_eq!(bridge.process_queue(0).unwrap(), 1);
    drv.wait_used(2);
    assert_eq!(drv.status(rstatus), BLK_S_OK);
    let mut out = [0u8; 512];
    drv.mem.read(DATA_BASE, &mut out).unwrap();
    assert!(out.iter().all(|&b| b == 0));
}

#[test]
fn malformed_descriptor_halts_the_queue() {
    let (bridge, mut drv, _events) = setup(8);
    // Null buffer address.
    drv.write_desc(0, Desc { addr: 0, len: 512, flags: 0, next: 0 });
    drv.publish(0);

    assert!(matches!(
        bridge.process_queue(0),
        Err(Error::MalformedDescriptor { .. })
    ));
    // The halt is sticky and idempotent.
    assert!(matches!(bridge.process_queue(0), Err(Error::QueueHalted(0))));
    assert!(matches!(bridge.process_queue(0), Err(Error::QueueHalted(0))));
    // No used entry was published for the poisoned chain.
    assert_eq!(drv.used_idx(), 0);
}

#[test]
fn reactivation_clears_a_halt() {
    let (bridge, mut drv, _events) = setup(8);
    drv.write_desc(0, Desc { addr: 0, len: 512, flags: 0, next: 0 });
    drv.publish(0);
    let _ = bridge.process_queue(0);
    assert!(matches!(bridge.process_queue(0), Err(Error::QueueHalted(0))));

    // The guest resets the queue: fresh rings, clean state.
    let layout = RingLayout::new(8, 0x5000, 0x6000, 0x7000);
    bridge.activate_queue(0, layout).unwrap();
    let mut drv2 = Driver::new(Arc::clone(&drv.mem), layout);
    let status = drv2.blk_request(0, BLK_T_FLUSH, 0, None);
    drv2.publish(0);
    assert_eq!(bridge.process_queue(0).unwrap(), 1);
    drv2.wait_used(1);
    assert_eq!(drv2.status(status), BLK_S_OK);
}

#[test]
fn completion_notifications_respect_suppression() {
    let (bridge, mut drv, events) = setup(8);

    let s1 = drv.blk_request(0, BLK_T_FLUSH, 0, None);
    drv.publish(0);
    bridge.process_queue(0).unwrap();
    drv.wait_used(1);
    assert_eq!(drv.status(s1), BLK_S_OK);
    assert_eq!(
        events.recv_timeout(Duration::from_secs(2)).unwrap(),
        QueueEvent { queue: 0 }
    );

    // Suppress notifications and complete another request.
    drv.mem
        .write_u16(drv.layout.avail_flags_addr(), AVAIL_F_NO_NOTIFY)
        .unwrap();
    drv.blk_request(4, BLK_T_FLUSH, 0, None);
    drv.publish(4);
    bridge.process_queue(0).unwrap();
    drv.wait_used(2);
    assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn ring_indices_wrap_around() {
    let (bridge, mut drv, _events) = setup(4);
    for round in 0..10u16 {
        let status = drv.blk_request(0, BLK_T_FLUSH, 0, None);
        drv.publish(0);
        assert_eq!(bridge.process_queue(0).unwrap(), 1);
        drv.wait_used(round + 1);
        assert_eq!(drv.status(status), BLK_S_OK);
    }
    assert_eq!(drv.used_idx(), 10);
}
