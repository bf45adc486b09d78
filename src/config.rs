/// Configuration for a bridge instance (one backend device, one queue table).
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of guest queues served by this device. Block devices use 1,
    /// network devices use 2 (RX + TX).
    pub queues: u16,
    /// Maximum descriptors accepted per chain before the request is dropped
    /// with `ChainTooLong`.
    pub max_chain_buffers: usize,
    /// Number of slots in the pinned DMA arena.
    pub dma_slots: u16,
    /// Size of each DMA slot in bytes. Bounds the largest single transfer.
    pub dma_slot_len: u32,
    /// Attempts made to acquire a DMA slot before failing the request.
    /// Backoff between attempts grows linearly.
    pub dma_retry_attempts: u32,
    /// Base backoff in microseconds between DMA acquisition attempts.
    /// Attempt `n` sleeps `n * dma_retry_backoff_us`.
    pub dma_retry_backoff_us: u64,
    /// Maximum completions drained from the backend per reactor sweep.
    pub poll_batch: usize,
    /// Reactor sleep in microseconds when a sweep finds no completions.
    pub idle_backoff_us: u64,
    /// Merge-length limit for network RX queues: consecutive available-ring
    /// slots are coalesced into one receive request up to this many bytes.
    pub rx_merge_len: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queues: 1,
            max_chain_buffers: 32,
            dma_slots: 64,
            dma_slot_len: 128 * 1024,
            dma_retry_attempts: 8,
            dma_retry_backoff_us: 50,
            poll_batch: 64,
            idle_backoff_us: 100,
            rx_merge_len: 64 * 1024,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.queues == 0 {
            return Err(crate::error::Error::InvalidConfig(
                "queues must be > 0".into(),
            ));
        }
        if self.max_chain_buffers == 0 {
            return Err(crate::error::Error::InvalidConfig(
                "max_chain_buffers must be > 0".into(),
            ));
        }
        if self.dma_slots == 0 {
            return Err(crate::error::Error::InvalidConfig(
                "dma_slots must be > 0".into(),
            ));
        }
        if self.dma_slot_len < 512 {
            return Err(crate::error::Error::InvalidConfig(
                "dma_slot_len must be >= 512".into(),
            ));
        }
        if self.poll_batch == 0 {
            return Err(crate::error::Error::InvalidConfig(
                "poll_batch must be > 0".into(),
            ));
        }
        if self.rx_merge_len > self.dma_slot_len {
            return Err(crate::error::Error::InvalidConfig(
                "rx_merge_len must not exceed dma_slot_len".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Queue settings ───────────────────────────────────────────────

    /// Set the number of guest queues.
    pub fn queues(mut self, n: u16) -> Self {
        self.config.queues = n;
        self
    }

    /// Set the maximum descriptors accepted per chain.
    pub fn max_chain_buffers(mut self, n: usize) -> Self {
        self.config.max_chain_buffers = n;
        self
    }

    /// Set the merge-length limit for network RX queues.
    pub fn rx_merge_len(mut self, n: u32) -> Self {
        self.config.rx_merge_len = n;
        self
    }

    // ── DMA pool settings ────────────────────────────────────────────

    /// Set the number and size of DMA arena slots.
    pub fn dma_pool(mut self, slots: u16, slot_len: u32) -> Self {
        self.config.dma_slots = slots;
        self.config.dma_slot_len = slot_len;
        self
    }

    /// Set the DMA acquisition retry policy.
    pub fn dma_retry(mut self, attempts: u32, backoff_us: u64) -> Self {
        self.config.dma_retry_attempts = attempts;
        self.config.dma_retry_backoff_us = backoff_us;
        self
    }

    // ── Reactor settings ─────────────────────────────────────────────

    /// Set the maximum completions drained per reactor sweep.
    pub fn poll_batch(mut self, n: usize) -> Self {
        self.config.poll_batch = n;
        self
    }

    /// Set the reactor idle backoff in microseconds.
    pub fn idle_backoff_us(mut self, us: u64) -> Self {
        self.config.idle_backoff_us = us;
        self
    }

    // ── Terminal ─────────────────────────────────────────────────────

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_queues() {
        let config = ConfigBuilder::new().queues(0).build();
        assert!(config.is_err());
    }

    #[test]
    fn rejects_zero_dma_slots() {
        let config = ConfigBuilder::new().dma_pool(0, 4096).build();
        assert!(config.is_err());
    }

    #[test]
    fn rejects_merge_len_exceeding_slot() {
        let config = ConfigBuilder::new()
            .dma_pool(4, 4096)
            .rx_merge_len(8192)
            .build();
        assert!(config.is_err());
    }

    #[test]
    fn builder_round_trip() {
        let config = ConfigBuilder::new()
            .queues(2)
            .max_chain_buffers(16)
            .dma_pool(8, 16384)
            .dma_retry(4, 10)
            .poll_batch(32)
            .rx_merge_len(16384)
            .build()
            .expect("valid config");
        assert_eq!(config.queues, 2);
        assert_eq!(config.max_chain_buffers, 16);
        assert_eq!(config.dma_slots, 8);
        assert_eq!(config.dma_slot_len, 16384);
        assert_eq!(config.dma_retry_attempts, 4);
        assert_eq!(config.poll_batch, 32);
    }
}
