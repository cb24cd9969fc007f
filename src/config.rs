//! Configuration for the messaging engine.

/// Engine configuration.
///
/// Controls flow control, ordering, reorder window sizing and the
/// per-pass work limits of the progress engine. All values are consumed
/// by the endpoint at construction; there are no process-wide globals.
#[derive(Debug, Clone)]
pub struct RdmConfig {
    /// Initial receive credits granted to each peer.
    /// Default: 128
    pub rx_window_size: u16,
    /// Lower bound of the credit request proposed in each RTS.
    /// Default: 32
    pub tx_min_credits: u16,
    /// Upper bound of the credit request, and the initial per-peer
    /// transmit credit budget.
    /// Default: 64
    pub tx_max_credits: u16,
    /// Reorder window size per peer, in message ids.
    /// Default: 16384
    pub recvwin_size: usize,
    /// Completion queue capacity hint.
    /// Default: 8192
    pub cq_size: usize,
    /// Cap on the RNR backoff interval in microseconds.
    /// Default: 1,000,000
    pub max_timeout: u64,
    /// Initial RNR backoff interval in microseconds.
    /// 0 selects a random value in [40, 120] per peer.
    pub timeout_interval: u64,
    /// Maximum completions consumed from the main fabric per pump pass.
    /// Default: 50
    pub efa_cq_read_size: usize,
    /// Maximum completions consumed from the shared-memory transport per pass.
    /// Default: 50
    pub shm_cq_read_size: usize,
    /// Enforce send-after-send ordering with a per-peer reorder window.
    /// Default: true
    pub enable_sas_ordering: bool,
    /// Route operations to co-located peers over the shared-memory transport.
    /// Default: true
    pub enable_shm_transfer: bool,
    /// Packet payload capacity. 0 takes the lower transport's MTU,
    /// bounded by 32768.
    pub mtu_size: usize,
    /// Cap on the payload carried inline in an RTS.
    /// Default: 4096
    pub max_memcpy_size: usize,
    /// Scatter-gather limit for transmit operations.
    /// Default: 4
    pub tx_iov_limit: usize,
    /// Scatter-gather limit for receive operations.
    /// Default: 4
    pub rx_iov_limit: usize,
    /// Capacity of the transmit entry arena and packet pool.
    /// Default: 1024
    pub tx_size: usize,
    /// Capacity of the receive entry arena and packet pool, and the
    /// number of receive buffers kept posted on each transport.
    /// Default: 1024
    pub rx_size: usize,
    /// Remaining-capacity threshold below which a multi-receive buffer
    /// is released back to the application.
    /// Default: 64
    pub min_multi_recv_size: usize,
    /// Upper bound on an emulated RMA read.
    /// Default: 1 GiB
    pub efa_max_emulated_read_size: usize,
    /// Upper bound on an emulated RMA write.
    /// Default: 1 GiB
    pub efa_max_emulated_write_size: usize,
    /// Cap on the payload of a single read-response packet.
    /// Default: 1 MiB (no effect below the MTU)
    pub efa_read_segment_size: usize,
    /// Overwrite released pool slots with a sentinel pattern.
    /// Default: false
    pub enable_poisoning: bool,
}

impl Default for RdmConfig {
    fn default() -> Self {
        Self {
            rx_window_size: 128,
            tx_min_credits: 32,
            tx_max_credits: 64,
            recvwin_size: 16384,
            cq_size: 8192,
            max_timeout: 1_000_000,
            timeout_interval: 0,
            efa_cq_read_size: 50,
            shm_cq_read_size: 50,
            enable_sas_ordering: true,
            enable_shm_transfer: true,
            mtu_size: 0,
            max_memcpy_size: 4096,
            tx_iov_limit: 4,
            rx_iov_limit: 4,
            tx_size: 1024,
            rx_size: 1024,
            min_multi_recv_size: 64,
            efa_max_emulated_read_size: 1 << 30,
            efa_max_emulated_write_size: 1 << 30,
            efa_read_segment_size: 1 << 20,
            enable_poisoning: false,
        }
    }
}

impl RdmConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial receive credits granted to each peer.
    pub fn with_rx_window_size(mut self, rx_window_size: u16) -> Self {
        self.rx_window_size = rx_window_size;
        self
    }

    /// Set the credit request bounds.
    pub fn with_tx_credits(mut self, min: u16, max: u16) -> Self {
        self.tx_min_credits = min;
        self.tx_max_credits = max;
        self
    }

    /// Set the reorder window size per peer.
    pub fn with_recvwin_size(mut self, recvwin_size: usize) -> Self {
        self.recvwin_size = recvwin_size;
        self
    }

    /// Set the completion queue capacity hint.
    pub fn with_cq_size(mut self, cq_size: usize) -> Self {
        self.cq_size = cq_size;
        self
    }

    /// Set the RNR backoff cap in microseconds.
    pub fn with_max_timeout(mut self, max_timeout: u64) -> Self {
        self.max_timeout = max_timeout;
        self
    }

    /// Set the initial RNR backoff interval in microseconds.
    /// 0 selects a random value in [40, 120] per peer.
    pub fn with_timeout_interval(mut self, timeout_interval: u64) -> Self {
        self.timeout_interval = timeout_interval;
        self
    }

    /// Enable or disable send-after-send ordering.
    pub fn with_sas_ordering(mut self, enable: bool) -> Self {
        self.enable_sas_ordering = enable;
        self
    }

    /// Enable or disable shared-memory routing for co-located peers.
    pub fn with_shm_transfer(mut self, enable: bool) -> Self {
        self.enable_shm_transfer = enable;
        self
    }

    /// Set the packet payload capacity.
    pub fn with_mtu_size(mut self, mtu_size: usize) -> Self {
        self.mtu_size = mtu_size;
        self
    }

    /// Set the transmit arena and packet pool capacity.
    pub fn with_tx_size(mut self, tx_size: usize) -> Self {
        self.tx_size = tx_size;
        self
    }

    /// Set the receive arena and packet pool capacity.
    pub fn with_rx_size(mut self, rx_size: usize) -> Self {
        self.rx_size = rx_size;
        self
    }

    /// Set the multi-receive release threshold.
    pub fn with_min_multi_recv_size(mut self, min_multi_recv_size: usize) -> Self {
        self.min_multi_recv_size = min_multi_recv_size;
        self
    }

    /// Enable or disable pool slot poisoning.
    pub fn with_poisoning(mut self, enable: bool) -> Self {
        self.enable_poisoning = enable;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = RdmConfig::default();
        assert_eq!(cfg.rx_window_size, 128);
        assert_eq!(cfg.tx_min_credits, 32);
        assert_eq!(cfg.tx_max_credits, 64);
        assert_eq!(cfg.recvwin_size, 16384);
        assert_eq!(cfg.cq_size, 8192);
        assert_eq!(cfg.max_timeout, 1_000_000);
        assert!(cfg.enable_sas_ordering);
        assert!(cfg.enable_shm_transfer);
    }

    #[test]
    fn test_builder() {
        let cfg = RdmConfig::new()
            .with_tx_credits(8, 16)
            .with_recvwin_size(64)
            .with_sas_ordering(false)
            .with_mtu_size(4096);
        assert_eq!(cfg.tx_min_credits, 8);
        assert_eq!(cfg.tx_max_credits, 16);
        assert_eq!(cfg.recvwin_size, 64);
        assert!(!cfg.enable_sas_ordering);
        assert_eq!(cfg.mtu_size, 4096);
    }
}
