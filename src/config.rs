//! Compile-time tunables and the dataplane configuration builder.
//!
//! The constants bound every table in the crate; all hot-path storage is
//! preallocated against them so the polling loop never allocates.

/// Maximum number of interfaces (vifs) per dataplane.
pub const MAX_INTERFACES: usize = 256;

/// Maximum number of forwarding lcores.
pub const MAX_LCORES: usize = 64;

/// How many packets to move to/from a queue in one go.
pub const MAX_BURST_SZ: usize = 32;

/// Maximum number of hardware RX queues to use for RSS and filtering
/// (limited by NIC descriptor resources).
pub const MAX_NB_RX_QUEUES: usize = 11;

/// Maximum number of hardware TX queues to use.
pub const MAX_NB_TX_QUEUES: usize = 5;

/// Maximum number of hardware RX queues to use for RSS.
pub const MAX_NB_RSS_QUEUES: usize = 4;

/// Number of hardware RX ring descriptors per queue.
pub const NB_RXD: u16 = 256;

/// Number of hardware TX ring descriptors per queue.
pub const NB_TXD: u16 = 512;

/// Maximum number of rings-to-push entries per lcore.
pub const MAX_RINGS: usize = MAX_INTERFACES * 2;

/// Capacity of an inter-core forwarding ring (power of two).
pub const TX_RING_SZ: usize = MAX_BURST_SZ * 2;

/// Maximum number of pools in the global free-mempool list.
pub const MAX_VM_MEMPOOLS: usize = MAX_NB_RX_QUEUES * 2 - 2;

/// Number of buffers in each free-list mempool.
pub const VM_MEMPOOL_SZ: usize = 1024;

/// Maximum size of a single packet buffer.
pub const MAX_PACKET_SZ: usize = 2048;

/// Headroom reserved at the front of every packet buffer.
pub const PKT_HEADROOM: usize = 128;

/// Flush tx queues every this many loop iterations.
#[cfg(not(feature = "tx-flush-timer"))]
pub const TX_FLUSH_LOOPS: u32 = 5;

/// Flush tx queues after this many microseconds.
#[cfg(feature = "tx-flush-timer")]
pub const TX_FLUSH_US: u64 = 100;

/// Sleep time in microseconds when an lcore has no queues to poll.
pub const SLEEP_NO_QUEUES_US: u64 = 10_000;

/// Service-lcore handling periodicity in microseconds.
pub const SLEEP_SERVICE_US: u64 = 100;

/// Configuration for a [`Dataplane`](crate::dataplane::Dataplane).
///
/// # Example
///
/// ```
/// use vrouter_dataplane::config::DataplaneConfig;
///
/// let config = DataplaneConfig::new()
///     .nb_fwd_lcores(4)
///     .pin_to(&[0, 1, 2, 3])
///     .service_lcore(true);
/// assert_eq!(config.nb_fwd_lcores, 4);
/// ```
#[derive(Debug, Clone)]
pub struct DataplaneConfig {
    /// Number of forwarding lcores (one polling thread each).
    pub nb_fwd_lcores: usize,
    /// CPU ids to pin forwarding lcores to, by lcore index.
    /// Empty means no pinning; pinning is best-effort.
    pub cpu_ids: Vec<usize>,
    /// Whether to run a non-forwarding service lcore
    /// (kernel-bridge event handling, low-frequency maintenance).
    pub service_lcore: bool,
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        Self {
            nb_fwd_lcores: 2,
            cpu_ids: Vec::new(),
            service_lcore: false,
        }
    }
}

impl DataplaneConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of forwarding lcores (clamped to [`MAX_LCORES`]).
    pub fn nb_fwd_lcores(mut self, n: usize) -> Self {
        self.nb_fwd_lcores = n.clamp(1, MAX_LCORES);
        self
    }

    /// Pin forwarding lcores to the given CPU ids, by lcore index.
    pub fn pin_to(mut self, cpu_ids: &[usize]) -> Self {
        self.cpu_ids = cpu_ids.to_vec();
        self
    }

    /// Enable or disable the service lcore.
    pub fn service_lcore(mut self, enabled: bool) -> Self {
        self.service_lcore = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let c = DataplaneConfig::new().nb_fwd_lcores(3).pin_to(&[2, 4, 6]);
        assert_eq!(c.nb_fwd_lcores, 3);
        assert_eq!(c.cpu_ids, vec![2, 4, 6]);
        assert!(!c.service_lcore);
    }

    #[test]
    fn test_lcore_clamp() {
        assert_eq!(DataplaneConfig::new().nb_fwd_lcores(0).nb_fwd_lcores, 1);
        assert_eq!(
            DataplaneConfig::new().nb_fwd_lcores(10_000).nb_fwd_lcores,
            MAX_LCORES
        );
    }
}
