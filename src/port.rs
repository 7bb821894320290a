//! Hardware port capability interface.
//!
//! The NIC driver lives outside this crate; the forwarding plane only
//! consumes it through [`EthPort`]. Burst operations never block and
//! report the number of packets moved; configuration operations return a
//! backend error on rejection.

use std::net::Ipv4Addr;

use crate::error::Result;
use crate::packet::PacketBurst;

/// Hardware port identifier.
pub type PortId = u16;

/// Hardware queue identifier within a port.
pub type QueueId = u16;

/// Static limits reported by a hardware port.
#[derive(Debug, Clone, Copy)]
pub struct PortInfo {
    /// Number of receive queues the hardware supports.
    pub max_rx_queues: u16,
    /// Number of transmit queues the hardware supports.
    pub max_tx_queues: u16,
}

/// Capability interface to one hardware NIC port.
///
/// Implementations are provided by the driver layer. Queue ids passed to
/// burst operations are only those previously set up through
/// [`rx_queue_setup`](EthPort::rx_queue_setup) /
/// [`tx_queue_setup`](EthPort::tx_queue_setup).
pub trait EthPort: Send + Sync {
    /// Probe hardware limits.
    fn info(&self) -> PortInfo;

    /// Configure the device for the given queue counts.
    fn configure(&self, nb_rx_queues: u16, nb_tx_queues: u16) -> Result<()>;

    /// Allocate the descriptor ring for a receive queue, drawing buffers
    /// from `pool`.
    fn rx_queue_setup(
        &self,
        queue: QueueId,
        nb_desc: u16,
        pool: &crate::mempool::Mempool,
    ) -> Result<()>;

    /// Allocate the descriptor ring for a transmit queue.
    fn tx_queue_setup(&self, queue: QueueId, nb_desc: u16) -> Result<()>;

    /// Start the device.
    fn start(&self) -> Result<()>;

    /// Stop the device.
    fn stop(&self) -> Result<()>;

    /// Burst-receive up to `max` packets from `queue`, appending to
    /// `pkts`. Returns the number received; 0 means no work.
    fn rx_burst(&self, queue: QueueId, pkts: &mut PacketBurst, max: usize) -> usize;

    /// Burst-transmit packets to `queue`, draining accepted packets from
    /// the front of `pkts`. Returns the number transmitted; packets the
    /// hardware did not accept remain in `pkts`.
    fn tx_burst(&self, queue: QueueId, pkts: &mut PacketBurst) -> usize;

    /// Program the RSS hash-to-queue redirection table to spread flows
    /// over `queues`.
    fn rss_reta_update(&self, queues: &[QueueId]) -> Result<()>;

    /// Switch the device from hash-based spreading to rule-based
    /// steering.
    fn filter_mode_enable(&self) -> Result<()>;

    /// Program a hardware rule steering packets matching
    /// `(dst_ip, label)` to `queue`.
    fn filter_add(&self, queue: QueueId, dst_ip: Ipv4Addr, label: u32) -> Result<()>;
}
