//! Kernel-bridge device capability interface.
//!
//! A kernel-bridge device exposes a virtual network interface to the host
//! kernel. The driver lives outside this crate; the forwarding plane
//! consumes it through [`KnbDevice`] with the same burst contract as
//! hardware and ring queues, and services its asynchronous events from
//! the service lcore under the interface-configuration lock.

use crate::error::Result;
use crate::packet::PacketBurst;

/// Capability interface to one kernel-bridge device.
pub trait KnbDevice: Send + Sync {
    /// Burst-receive up to `max` packets coming from the kernel side,
    /// appending to `pkts`. Returns the number received.
    fn rx_burst(&self, pkts: &mut PacketBurst, max: usize) -> usize;

    /// Burst-transmit packets toward the kernel, draining accepted
    /// packets from the front of `pkts`. Returns the number accepted.
    fn tx_burst(&self, pkts: &mut PacketBurst) -> usize;

    /// Service pending device events (link state requests, config
    /// callbacks). Called periodically from the service lcore while the
    /// interface-configuration lock is held.
    fn handle_events(&self) -> Result<()>;
}
