//! Routing hook.
//!
//! The forwarding decision itself lives outside this crate. Each polling
//! lcore hands every received burst to a [`PacketRouter`], which takes
//! ownership of the packets and either re-injects them through the
//! dataplane's transmit paths or drops them (returning their buffers to
//! the pool).

use crate::packet::{PacketBurst, VifIndex};

/// Per-burst routing callback invoked on the polling lcore.
///
/// Implementations must not block: they run inside the poll loop, and a
/// stalled callback stalls every queue the lcore owns.
pub trait PacketRouter: Send + Sync {
    /// Route one burst received on interface `vif`. Fire and forget:
    /// ownership of the packets transfers to the router.
    fn route_burst(&self, vif: VifIndex, pkts: PacketBurst);
}
