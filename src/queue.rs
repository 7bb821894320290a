//! The queue abstraction.
//!
//! One handle shape wraps the three receive/transmit backends (hardware
//! NIC queue, kernel-bridge device, inter-core ring) so the scheduler
//! polls and flushes without knowing which kind it holds. Burst
//! operations return the number of packets moved and never block; 0
//! means no work.
//!
//! [`QueueParams`] is the cold side record: release data the poll loop
//! never reads. It lives with the control path (see
//! [`crate::dataplane`]), so tearing a queue down cannot touch fields a
//! concurrent poll iteration reads.

use std::sync::Arc;

use crate::config::MAX_BURST_SZ;
use crate::dataplane::SchedCtx;
use crate::error::Result;
use crate::knb::KnbDevice;
use crate::lcore::LcoreIndex;
use crate::packet::{PacketBurst, VifIndex};
use crate::port::{EthPort, QueueId};
use crate::ring::VrRing;

/// Receive-side backend of a queue.
pub enum RxBackend {
    /// Hardware NIC receive queue.
    Eth {
        port: Arc<dyn EthPort>,
        queue: QueueId,
    },
    /// Kernel-bridge device.
    Knb { dev: Arc<dyn KnbDevice> },
    /// Consumer side of an inter-core ring.
    Ring { ring: Arc<VrRing> },
}

impl RxBackend {
    fn rx_burst(&mut self, pkts: &mut PacketBurst, max: usize) -> usize {
        match self {
            RxBackend::Eth { port, queue } => port.rx_burst(*queue, pkts, max),
            RxBackend::Knb { dev } => dev.rx_burst(pkts, max),
            RxBackend::Ring { ring } => ring.dequeue_burst(pkts, max),
        }
    }
}

/// Transmit-side backend of a queue.
pub enum TxBackend {
    /// Hardware NIC transmit queue.
    Eth {
        port: Arc<dyn EthPort>,
        queue: QueueId,
    },
    /// Kernel-bridge device.
    Knb { dev: Arc<dyn KnbDevice> },
    /// Producer side of an inter-core ring.
    Ring { ring: Arc<VrRing> },
}

impl TxBackend {
    fn tx_burst(&mut self, pkts: &mut PacketBurst) -> usize {
        match self {
            TxBackend::Eth { port, queue } => port.tx_burst(*queue, pkts),
            TxBackend::Knb { dev } => dev.tx_burst(pkts),
            TxBackend::Ring { ring } => ring.enqueue_burst(pkts),
        }
    }
}

/// A pollable receive queue owned by one lcore table slot.
pub struct RxQueue {
    backend: RxBackend,
    vif: VifIndex,
    burst_size: usize,
}

impl RxQueue {
    pub(crate) fn new(backend: RxBackend, vif: VifIndex, burst_size: usize) -> Self {
        Self {
            backend,
            vif,
            burst_size: burst_size.clamp(1, MAX_BURST_SZ),
        }
    }

    /// Owning interface.
    #[inline]
    pub fn vif(&self) -> VifIndex {
        self.vif
    }

    /// Burst-receive up to the queue's burst-size hint, appending to
    /// `pkts` and stamping each packet with the owning interface.
    pub(crate) fn rx_burst(&mut self, pkts: &mut PacketBurst) -> usize {
        let before = pkts.len();
        let n = self.backend.rx_burst(pkts, self.burst_size);
        for pkt in &mut pkts[before..] {
            pkt.set_vif(self.vif);
        }
        n
    }
}

/// A buffering transmit queue owned by one lcore table slot.
///
/// Packets are buffered up to one burst and handed to the backend either
/// when the buffer fills or when the scheduler flushes on its cadence,
/// trading per-packet transmit cost against added latency.
pub struct TxQueue {
    backend: TxBackend,
    vif: VifIndex,
    buf: PacketBurst,
    dropped: u64,
}

impl TxQueue {
    pub(crate) fn new(backend: TxBackend, vif: VifIndex) -> Self {
        Self {
            backend,
            vif,
            buf: PacketBurst::new(),
            dropped: 0,
        }
    }

    /// Owning interface.
    #[inline]
    pub fn vif(&self) -> VifIndex {
        self.vif
    }

    /// Whether the backend is a physical NIC queue.
    #[inline]
    pub fn is_phys(&self) -> bool {
        matches!(self.backend, TxBackend::Eth { .. })
    }

    /// Free space in the transmit buffer.
    #[inline]
    pub fn room(&self) -> usize {
        self.buf.capacity() - self.buf.len()
    }

    /// Packets dropped because neither the buffer nor the backend could
    /// take them.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Buffer packets for transmission, flushing to the backend whenever
    /// the buffer fills. Returns the number accepted; packets that fit
    /// nowhere are dropped (their buffers return to the pool).
    pub(crate) fn tx(&mut self, mut pkts: PacketBurst) -> usize {
        let mut accepted = 0;
        while !pkts.is_empty() {
            let room = self.room();
            if room == 0 {
                self.flush();
                if self.buf.is_full() {
                    // Backend refused everything; drop the rest.
                    self.dropped += pkts.len() as u64;
                    tracing::trace!(vif = self.vif, lost = pkts.len(), "tx overflow");
                    pkts.clear();
                    break;
                }
                continue;
            }
            let n = room.min(pkts.len());
            for pkt in pkts.drain(..n) {
                self.buf.push(pkt);
            }
            accepted += n;
        }
        accepted
    }

    /// Hand buffered packets to the backend. Returns the number the
    /// backend accepted; refused packets stay buffered for the next
    /// flush.
    pub(crate) fn flush(&mut self) -> usize {
        if self.buf.is_empty() {
            return 0;
        }
        self.backend.tx_burst(&mut self.buf)
    }
}

/// Cold per-(lcore, interface) release record, kept apart from the hot
/// queue handle. Only the ring backend needs extra data, mirroring the
/// fact that hardware and kernel-bridge backends are torn down through
/// their own device paths.
pub enum QueueParams {
    /// Dropping the hot handle is the whole release.
    None,
    /// Physical transmit queue: unschedule must also update the
    /// phys-load scheduler counter.
    EthTx,
    /// Ring-backed queue: the ring must leave the name registry, and if
    /// `peer` is set, that lcore's rings-to-push entry must go too.
    Ring {
        ring: Arc<VrRing>,
        peer: Option<LcoreIndex>,
    },
}

/// Constructor for a receive queue of a given backend kind, invoked by
/// the scheduler for each slot it assigns. The third argument is
/// backend-specific: the hardware queue id for NIC queues, the peer
/// lcore for ring queues; kernel-bridge queues ignore it.
pub type RxQueueInitOp =
    fn(&mut SchedCtx<'_>, LcoreIndex, VifIndex, u16) -> Result<(RxQueue, QueueParams)>;

/// Transmit-side counterpart of [`RxQueueInitOp`].
pub type TxQueueInitOp =
    fn(&mut SchedCtx<'_>, LcoreIndex, VifIndex, u16) -> Result<(TxQueue, QueueParams)>;
