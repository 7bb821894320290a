//! Hardware queue manager.
//!
//! Partitions a NIC's fixed pool of hardware queues between two disjoint
//! uses, hash-based load spreading (RSS) and explicit per-flow steering
//! (filtering), and tracks each queue's state. The device itself is
//! opaque: everything goes through the [`EthPort`] capability.

use std::sync::Arc;

use crate::config::{
    MAX_BURST_SZ, MAX_NB_RSS_QUEUES, MAX_NB_RX_QUEUES, MAX_NB_TX_QUEUES, NB_RXD, NB_TXD,
};
use crate::dataplane::SchedCtx;
use crate::error::{Error, Result};
use crate::mempool::Mempool;
use crate::packet::VifIndex;
use crate::port::{EthPort, PortId, QueueId};
use crate::queue::{QueueParams, RxBackend, RxQueue, TxBackend, TxQueue};

/// State of one hardware receive queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueState {
    /// No queue available at this index.
    #[default]
    None,
    /// Set up and unassigned; usable for RSS or filtering.
    Ready,
    /// Assigned to the RSS redirection table.
    Rss,
    /// Claimed by a hardware steering rule.
    Filtering,
}

/// Per-NIC configuration: queue counts clamped to hardware and lcore
/// limits, per-queue state, and the mempool backing each receive queue.
///
/// Invariant: a queue's state and its mempool are set together, and a
/// queue is never in both `Rss` and `Filtering` states.
pub struct Ethdev {
    port: Arc<dyn EthPort>,
    port_id: PortId,
    nb_rx_queues: u16,
    nb_tx_queues: u16,
    nb_rss_queues: u16,
    queue_states: [QueueState; MAX_NB_RX_QUEUES],
    mempools: [Option<Mempool>; MAX_NB_RX_QUEUES],
}

impl Ethdev {
    /// Probe the port, clamp queue counts to hardware and lcore limits,
    /// set up descriptor rings, and back every receive queue with a pool
    /// taken from `free_pools`. All usable queues start `Ready`.
    ///
    /// On any failure the taken pools are returned to `free_pools`.
    pub(crate) fn init(
        port_id: PortId,
        port: Arc<dyn EthPort>,
        nb_fwd_lcores: usize,
        free_pools: &mut Vec<Mempool>,
    ) -> Result<Self> {
        let info = port.info();
        let nb_rx = info.max_rx_queues.min(MAX_NB_RX_QUEUES as u16);
        let nb_tx = info
            .max_tx_queues
            .min(MAX_NB_TX_QUEUES as u16)
            .min(nb_fwd_lcores as u16);
        let nb_rss = nb_rx
            .min(MAX_NB_RSS_QUEUES as u16)
            .min(nb_fwd_lcores as u16);
        if nb_rx == 0 || nb_tx == 0 {
            return Err(Error::NoFreeHwQueue);
        }

        port.configure(nb_rx, nb_tx)?;

        let mut taken: Vec<Mempool> = Vec::new();
        let mut setup = || -> Result<()> {
            for q in 0..nb_rx {
                let pool = free_pools.pop().ok_or(Error::NoFreeMempool)?;
                let res = port.rx_queue_setup(q, NB_RXD, &pool);
                taken.push(pool);
                res?;
            }
            for q in 0..nb_tx {
                port.tx_queue_setup(q, NB_TXD)?;
            }
            port.start()
        };
        if let Err(e) = setup() {
            free_pools.append(&mut taken);
            return Err(e);
        }

        let mut queue_states = [QueueState::None; MAX_NB_RX_QUEUES];
        let mut mempools: [Option<Mempool>; MAX_NB_RX_QUEUES] = Default::default();
        for (q, pool) in taken.into_iter().enumerate() {
            queue_states[q] = QueueState::Ready;
            mempools[q] = Some(pool);
        }

        tracing::info!(port_id, nb_rx, nb_tx, nb_rss, "ethdev initialized");
        Ok(Self {
            port,
            port_id,
            nb_rx_queues: nb_rx,
            nb_tx_queues: nb_tx,
            nb_rss_queues: nb_rss,
            queue_states,
            mempools,
        })
    }

    /// Mark the first N ready queues as RSS-assigned and program the
    /// hardware redirection table with them. Fails if no queue is
    /// available; queue states are unchanged on failure.
    pub(crate) fn rss_init(&mut self) -> Result<Vec<QueueId>> {
        let queues: Vec<QueueId> = (0..self.nb_rx_queues)
            .filter(|&q| self.queue_states[q as usize] == QueueState::Ready)
            .take(self.nb_rss_queues as usize)
            .collect();
        if queues.is_empty() {
            return Err(Error::NoFreeHwQueue);
        }
        self.port.rss_reta_update(&queues)?;
        for &q in &queues {
            self.queue_states[q as usize] = QueueState::Rss;
        }
        tracing::info!(port_id = self.port_id, ?queues, "rss initialized");
        Ok(queues)
    }

    /// Switch the hardware from hash-based spreading into rule-based
    /// steering mode.
    pub(crate) fn filtering_init(&mut self) -> Result<()> {
        self.port.filter_mode_enable()?;
        tracing::info!(port_id = self.port_id, "hardware filtering enabled");
        Ok(())
    }

    /// Claim `queue` for filtering and program a rule steering packets
    /// matching `(dst_ip, label)` to it. The queue must be `Ready`;
    /// an RSS-assigned queue is rejected with its state unchanged.
    pub(crate) fn filter_add(
        &mut self,
        queue: QueueId,
        dst_ip: std::net::Ipv4Addr,
        label: u32,
    ) -> Result<()> {
        let state = self.queue_state(queue);
        if state != QueueState::Ready && state != QueueState::Filtering {
            return Err(Error::QueueState { queue, state });
        }
        self.port.filter_add(queue, dst_ip, label)?;
        self.queue_states[queue as usize] = QueueState::Filtering;
        tracing::debug!(
            port_id = self.port_id,
            queue,
            %dst_ip,
            label,
            "hardware filter added"
        );
        Ok(())
    }

    /// First unused ready queue, or `None` when the hardware pool is
    /// exhausted. Exhaustion is an ordinary capacity condition, not an
    /// error.
    pub(crate) fn ready_queue_id_get(&self) -> Option<QueueId> {
        (0..self.nb_rx_queues).find(|&q| self.queue_states[q as usize] == QueueState::Ready)
    }

    /// Stop the device, return every mempool to `free_pools`, and reset
    /// all queue states. The caller guarantees every lcore has already
    /// unscheduled its queues on this device.
    pub(crate) fn release(&mut self, free_pools: &mut Vec<Mempool>) -> Result<()> {
        self.port.stop()?;
        for slot in &mut self.mempools {
            if let Some(pool) = slot.take() {
                free_pools.push(pool);
            }
        }
        self.queue_states = [QueueState::None; MAX_NB_RX_QUEUES];
        tracing::info!(port_id = self.port_id, "ethdev released");
        Ok(())
    }

    /// State of one hardware queue ([`QueueState::None`] out of range).
    pub fn queue_state(&self, queue: QueueId) -> QueueState {
        self.queue_states
            .get(queue as usize)
            .copied()
            .unwrap_or(QueueState::None)
    }

    /// Usable receive queue count after clamping.
    pub fn nb_rx_queues(&self) -> u16 {
        self.nb_rx_queues
    }

    /// Usable transmit queue count after clamping.
    pub fn nb_tx_queues(&self) -> u16 {
        self.nb_tx_queues
    }

    /// Receive queues designated for RSS after clamping.
    pub fn nb_rss_queues(&self) -> u16 {
        self.nb_rss_queues
    }

    pub(crate) fn port_arc(&self) -> Arc<dyn EthPort> {
        Arc::clone(&self.port)
    }
}

/// Queue-init operation for a hardware receive queue; the third argument
/// is the hardware queue id.
pub fn eth_rx_queue_init(
    ctx: &mut SchedCtx<'_>,
    _lcore: usize,
    vif: VifIndex,
    queue_id: u16,
) -> Result<(RxQueue, QueueParams)> {
    let ethdev = ctx.ift.vif_ethdev(vif)?;
    let state = ethdev.queue_state(queue_id);
    if state == QueueState::None {
        return Err(Error::QueueState {
            queue: queue_id,
            state,
        });
    }
    let queue = RxQueue::new(
        RxBackend::Eth {
            port: ethdev.port_arc(),
            queue: queue_id,
        },
        vif,
        MAX_BURST_SZ,
    );
    Ok((queue, QueueParams::None))
}

/// Queue-init operation for a hardware transmit queue; the third
/// argument is the hardware queue id.
pub fn eth_tx_queue_init(
    ctx: &mut SchedCtx<'_>,
    _lcore: usize,
    vif: VifIndex,
    queue_id: u16,
) -> Result<(TxQueue, QueueParams)> {
    let ethdev = ctx.ift.vif_ethdev(vif)?;
    if queue_id >= ethdev.nb_tx_queues() {
        return Err(Error::QueueState {
            queue: queue_id,
            state: QueueState::None,
        });
    }
    let queue = TxQueue::new(
        TxBackend::Eth {
            port: ethdev.port_arc(),
            queue: queue_id,
        },
        vif,
    );
    Ok((queue, QueueParams::EthTx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketBurst;
    use crate::port::PortInfo;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    /// Minimal port capability recording configuration calls.
    struct MockPort {
        max_rx: u16,
        max_tx: u16,
        reta: Mutex<Vec<QueueId>>,
        filters: Mutex<Vec<(QueueId, Ipv4Addr, u32)>>,
        stopped: Mutex<bool>,
    }

    impl MockPort {
        fn new(max_rx: u16, max_tx: u16) -> Self {
            Self {
                max_rx,
                max_tx,
                reta: Mutex::new(Vec::new()),
                filters: Mutex::new(Vec::new()),
                stopped: Mutex::new(false),
            }
        }
    }

    impl EthPort for MockPort {
        fn info(&self) -> PortInfo {
            PortInfo {
                max_rx_queues: self.max_rx,
                max_tx_queues: self.max_tx,
            }
        }
        fn configure(&self, _nb_rx: u16, _nb_tx: u16) -> Result<()> {
            Ok(())
        }
        fn rx_queue_setup(&self, _q: QueueId, _nb: u16, _pool: &Mempool) -> Result<()> {
            Ok(())
        }
        fn tx_queue_setup(&self, _q: QueueId, _nb: u16) -> Result<()> {
            Ok(())
        }
        fn start(&self) -> Result<()> {
            Ok(())
        }
        fn stop(&self) -> Result<()> {
            *self.stopped.lock().unwrap() = true;
            Ok(())
        }
        fn rx_burst(&self, _q: QueueId, _pkts: &mut PacketBurst, _max: usize) -> usize {
            0
        }
        fn tx_burst(&self, _q: QueueId, _pkts: &mut PacketBurst) -> usize {
            0
        }
        fn rss_reta_update(&self, queues: &[QueueId]) -> Result<()> {
            *self.reta.lock().unwrap() = queues.to_vec();
            Ok(())
        }
        fn filter_mode_enable(&self) -> Result<()> {
            Ok(())
        }
        fn filter_add(&self, queue: QueueId, dst_ip: Ipv4Addr, label: u32) -> Result<()> {
            self.filters.lock().unwrap().push((queue, dst_ip, label));
            Ok(())
        }
    }

    fn pools(n: usize) -> Vec<Mempool> {
        (0..n)
            .map(|i| Mempool::new(format!("p{i}"), 8, 256))
            .collect()
    }

    fn init_dev(max_rx: u16, max_tx: u16, nb_lcores: usize) -> (Ethdev, Vec<Mempool>) {
        let mut free = pools(MAX_NB_RX_QUEUES + 2);
        let dev = Ethdev::init(0, Arc::new(MockPort::new(max_rx, max_tx)), nb_lcores, &mut free)
            .unwrap();
        (dev, free)
    }

    #[test]
    fn test_init_clamps_queue_counts() {
        let (dev, free) = init_dev(64, 64, 4);
        assert_eq!(dev.nb_rx_queues() as usize, MAX_NB_RX_QUEUES);
        assert_eq!(dev.nb_tx_queues(), 4); // lcore-limited
        assert_eq!(dev.nb_rss_queues() as usize, MAX_NB_RSS_QUEUES);
        assert_eq!(free.len(), 2); // one pool per rx queue taken
        for q in 0..dev.nb_rx_queues() {
            assert_eq!(dev.queue_state(q), QueueState::Ready);
        }
    }

    #[test]
    fn test_init_fails_without_mempools() {
        let mut free = pools(2);
        let err = Ethdev::init(0, Arc::new(MockPort::new(4, 2)), 2, &mut free);
        assert!(matches!(err, Err(Error::NoFreeMempool)));
        // Taken pools were rolled back.
        assert_eq!(free.len(), 2);
    }

    /// Scenario: four ready hardware queues, rss_init marks all four,
    /// leaving nothing for ready_queue_id_get.
    #[test]
    fn test_rss_consumes_all_ready_queues() {
        let (mut dev, _free) = init_dev(4, 2, 4);
        assert_eq!(dev.ready_queue_id_get(), Some(0));

        let queues = dev.rss_init().unwrap();
        assert_eq!(queues, vec![0, 1, 2, 3]);
        for q in 0..4 {
            assert_eq!(dev.queue_state(q), QueueState::Rss);
        }
        assert_eq!(dev.ready_queue_id_get(), None);
    }

    #[test]
    fn test_filter_add_rejects_rss_queue() {
        let (mut dev, _free) = init_dev(6, 2, 2);
        dev.rss_init().unwrap(); // queues 0..2 (lcore-limited) go to RSS

        let err = dev.filter_add(0, Ipv4Addr::new(10, 0, 0, 1), 17);
        assert!(matches!(
            err,
            Err(Error::QueueState {
                queue: 0,
                state: QueueState::Rss
            })
        ));
        // State unchanged by the failed add.
        assert_eq!(dev.queue_state(0), QueueState::Rss);

        // A ready queue transitions to filtering.
        let q = dev.ready_queue_id_get().unwrap();
        dev.filter_add(q, Ipv4Addr::new(10, 0, 0, 1), 17).unwrap();
        assert_eq!(dev.queue_state(q), QueueState::Filtering);
    }

    #[test]
    fn test_release_returns_pools_and_resets_states() {
        let (mut dev, mut free) = init_dev(4, 2, 2);
        let before = free.len();
        dev.release(&mut free).unwrap();
        assert_eq!(free.len(), before + 4);
        for q in 0..4 {
            assert_eq!(dev.queue_state(q), QueueState::None);
        }
        assert_eq!(dev.ready_queue_id_get(), None);
    }
}
