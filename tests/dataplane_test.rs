//! Dataplane integration tests.
//!
//! Drives the control API against mock device capabilities: a hardware
//! port that serves a preloaded number of packets per receive queue, a
//! kernel-bridge device that counts event servicing, and a router that
//! counts and drops every burst it is handed.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serial_test::serial;

use vrouter_dataplane::dataplane::{knb_rx_queue_init, knb_tx_queue_init};
use vrouter_dataplane::ethdev::{eth_rx_queue_init, eth_tx_queue_init};
use vrouter_dataplane::{
    Dataplane, DataplaneConfig, EthPort, Error, KnbDevice, Mempool, Packet, PacketBurst,
    PacketRouter, PortInfo, QueueId, Result, VifIndex, VrRing,
};

struct MockPort {
    max_rx: u16,
    max_tx: u16,
    pool: Mempool,
    /// Packets left to serve per receive queue.
    rx_remaining: Vec<Mutex<usize>>,
    tx_count: AtomicUsize,
}

impl MockPort {
    fn new(max_rx: u16, max_tx: u16, preload: &[usize]) -> Arc<Self> {
        let rx_remaining = (0..max_rx as usize)
            .map(|q| Mutex::new(preload.get(q).copied().unwrap_or(0)))
            .collect();
        Arc::new(Self {
            max_rx,
            max_tx,
            pool: Mempool::new("mock_port", 4096, 2048),
            rx_remaining,
            tx_count: AtomicUsize::new(0),
        })
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
        Ok(())
    }
    fn rx_burst(&self, queue: QueueId, pkts: &mut PacketBurst, max: usize) -> usize {
        let mut remaining = self.rx_remaining[queue as usize].lock().unwrap();
        let want = max.min(*remaining).min(pkts.remaining_capacity());
        let mut served = 0;
        for _ in 0..want {
            match self.pool.try_alloc() {
                Some(buf) => pkts.push(Packet::from_buf(buf, 0)),
                None => break,
            }
            *remaining -= 1;
            served += 1;
        }
        served
    }
    fn tx_burst(&self, _queue: QueueId, pkts: &mut PacketBurst) -> usize {
        let n = pkts.len();
        self.tx_count.fetch_add(n, Ordering::Relaxed);
        pkts.clear();
        n
    }
    fn rss_reta_update(&self, _queues: &[QueueId]) -> Result<()> {
        Ok(())
    }
    fn filter_mode_enable(&self) -> Result<()> {
        Ok(())
    }
    fn filter_add(&self, _queue: QueueId, _dst_ip: Ipv4Addr, _label: u32) -> Result<()> {
        Ok(())
    }
}

struct MockKnb {
    events: AtomicUsize,
}

impl KnbDevice for MockKnb {
    fn rx_burst(&self, _pkts: &mut PacketBurst, _max: usize) -> usize {
        0
    }
    fn tx_burst(&self, pkts: &mut PacketBurst) -> usize {
        let n = pkts.len();
        pkts.clear();
        n
    }
    fn handle_events(&self) -> Result<()> {
        self.events.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct CountingRouter {
    total: AtomicUsize,
}

impl CountingRouter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            total: AtomicUsize::new(0),
        })
    }
}

impl PacketRouter for CountingRouter {
    fn route_burst(&self, _vif: VifIndex, pkts: PacketBurst) {
        self.total.fetch_add(pkts.len(), Ordering::Relaxed);
        // Dropping the burst returns the buffers to their pool.
    }
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        std::thread::yield_now();
    }
    cond()
}

#[test]
fn test_rx_queues_spread_over_least_used_lcores() {
    let dp = Dataplane::new(
        DataplaneConfig::new().nb_fwd_lcores(4),
        CountingRouter::new(),
    );
    dp.vif_register(1).unwrap();
    dp.ethdev_init(1, 0, MockPort::new(2, 2, &[])).unwrap();

    let before: u32 = dp.rx_queue_counts().iter().map(|&c| c as u32).sum();
    dp.if_schedule(1, None, 2, eth_rx_queue_init, 2, eth_tx_queue_init)
        .unwrap();

    // Two receive queues land on the two least-loaded lcores, ties
    // breaking toward the lowest index.
    assert_eq!(dp.rx_queue_counts(), vec![1, 1, 0, 0]);
    let after: u32 = dp.rx_queue_counts().iter().map(|&c| c as u32).sum();
    assert_eq!(after, before + 2);
    assert_eq!(dp.least_used_lcore(), Some(2));

    // Lcores 0 and 1 own the two real transmit queues; 2 and 3 reach the
    // port through rings drained by those owners.
    assert_eq!(dp.phys_least_used_lcore(), Some(0));
    assert_eq!(dp.ring_count(), 2);
}

#[test]
fn test_unschedule_releases_everything_and_is_idempotent() {
    let dp = Dataplane::new(
        DataplaneConfig::new().nb_fwd_lcores(3),
        CountingRouter::new(),
    );
    dp.vif_register(7).unwrap();
    dp.ethdev_init(7, 0, MockPort::new(2, 1, &[])).unwrap();
    dp.if_schedule(7, None, 2, eth_rx_queue_init, 1, eth_tx_queue_init)
        .unwrap();
    assert!(dp.ring_count() > 0);

    dp.if_unschedule(7).unwrap();
    assert_eq!(dp.rx_queue_counts(), vec![0, 0, 0]);
    assert_eq!(dp.ring_count(), 0);
    assert_eq!(dp.phys_least_used_lcore(), None);

    // Unscheduling an unscheduled interface is a no-op.
    dp.if_unschedule(7).unwrap();
    dp.vif_unregister(7).unwrap();
    assert!(matches!(dp.if_unschedule(7), Err(Error::NoVif(7))));
}

#[test]
fn test_schedule_rejects_unknown_vif_and_bad_preference() {
    let dp = Dataplane::new(
        DataplaneConfig::new().nb_fwd_lcores(2),
        CountingRouter::new(),
    );
    assert!(matches!(
        dp.if_schedule(9, None, 1, eth_rx_queue_init, 1, eth_tx_queue_init),
        Err(Error::NoVif(9))
    ));

    dp.vif_register(9).unwrap();
    dp.ethdev_init(9, 0, MockPort::new(2, 1, &[])).unwrap();
    assert!(matches!(
        dp.if_schedule(9, Some(5), 1, eth_rx_queue_init, 1, eth_tx_queue_init),
        Err(Error::NoLcoreAvailable)
    ));
    // Nothing was installed by the failed calls.
    assert_eq!(dp.rx_queue_counts(), vec![0, 0]);
    assert_eq!(dp.ring_count(), 0);
}

#[test]
fn test_mpls_schedule_consumes_ready_queues() {
    let dp = Dataplane::new(
        DataplaneConfig::new().nb_fwd_lcores(2),
        CountingRouter::new(),
    );
    dp.vif_register(3).unwrap();
    dp.ethdev_init(3, 0, MockPort::new(3, 1, &[])).unwrap();

    // RSS claims the first two queues (lcore-limited), leaving one.
    let rss = dp.ethdev_rss_init(3).unwrap();
    assert_eq!(rss, vec![0, 1]);
    dp.ethdev_filtering_init(3).unwrap();
    assert_eq!(dp.ethdev_ready_queue_id_get(3).unwrap(), Some(2));

    dp.mpls_schedule(3, Ipv4Addr::new(10, 1, 1, 1), 42).unwrap();
    assert_eq!(dp.ethdev_ready_queue_id_get(3).unwrap(), None);
    assert_eq!(dp.rx_queue_counts().iter().sum::<u16>(), 1);

    // The hardware queue pool is exhausted now.
    assert!(matches!(
        dp.mpls_schedule(3, Ipv4Addr::new(10, 1, 1, 2), 43),
        Err(Error::NoFreeHwQueue)
    ));
}

#[test]
#[serial]
fn test_forwarding_lifecycle() {
    let router = CountingRouter::new();
    let dp = Dataplane::new(
        DataplaneConfig::new().nb_fwd_lcores(2),
        Arc::clone(&router) as Arc<dyn PacketRouter>,
    );
    let port = MockPort::new(2, 2, &[48, 16]);
    dp.vif_register(0).unwrap();
    dp.ethdev_init(0, 0, Arc::clone(&port) as Arc<dyn EthPort>)
        .unwrap();

    dp.start().unwrap();
    assert!(matches!(dp.start(), Err(Error::AlreadyStarted)));

    // Scheduling a running dataplane goes through the command mailboxes.
    dp.if_schedule(0, None, 2, eth_rx_queue_init, 2, eth_tx_queue_init)
        .unwrap();
    assert_eq!(dp.rx_queue_counts(), vec![1, 1]);

    assert!(
        wait_until(Duration::from_secs(5), || {
            router.total.load(Ordering::Relaxed) >= 64
        }),
        "router saw {} of 64 packets",
        router.total.load(Ordering::Relaxed)
    );

    // Unscheduling while running drains through the same mailboxes.
    dp.if_unschedule(0).unwrap();
    assert_eq!(dp.rx_queue_counts(), vec![0, 0]);

    dp.stop();
    assert!(!dp.is_running());
    assert_eq!(router.total.load(Ordering::Relaxed), 64);
}

/// A stop landing before the spawned threads have even been scheduled
/// must still terminate them, and the dataplane must restart cleanly.
#[test]
#[serial]
fn test_stop_immediately_after_start() {
    let dp = Dataplane::new(
        DataplaneConfig::new().nb_fwd_lcores(2),
        CountingRouter::new(),
    );
    for _ in 0..50 {
        dp.start().unwrap();
        dp.stop();
        assert!(!dp.is_running());
    }
}

/// While running, an add aimed at an occupied (lcore, interface) slot
/// is rejected by the polling thread and reported to the caller, with
/// no queue recorded and no load counter bumped.
#[test]
#[serial]
fn test_running_add_to_occupied_slot_reports_error() {
    let dp = Dataplane::new(
        DataplaneConfig::new().nb_fwd_lcores(2),
        CountingRouter::new(),
    );
    let knb = Arc::new(MockKnb {
        events: AtomicUsize::new(0),
    });
    dp.vif_register(6).unwrap();
    dp.knb_add(6, Arc::clone(&knb) as Arc<dyn KnbDevice>).unwrap();
    dp.start().unwrap();

    dp.if_schedule(6, Some(0), 1, knb_rx_queue_init, 1, knb_tx_queue_init)
        .unwrap();
    assert_eq!(dp.rx_queue_counts(), vec![1, 0]);

    assert!(matches!(
        dp.if_schedule(6, Some(0), 1, knb_rx_queue_init, 0, knb_tx_queue_init),
        Err(Error::QueueSlotOccupied { lcore: 0, vif: 6 })
    ));
    assert_eq!(dp.rx_queue_counts(), vec![1, 0]);

    dp.stop();
}

#[test]
fn test_ring_to_push_add_checks_registered_owner() {
    let dp = Dataplane::new(
        DataplaneConfig::new().nb_fwd_lcores(2),
        CountingRouter::new(),
    );
    let ring = dp.ring_allocate(1, "owner_check", 64).unwrap();

    // Only the draining owner recorded at allocation may register it.
    assert!(matches!(
        dp.ring_to_push_add(0, Arc::clone(&ring), 4),
        Err(Error::RingOwner { .. })
    ));
    dp.ring_to_push_add(1, Arc::clone(&ring), 4).unwrap();
    dp.ring_to_push_remove(1, &ring).unwrap();

    // A ring that never went through the registry is rejected too.
    let stray = Arc::new(VrRing::with_capacity("stray", 64).unwrap());
    assert!(matches!(
        dp.ring_to_push_add(1, stray, 4),
        Err(Error::RingOwner { .. })
    ));
}

#[test]
#[serial]
fn test_service_lcore_handles_knb_events() {
    let dp = Dataplane::new(
        DataplaneConfig::new().nb_fwd_lcores(1).service_lcore(true),
        CountingRouter::new(),
    );
    let knb = Arc::new(MockKnb {
        events: AtomicUsize::new(0),
    });
    dp.vif_register(2).unwrap();
    dp.knb_add(2, Arc::clone(&knb) as Arc<dyn KnbDevice>).unwrap();

    dp.start().unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            knb.events.load(Ordering::Relaxed) > 0
        }),
        "service lcore never serviced the kernel-bridge device"
    );
    dp.stop();
}
