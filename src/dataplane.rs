//! The dataplane: lcore pool, interface tables, and the control API.
//!
//! Construction and operation are two phases. [`Dataplane::new`] builds
//! the lcore pool and interface tables without spawning anything;
//! [`Dataplane::start`] launches one polling thread per forwarding
//! lcore. Every control operation works in both phases: before start it
//! mutates the idle lcore tables directly, after start it goes through
//! each lcore's command mailbox so the packet path stays lock-free.
//!
//! Lock order: interface tables, then ring registry, then idle tables.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::{
    DataplaneConfig, MAX_BURST_SZ, MAX_INTERFACES, MAX_PACKET_SZ, MAX_VM_MEMPOOLS,
    SLEEP_SERVICE_US, TX_RING_SZ, VM_MEMPOOL_SZ,
};
use crate::error::{Error, Result};
use crate::ethdev::{eth_rx_queue_init, Ethdev};
use crate::knb::KnbDevice;
use crate::lcore::{
    forwarding_loop, least_used, phys_least_used, CmdPayload, LcoreIndex, LcoreShared, LcoreState,
    LcoreTables, CMD_RX_ADD, CMD_RX_RM, CMD_TX_ADD, CMD_TX_RM,
};
use crate::mempool::Mempool;
use crate::packet::VifIndex;
use crate::port::{EthPort, PortId, QueueId};
use crate::queue::{
    QueueParams, RxBackend, RxQueue, RxQueueInitOp, TxBackend, TxQueue, TxQueueInitOp,
};
use crate::ring::{self, RingEntry, RingToPush, VrRing};
use crate::router::PacketRouter;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// One registered interface: device bindings and the release records of
/// every queue scheduled for it.
#[derive(Default)]
struct Vif {
    port: Option<PortId>,
    knb: Option<Arc<dyn KnbDevice>>,
    /// (lcore, release record) per scheduled receive queue.
    rx_sched: Vec<(LcoreIndex, QueueParams)>,
    tx_sched: Vec<(LcoreIndex, QueueParams)>,
}

/// Interface-side state, guarded by the interface-configuration lock.
pub(crate) struct IfTables {
    vifs: Vec<Option<Vif>>,
    ethdevs: HashMap<PortId, Ethdev>,
    free_pools: Vec<Mempool>,
}

impl IfTables {
    fn new() -> Self {
        let mut vifs = Vec::with_capacity(MAX_INTERFACES);
        vifs.resize_with(MAX_INTERFACES, || None);
        let free_pools = (0..MAX_VM_MEMPOOLS)
            .map(|i| Mempool::new(format!("vm_mempool_{i}"), VM_MEMPOOL_SZ, MAX_PACKET_SZ))
            .collect();
        Self {
            vifs,
            ethdevs: HashMap::new(),
            free_pools,
        }
    }

    fn vif_ref(&self, vif: VifIndex) -> Result<&Vif> {
        self.vifs
            .get(vif as usize)
            .and_then(Option::as_ref)
            .ok_or(Error::NoVif(vif))
    }

    fn vif_mut(&mut self, vif: VifIndex) -> Result<&mut Vif> {
        self.vifs
            .get_mut(vif as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::NoVif(vif))
    }

    pub(crate) fn vif_ethdev(&self, vif: VifIndex) -> Result<&Ethdev> {
        let port = self.vif_ref(vif)?.port.ok_or(Error::NoPortBound(vif))?;
        self.ethdevs.get(&port).ok_or(Error::NoEthdev(port))
    }

    fn vif_ethdev_mut(&mut self, vif: VifIndex) -> Result<&mut Ethdev> {
        let port = self.vif_ref(vif)?.port.ok_or(Error::NoPortBound(vif))?;
        self.ethdevs.get_mut(&port).ok_or(Error::NoEthdev(port))
    }

    pub(crate) fn vif_knb(&self, vif: VifIndex) -> Result<Arc<dyn KnbDevice>> {
        self.vif_ref(vif)?
            .knb
            .clone()
            .ok_or(Error::NoKnbDevice(vif))
    }

    /// Service pending events on every attached kernel-bridge device.
    fn knb_handle_all(&self) {
        for (vif, entry) in self.vifs.iter().enumerate() {
            if let Some(dev) = entry.as_ref().and_then(|v| v.knb.as_ref())
                && let Err(e) = dev.handle_events()
            {
                tracing::warn!(vif, error = %e, "kernel-bridge event handling failed");
            }
        }
    }
}

/// Context handed to queue-init operations while the scheduler holds the
/// interface-configuration lock.
pub struct SchedCtx<'a> {
    pub(crate) ift: &'a mut IfTables,
    pub(crate) lcores: &'a [Arc<LcoreShared>],
    pub(crate) rings: &'a Mutex<HashMap<String, RingEntry>>,
}

/// The forwarding plane.
///
/// Owns the lcore pool, the interface tables, the ring registry, and
/// the free-mempool list. All control operations take `&self`; the
/// interface-configuration lock serializes them.
pub struct Dataplane {
    config: DataplaneConfig,
    router: Arc<dyn PacketRouter>,
    lcores: Vec<Arc<LcoreShared>>,
    /// Hot tables of lcores whose thread is not running.
    idle: Arc<Mutex<Vec<Option<Box<LcoreTables>>>>>,
    ift: Arc<Mutex<IfTables>>,
    rings: Mutex<HashMap<String, RingEntry>>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    running: AtomicBool,
    stop_service: Arc<AtomicBool>,
}

impl Dataplane {
    /// Build the lcore pool and interface tables. No threads run yet;
    /// interfaces may be registered and scheduled before [`start`].
    ///
    /// [`start`]: Dataplane::start
    pub fn new(config: DataplaneConfig, router: Arc<dyn PacketRouter>) -> Self {
        let n = config.nb_fwd_lcores;
        let lcores: Vec<Arc<LcoreShared>> = (0..n).map(|_| Arc::new(LcoreShared::new())).collect();
        let idle = (0..n)
            .map(|i| Some(Box::new(LcoreTables::new(i, Arc::clone(&router)))))
            .collect();
        tracing::info!(nb_fwd_lcores = n, service = config.service_lcore, "dataplane created");
        Self {
            config,
            router,
            lcores,
            idle: Arc::new(Mutex::new(idle)),
            ift: Arc::new(Mutex::new(IfTables::new())),
            rings: Mutex::new(HashMap::new()),
            threads: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            stop_service: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of forwarding lcores.
    pub fn nb_fwd_lcores(&self) -> usize {
        self.lcores.len()
    }

    /// Whether the polling threads are running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Receive queues assigned per lcore, the scheduler's load metric.
    pub fn rx_queue_counts(&self) -> Vec<u16> {
        self.lcores.iter().map(|s| s.nb_rx_queues()).collect()
    }

    /// The lcore the scheduler would pick next.
    pub fn least_used_lcore(&self) -> Option<LcoreIndex> {
        least_used(&self.lcores, &[])
    }

    /// The least-loaded lcore among those owning a physical transmit
    /// queue.
    pub fn phys_least_used_lcore(&self) -> Option<LcoreIndex> {
        phys_least_used(&self.lcores, &[])
    }

    /// Number of named rings currently allocated.
    pub fn ring_count(&self) -> usize {
        lock(&self.rings).len()
    }

    // -- interface registration -------------------------------------

    /// Register an interface index. Registering an index twice is a
    /// no-op.
    pub fn vif_register(&self, vif: VifIndex) -> Result<()> {
        if vif as usize >= MAX_INTERFACES {
            return Err(Error::VifTableFull);
        }
        let mut ift = lock(&self.ift);
        let slot = &mut ift.vifs[vif as usize];
        if slot.is_none() {
            *slot = Some(Vif::default());
            tracing::info!(vif, "interface registered");
        }
        Ok(())
    }

    /// Unregister an interface, unscheduling its queues first.
    pub fn vif_unregister(&self, vif: VifIndex) -> Result<()> {
        let mut ift = lock(&self.ift);
        ift.vif_ref(vif)?;
        self.unschedule_locked(&mut ift, vif);
        ift.vifs[vif as usize] = None;
        tracing::info!(vif, "interface unregistered");
        Ok(())
    }

    // -- hardware devices -------------------------------------------

    /// Bind a hardware port to an interface, initializing the device on
    /// first binding: probe and clamp queue counts, set up descriptor
    /// rings, and back each receive queue with a free-list mempool.
    pub fn ethdev_init(&self, vif: VifIndex, port_id: PortId, port: Arc<dyn EthPort>) -> Result<()> {
        let mut guard = lock(&self.ift);
        let ift = &mut *guard;
        ift.vif_ref(vif)?;
        if !ift.ethdevs.contains_key(&port_id) {
            let dev = Ethdev::init(port_id, port, self.lcores.len(), &mut ift.free_pools)?;
            ift.ethdevs.insert(port_id, dev);
        }
        ift.vif_mut(vif)?.port = Some(port_id);
        Ok(())
    }

    /// Program the port's RSS redirection table over its first ready
    /// queues. Returns the queues now carrying hashed traffic.
    pub fn ethdev_rss_init(&self, vif: VifIndex) -> Result<Vec<QueueId>> {
        lock(&self.ift).vif_ethdev_mut(vif)?.rss_init()
    }

    /// Switch the interface's port into rule-based steering mode.
    pub fn ethdev_filtering_init(&self, vif: VifIndex) -> Result<()> {
        lock(&self.ift).vif_ethdev_mut(vif)?.filtering_init()
    }

    /// Program a hardware rule steering packets matching
    /// `(dst_ip, label)` to `queue`. The queue must be ready; an
    /// RSS-assigned queue is rejected with its state unchanged.
    pub fn ethdev_filter_add(
        &self,
        vif: VifIndex,
        queue: QueueId,
        dst_ip: Ipv4Addr,
        label: u32,
    ) -> Result<()> {
        lock(&self.ift)
            .vif_ethdev_mut(vif)?
            .filter_add(queue, dst_ip, label)
    }

    /// First hardware queue still unassigned on the interface's port,
    /// or `None` when the pool is exhausted.
    pub fn ethdev_ready_queue_id_get(&self, vif: VifIndex) -> Result<Option<QueueId>> {
        Ok(lock(&self.ift).vif_ethdev(vif)?.ready_queue_id_get())
    }

    /// Release the interface's hardware port: unschedule its queues,
    /// stop the device, and return its mempools to the free list.
    pub fn ethdev_release(&self, vif: VifIndex) -> Result<()> {
        let mut guard = lock(&self.ift);
        self.unschedule_locked(&mut guard, vif);
        let ift = &mut *guard;
        let port = ift.vif_ref(vif)?.port.ok_or(Error::NoPortBound(vif))?;
        if let Some(mut dev) = ift.ethdevs.remove(&port) {
            dev.release(&mut ift.free_pools)?;
        }
        ift.vif_mut(vif)?.port = None;
        Ok(())
    }

    // -- kernel-bridge devices --------------------------------------

    /// Attach a kernel-bridge device to an interface.
    pub fn knb_add(&self, vif: VifIndex, dev: Arc<dyn KnbDevice>) -> Result<()> {
        lock(&self.ift).vif_mut(vif)?.knb = Some(dev);
        tracing::info!(vif, "kernel-bridge device attached");
        Ok(())
    }

    /// Detach the interface's kernel-bridge device, unscheduling its
    /// queues first.
    pub fn knb_remove(&self, vif: VifIndex) -> Result<()> {
        let mut ift = lock(&self.ift);
        ift.vif_ref(vif)?;
        self.unschedule_locked(&mut ift, vif);
        ift.vif_mut(vif)?.knb = None;
        Ok(())
    }

    /// Service pending events on every attached kernel-bridge device.
    /// The service lcore calls this on its cadence; it is also callable
    /// directly when no service lcore is configured.
    pub fn knb_all_handle(&self) {
        lock(&self.ift).knb_handle_all();
    }

    // -- rings ------------------------------------------------------

    /// Allocate a named inter-core ring owned by `lcore`.
    pub fn ring_allocate(
        &self,
        lcore: LcoreIndex,
        name: &str,
        size: usize,
    ) -> Result<Arc<VrRing>> {
        ring::allocate_into(&self.rings, lcore, name, size)
    }

    /// Register a ring for `lcore` to drain into its transmit queue for
    /// `vif`. The ring must be registered with `lcore` as its draining
    /// owner.
    pub fn ring_to_push_add(
        &self,
        lcore: LcoreIndex,
        ring: Arc<VrRing>,
        vif: VifIndex,
    ) -> Result<()> {
        let shared = self.lcores.get(lcore).ok_or(Error::NoLcoreAvailable)?;
        let owned = lock(&self.rings)
            .get(ring.name())
            .is_some_and(|e| e.owner_lcore == lcore && Arc::ptr_eq(&e.ring, &ring));
        if !owned {
            return Err(Error::RingOwner {
                name: ring.name().to_string(),
                lcore,
            });
        }
        shared.ring_to_push_add(RingToPush { ring, vif })
    }

    /// Remove a ring from `lcore`'s push list. Not-present is a no-op.
    pub fn ring_to_push_remove(&self, lcore: LcoreIndex, ring: &Arc<VrRing>) -> Result<()> {
        let shared = self.lcores.get(lcore).ok_or(Error::NoLcoreAvailable)?;
        shared.ring_to_push_remove(ring);
        Ok(())
    }

    // -- scheduling -------------------------------------------------

    /// Distribute an interface's queues over the lcore pool.
    ///
    /// `nb_rx` receive queues land on distinct least-loaded lcores
    /// (the first on `preferred` when given). The first `nb_tx` lcores,
    /// starting from the same point, get real transmit queues through
    /// `tx_op` with an ascending queue index; every remaining lcore gets
    /// a ring-backed transmit queue whose peer is one of the real-queue
    /// owners, so any lcore can transmit on the interface.
    ///
    /// On error every queue already installed for the interface is torn
    /// down again.
    pub fn if_schedule(
        &self,
        vif: VifIndex,
        preferred: Option<LcoreIndex>,
        nb_rx: u16,
        rx_op: RxQueueInitOp,
        nb_tx: u16,
        tx_op: TxQueueInitOp,
    ) -> Result<()> {
        let n = self.lcores.len();
        if let Some(l) = preferred
            && l >= n
        {
            return Err(Error::NoLcoreAvailable);
        }
        let mut ift = lock(&self.ift);
        let v = ift.vif_ref(vif)?;
        let (rx_keep, tx_keep) = (v.rx_sched.len(), v.tx_sched.len());

        let result = self.schedule_locked(&mut ift, vif, preferred, nb_rx, rx_op, nb_tx, tx_op);
        if result.is_err() {
            // Tear down only what this call added.
            if let Ok(v) = ift.vif_mut(vif) {
                let rx = v.rx_sched.split_off(rx_keep);
                let tx = v.tx_sched.split_off(tx_keep);
                self.teardown(vif, rx, tx);
            }
        }
        result
    }

    fn schedule_locked(
        &self,
        ift: &mut IfTables,
        vif: VifIndex,
        preferred: Option<LcoreIndex>,
        nb_rx: u16,
        rx_op: RxQueueInitOp,
        nb_tx: u16,
        tx_op: TxQueueInitOp,
    ) -> Result<()> {
        let n = self.lcores.len();
        let start = preferred
            .or_else(|| least_used(&self.lcores, &[]))
            .ok_or(Error::NoLcoreAvailable)?;

        let mut used: Vec<LcoreIndex> = Vec::new();
        for q in 0..nb_rx {
            let lcore = if q == 0 {
                start
            } else {
                // Each lcore holds at most one receive queue per
                // interface, so the queues must land on distinct lcores.
                least_used(&self.lcores, &used).ok_or(Error::NoLcoreAvailable)?
            };
            used.push(lcore);
            self.sched_one_rx(ift, lcore, vif, q, rx_op)?;
        }

        if nb_tx > 0 {
            let order: Vec<LcoreIndex> = (0..n).map(|j| (start + j) % n).collect();
            let nb_real = (nb_tx as usize).min(n);
            for (j, &lcore) in order.iter().enumerate() {
                if j < nb_real {
                    self.sched_one_tx(ift, lcore, vif, j as u16, tx_op)?;
                } else {
                    let peer = order[(j - nb_real) % nb_real];
                    self.sched_one_tx(ift, lcore, vif, peer as u16, ring_tx_queue_init)?;
                }
            }
        }
        tracing::info!(vif, nb_rx, nb_tx, "interface scheduled");
        Ok(())
    }

    fn sched_one_rx(
        &self,
        ift: &mut IfTables,
        lcore: LcoreIndex,
        vif: VifIndex,
        arg: u16,
        op: RxQueueInitOp,
    ) -> Result<()> {
        let (queue, params) = {
            let mut ctx = SchedCtx {
                ift,
                lcores: &self.lcores,
                rings: &self.rings,
            };
            op(&mut ctx, lcore, vif, arg)?
        };
        if let Err(e) = self.install_rx(lcore, vif, queue) {
            self.release_params(params);
            return Err(e);
        }
        self.lcores[lcore].rx_count_add();
        ift.vif_mut(vif)?.rx_sched.push((lcore, params));
        Ok(())
    }

    fn sched_one_tx(
        &self,
        ift: &mut IfTables,
        lcore: LcoreIndex,
        vif: VifIndex,
        arg: u16,
        op: TxQueueInitOp,
    ) -> Result<()> {
        let (queue, params) = {
            let mut ctx = SchedCtx {
                ift,
                lcores: &self.lcores,
                rings: &self.rings,
            };
            op(&mut ctx, lcore, vif, arg)?
        };
        if let Err(e) = self.install_tx(lcore, vif, queue) {
            self.release_params(params);
            return Err(e);
        }
        if matches!(params, QueueParams::EthTx) {
            self.lcores[lcore].phys_tx_count_add();
        }
        ift.vif_mut(vif)?.tx_sched.push((lcore, params));
        Ok(())
    }

    /// Tear down every queue scheduled for an interface. All removals
    /// are completed and acknowledged before any backend is released,
    /// so no lcore can touch a released backend. Unscheduling an
    /// unscheduled interface is a no-op.
    pub fn if_unschedule(&self, vif: VifIndex) -> Result<()> {
        let mut ift = lock(&self.ift);
        ift.vif_ref(vif)?;
        self.unschedule_locked(&mut ift, vif);
        Ok(())
    }

    fn unschedule_locked(&self, ift: &mut IfTables, vif: VifIndex) {
        let Some(v) = ift.vifs.get_mut(vif as usize).and_then(Option::as_mut) else {
            return;
        };
        let rx_sched = std::mem::take(&mut v.rx_sched);
        let tx_sched = std::mem::take(&mut v.tx_sched);
        self.teardown(vif, rx_sched, tx_sched);
    }

    fn teardown(
        &self,
        vif: VifIndex,
        rx_sched: Vec<(LcoreIndex, QueueParams)>,
        tx_sched: Vec<(LcoreIndex, QueueParams)>,
    ) {
        if rx_sched.is_empty() && tx_sched.is_empty() {
            return;
        }

        // Phase 1: pull every hot handle out of the lcore tables.
        let mut posted: Vec<LcoreIndex> = Vec::new();
        for (lcore, _) in &rx_sched {
            self.remove_queue(*lcore, vif, CMD_RX_RM, &mut posted);
        }
        for (lcore, _) in &tx_sched {
            self.remove_queue(*lcore, vif, CMD_TX_RM, &mut posted);
        }
        for lcore in posted {
            self.lcores[lcore].cmd_wait_ack();
        }

        // Phase 2: with every removal acknowledged, release backends.
        for (lcore, params) in rx_sched {
            self.lcores[lcore].rx_count_sub();
            self.release_params(params);
        }
        for (lcore, params) in tx_sched {
            if matches!(params, QueueParams::EthTx) {
                self.lcores[lcore].phys_tx_count_sub();
            }
            self.release_params(params);
        }
        tracing::info!(vif, "interface unscheduled");
    }

    fn remove_queue(&self, lcore: LcoreIndex, vif: VifIndex, cmd: u16, posted: &mut Vec<LcoreIndex>) {
        if self.is_running() {
            // A terminated lcore took its queues down with its tables.
            if self.lcores[lcore].cmd_post(cmd, vif as u32, None).is_ok() {
                posted.push(lcore);
            }
        } else {
            let mut idle = lock(&self.idle);
            if let Some(tables) = idle[lcore].as_mut() {
                match cmd {
                    CMD_RX_RM => {
                        tables.rx_remove(vif);
                    }
                    _ => {
                        tables.tx_remove(vif);
                    }
                }
            }
        }
    }

    fn release_params(&self, params: QueueParams) {
        if let QueueParams::Ring { ring, peer } = params {
            if let Some(peer) = peer
                && let Some(shared) = self.lcores.get(peer)
            {
                shared.ring_to_push_remove(&ring);
            }
            ring::free_from(&self.rings, ring.name());
        }
    }

    fn install_rx(&self, lcore: LcoreIndex, vif: VifIndex, queue: RxQueue) -> Result<()> {
        let shared = &self.lcores[lcore];
        if self.is_running() {
            shared.cmd_post(CMD_RX_ADD, vif as u32, Some(CmdPayload::Rx(queue)))?;
            shared.cmd_wait_ack();
            self.check_add_accepted(shared, lcore, vif)
        } else {
            let mut idle = lock(&self.idle);
            match idle[lcore].as_mut() {
                Some(tables) => tables.rx_install(vif, queue),
                None => Err(Error::Stopped),
            }
        }
    }

    fn install_tx(&self, lcore: LcoreIndex, vif: VifIndex, queue: TxQueue) -> Result<()> {
        let shared = &self.lcores[lcore];
        if self.is_running() {
            shared.cmd_post(CMD_TX_ADD, vif as u32, Some(CmdPayload::Tx(queue)))?;
            shared.cmd_wait_ack();
            self.check_add_accepted(shared, lcore, vif)
        } else {
            let mut idle = lock(&self.idle);
            match idle[lcore].as_mut() {
                Some(tables) => tables.tx_install(vif, queue),
                None => Err(Error::Stopped),
            }
        }
    }

    /// A rejected add leaves its payload staged in the mailbox slot; an
    /// empty slot after the ack means the lcore installed the queue.
    fn check_add_accepted(
        &self,
        shared: &LcoreShared,
        lcore: LcoreIndex,
        vif: VifIndex,
    ) -> Result<()> {
        if shared.cmd_take_rejected().is_some() {
            if shared.state() == LcoreState::Terminated {
                return Err(Error::Stopped);
            }
            return Err(Error::QueueSlotOccupied { lcore, vif });
        }
        Ok(())
    }

    /// Steer one labelled flow to its own hardware queue: claim a ready
    /// queue, program a rule matching `(dst_ip, label)`, and schedule
    /// the queue on the least-loaded lcore that already transmits on a
    /// physical queue.
    pub fn mpls_schedule(&self, vif: VifIndex, dst_ip: Ipv4Addr, label: u32) -> Result<()> {
        let mut ift = lock(&self.ift);
        let queue_id = ift
            .vif_ethdev(vif)?
            .ready_queue_id_get()
            .ok_or(Error::NoFreeHwQueue)?;
        ift.vif_ethdev_mut(vif)?.filter_add(queue_id, dst_ip, label)?;

        let lcore = phys_least_used(&self.lcores, &[])
            .or_else(|| least_used(&self.lcores, &[]))
            .ok_or(Error::NoLcoreAvailable)?;
        self.sched_one_rx(&mut ift, lcore, vif, queue_id, eth_rx_queue_init)
    }

    // -- lifecycle --------------------------------------------------

    /// Spawn one polling thread per forwarding lcore, plus the service
    /// lcore when configured. CPU pinning is best-effort.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }
        self.stop_service.store(false, Ordering::Release);
        let mut threads = lock(&self.threads);
        for (i, shared) in self.lcores.iter().enumerate() {
            let tables = lock(&self.idle)[i].take().ok_or(Error::Stopped)?;
            shared.reset_for_start();
            let shared = Arc::clone(shared);
            let idle = Arc::clone(&self.idle);
            let cpu = self.config.cpu_ids.get(i).copied();
            let handle = std::thread::Builder::new()
                .name(format!("fwd-lcore-{i}"))
                .spawn(move || {
                    if let Some(cpu) = cpu {
                        pin_current_thread(i, cpu);
                    }
                    let tables = forwarding_loop(tables, &shared);
                    lock(&idle)[i] = Some(tables);
                })
                .map_err(Error::Spawn)?;
            threads.push(handle);
        }
        if self.config.service_lcore {
            let ift = Arc::clone(&self.ift);
            let stop = Arc::clone(&self.stop_service);
            let handle = std::thread::Builder::new()
                .name("service-lcore".to_string())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        lock(&ift).knb_handle_all();
                        std::thread::sleep(Duration::from_micros(SLEEP_SERVICE_US));
                    }
                })
                .map_err(Error::Spawn)?;
            threads.push(handle);
        }
        tracing::info!(nb_fwd_lcores = self.lcores.len(), "dataplane started");
        Ok(())
    }

    /// Stop every lcore and join the threads. Each polling thread takes
    /// a final flush before terminating and hands its tables back. The
    /// stop flag is observed every loop pass, so this lands even on a
    /// thread that has not been scheduled yet.
    pub fn stop(&self) {
        self.stop_service.store(true, Ordering::Release);
        for shared in &self.lcores {
            shared.stop_request();
        }
        let mut threads = lock(&self.threads);
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        self.running.store(false, Ordering::Release);
        tracing::info!("dataplane stopped");
    }

    /// The router every lcore forwards received bursts to.
    pub fn router(&self) -> Arc<dyn PacketRouter> {
        Arc::clone(&self.router)
    }
}

fn pin_current_thread(lcore: LcoreIndex, cpu: usize) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    let res = set
        .set(cpu)
        .and_then(|()| sched_setaffinity(Pid::from_raw(0), &set));
    match res {
        Ok(()) => tracing::debug!(lcore, cpu, "lcore pinned"),
        Err(e) => tracing::warn!(lcore, cpu, error = %e, "cpu pinning failed"),
    }
}

// -- queue-init operations for ring and kernel-bridge backends ------

/// Receive queue backed by a named ring owned by this lcore. The third
/// init-op argument is unused.
pub fn ring_rx_queue_init(
    ctx: &mut SchedCtx<'_>,
    lcore: LcoreIndex,
    vif: VifIndex,
    _arg: u16,
) -> Result<(RxQueue, QueueParams)> {
    let name = format!("vif{vif}_lc{lcore}_rx");
    let ring = ring::allocate_into(ctx.rings, lcore, &name, TX_RING_SZ)?;
    let queue = RxQueue::new(
        RxBackend::Ring {
            ring: Arc::clone(&ring),
        },
        vif,
        MAX_BURST_SZ,
    );
    Ok((queue, QueueParams::Ring { ring, peer: None }))
}

/// Transmit queue backed by a ring drained by `peer` (the third init-op
/// argument), which owns a real transmit queue for the interface.
pub fn ring_tx_queue_init(
    ctx: &mut SchedCtx<'_>,
    lcore: LcoreIndex,
    vif: VifIndex,
    peer: u16,
) -> Result<(TxQueue, QueueParams)> {
    let peer = peer as LcoreIndex;
    let name = format!("vif{vif}_lc{lcore}_to{peer}");
    // The peer drains the ring, so the peer is the registered owner.
    let ring = ring::allocate_into(ctx.rings, peer, &name, TX_RING_SZ)?;
    let shared = ctx.lcores.get(peer).ok_or(Error::NoLcoreAvailable)?;
    if let Err(e) = shared.ring_to_push_add(RingToPush {
        ring: Arc::clone(&ring),
        vif,
    }) {
        ring::free_from(ctx.rings, &name);
        return Err(e);
    }
    let queue = TxQueue::new(
        TxBackend::Ring {
            ring: Arc::clone(&ring),
        },
        vif,
    );
    Ok((
        queue,
        QueueParams::Ring {
            ring,
            peer: Some(peer),
        },
    ))
}

/// Receive queue polling the interface's kernel-bridge device. The
/// third init-op argument is unused.
pub fn knb_rx_queue_init(
    ctx: &mut SchedCtx<'_>,
    _lcore: LcoreIndex,
    vif: VifIndex,
    _arg: u16,
) -> Result<(RxQueue, QueueParams)> {
    let dev = ctx.ift.vif_knb(vif)?;
    Ok((
        RxQueue::new(RxBackend::Knb { dev }, vif, MAX_BURST_SZ),
        QueueParams::None,
    ))
}

/// Transmit queue toward the interface's kernel-bridge device. The
/// third init-op argument is unused.
pub fn knb_tx_queue_init(
    ctx: &mut SchedCtx<'_>,
    _lcore: LcoreIndex,
    vif: VifIndex,
    _arg: u16,
) -> Result<(TxQueue, QueueParams)> {
    let dev = ctx.ift.vif_knb(vif)?;
    Ok((TxQueue::new(TxBackend::Knb { dev }, vif), QueueParams::None))
}
