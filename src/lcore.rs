//! Per-lcore state and the forwarding loop.
//!
//! Each forwarding lcore is one polling thread in a run-to-completion
//! loop: burst-receive from every assigned receive queue, hand the burst
//! to the router, push peer rings into local transmit queues, flush on a
//! cadence, then service at most one control command.
//!
//! State is split by temperature. [`LcoreTables`] is the hot side: the
//! queue tables, owned exclusively by the polling thread while it runs
//! (and by the control path while the lcore is idle). [`LcoreShared`] is
//! the cold side: atomics and the command mailbox, shared with the
//! control path. The packet path takes no locks.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::config::{MAX_INTERFACES, MAX_RINGS, SLEEP_NO_QUEUES_US};
#[cfg(not(feature = "tx-flush-timer"))]
use crate::config::TX_FLUSH_LOOPS;
#[cfg(feature = "tx-flush-timer")]
use crate::config::TX_FLUSH_US;
use crate::error::{Error, Result};
use crate::packet::{PacketBurst, VifIndex};
use crate::queue::{RxQueue, TxQueue};
use crate::ring::{RingToPush, VrRing};
use crate::router::PacketRouter;

/// Logical index of a forwarding lcore, `0..nb_fwd_lcores`.
pub type LcoreIndex = usize;

/// Lifecycle state of one forwarding lcore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LcoreState {
    /// Thread not running; the control path owns the tables.
    Idle = 0,
    /// Polling thread running.
    Running = 1,
    /// Stop received; final flush in progress.
    Stopping = 2,
    /// Polling thread finished; tables handed back.
    Terminated = 3,
}

impl LcoreState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => LcoreState::Running,
            2 => LcoreState::Stopping,
            3 => LcoreState::Terminated,
            _ => LcoreState::Idle,
        }
    }
}

// Command mailbox tags. One command in flight at a time. A poster wins
// the mailbox by swinging the tag from `CMD_NONE` to `CMD_CLAIMED`,
// stages the parameter and payload, then stores the real tag as the
// commit; the `CMD_NONE` store back is the ack.
pub(crate) const CMD_NONE: u16 = 0;
pub(crate) const CMD_CLAIMED: u16 = 1;
pub(crate) const CMD_RX_RM: u16 = 2;
pub(crate) const CMD_TX_RM: u16 = 3;
pub(crate) const CMD_RX_ADD: u16 = 4;
pub(crate) const CMD_TX_ADD: u16 = 5;

/// Queue handle staged for an add command. Lives in a mutex side slot
/// because a queue handle does not fit the atomic mailbox; the polling
/// thread takes the lock only while executing an add, never per packet.
pub(crate) enum CmdPayload {
    Rx(RxQueue),
    Tx(TxQueue),
}

/// Cold per-lcore state shared between the control path and the polling
/// thread.
pub(crate) struct LcoreShared {
    state: AtomicU8,
    /// Set once by the control path; the forwarding loop polls it every
    /// iteration, so a stop lands even before the thread reaches
    /// `Running`.
    stop: AtomicBool,
    cmd: AtomicU16,
    cmd_param: AtomicU32,
    cmd_payload: Mutex<Option<CmdPayload>>,
    /// Scheduler load counter, maintained by the control path.
    nb_rx_queues: AtomicU16,
    /// Physical transmit queues assigned, maintained by the control path.
    nb_phys_tx_queues: AtomicU16,
    /// Rings other lcores enqueue into for this lcore to push out.
    rings_to_push: ArcSwap<Vec<RingToPush>>,
}

impl LcoreShared {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(LcoreState::Idle as u8),
            stop: AtomicBool::new(false),
            cmd: AtomicU16::new(CMD_NONE),
            cmd_param: AtomicU32::new(0),
            cmd_payload: Mutex::new(None),
            nb_rx_queues: AtomicU16::new(0),
            nb_phys_tx_queues: AtomicU16::new(0),
            rings_to_push: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub(crate) fn state(&self) -> LcoreState {
        LcoreState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LcoreState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Ask the forwarding loop to exit. Takes effect whether or not the
    /// thread has reached `Running` yet.
    pub(crate) fn stop_request(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Rearm the lcore before its thread is spawned: back to `Idle`
    /// with no stop pending and an empty mailbox, so posts are accepted
    /// again and no stale command from the last run is replayed.
    pub(crate) fn reset_for_start(&self) {
        self.stop.store(false, Ordering::Relaxed);
        *self.payload_slot() = None;
        self.cmd.store(CMD_NONE, Ordering::Relaxed);
        self.set_state(LcoreState::Idle);
    }

    /// Receive queues currently assigned; the scheduler's load metric.
    pub(crate) fn nb_rx_queues(&self) -> u16 {
        self.nb_rx_queues.load(Ordering::Relaxed)
    }

    pub(crate) fn nb_phys_tx_queues(&self) -> u16 {
        self.nb_phys_tx_queues.load(Ordering::Relaxed)
    }

    pub(crate) fn rx_count_add(&self) {
        self.nb_rx_queues.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rx_count_sub(&self) {
        self.nb_rx_queues.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn phys_tx_count_add(&self) {
        self.nb_phys_tx_queues.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn phys_tx_count_sub(&self) {
        self.nb_phys_tx_queues.fetch_sub(1, Ordering::Relaxed);
    }

    fn payload_slot(&self) -> std::sync::MutexGuard<'_, Option<CmdPayload>> {
        match self.cmd_payload.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Post one command to the mailbox, waiting for the previous command
    /// to be acked first. The mailbox is claimed by compare-and-swap, so
    /// a concurrent poster cannot overwrite an in-flight command; the
    /// final tag store publishes the parameter and any staged payload.
    pub(crate) fn cmd_post(&self, cmd: u16, param: u32, payload: Option<CmdPayload>) -> Result<()> {
        loop {
            if self.state() == LcoreState::Terminated {
                return Err(Error::Stopped);
            }
            if self
                .cmd
                .compare_exchange(CMD_NONE, CMD_CLAIMED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            std::thread::yield_now();
        }
        if let Some(p) = payload {
            *self.payload_slot() = Some(p);
        }
        self.cmd_param.store(param, Ordering::Relaxed);
        self.cmd.store(cmd, Ordering::Release);
        Ok(())
    }

    /// Take back a payload the polling thread refused to install. Call
    /// after the ack; an empty slot means the add went through.
    pub(crate) fn cmd_take_rejected(&self) -> Option<CmdPayload> {
        self.payload_slot().take()
    }

    /// Wait until the posted command has been consumed. Returns once the
    /// mailbox is empty again, or when the lcore terminates underneath
    /// us (the final flush consumes nothing further).
    pub(crate) fn cmd_wait_ack(&self) {
        while self.cmd.load(Ordering::Acquire) != CMD_NONE {
            if self.state() == LcoreState::Terminated {
                return;
            }
            std::thread::yield_now();
        }
    }

    /// Register a ring for this lcore to drain. An entry for the same
    /// ring is replaced, not duplicated.
    pub(crate) fn ring_to_push_add(&self, rtp: RingToPush) -> Result<()> {
        let cur = self.rings_to_push.load_full();
        let mut next: Vec<RingToPush> = cur
            .iter()
            .filter(|e| !Arc::ptr_eq(&e.ring, &rtp.ring))
            .cloned()
            .collect();
        if next.len() >= MAX_RINGS {
            return Err(Error::RingTableFull);
        }
        next.push(rtp);
        self.rings_to_push.store(Arc::new(next));
        Ok(())
    }

    /// Remove a ring from the push list. A ring not present is a no-op.
    pub(crate) fn ring_to_push_remove(&self, ring: &Arc<VrRing>) {
        let cur = self.rings_to_push.load_full();
        if !cur.iter().any(|e| Arc::ptr_eq(&e.ring, ring)) {
            return;
        }
        let next: Vec<RingToPush> = cur
            .iter()
            .filter(|e| !Arc::ptr_eq(&e.ring, ring))
            .cloned()
            .collect();
        self.rings_to_push.store(Arc::new(next));
    }
}

/// Hot per-lcore state: the queue tables, indexed by interface.
///
/// Owned by the polling thread while the lcore runs; the control path
/// mutates it directly only while the lcore is idle.
pub(crate) struct LcoreTables {
    lcore_id: LcoreIndex,
    rx_queues: Vec<Option<RxQueue>>,
    tx_queues: Vec<Option<TxQueue>>,
    /// Interfaces with an installed receive queue, in polling order.
    rx_active: Vec<VifIndex>,
    tx_active: Vec<VifIndex>,
    nb_loops: u32,
    #[cfg(feature = "tx-flush-timer")]
    last_flush: std::time::Instant,
    router: Arc<dyn PacketRouter>,
}

impl LcoreTables {
    pub(crate) fn new(lcore_id: LcoreIndex, router: Arc<dyn PacketRouter>) -> Self {
        let mut rx_queues = Vec::with_capacity(MAX_INTERFACES);
        let mut tx_queues = Vec::with_capacity(MAX_INTERFACES);
        rx_queues.resize_with(MAX_INTERFACES, || None);
        tx_queues.resize_with(MAX_INTERFACES, || None);
        Self {
            lcore_id,
            rx_queues,
            tx_queues,
            rx_active: Vec::new(),
            tx_active: Vec::new(),
            nb_loops: 0,
            #[cfg(feature = "tx-flush-timer")]
            last_flush: std::time::Instant::now(),
            router,
        }
    }

    pub(crate) fn lcore_id(&self) -> LcoreIndex {
        self.lcore_id
    }

    /// Install a receive queue into the interface's slot. The slot must
    /// be free.
    pub(crate) fn rx_install(&mut self, vif: VifIndex, queue: RxQueue) -> Result<()> {
        let slot = &mut self.rx_queues[vif as usize];
        if slot.is_some() {
            return Err(Error::QueueSlotOccupied {
                lcore: self.lcore_id,
                vif,
            });
        }
        *slot = Some(queue);
        self.rx_active.push(vif);
        Ok(())
    }

    /// Remove the interface's receive queue. An empty slot is a no-op.
    pub(crate) fn rx_remove(&mut self, vif: VifIndex) -> Option<RxQueue> {
        let queue = self.rx_queues[vif as usize].take()?;
        self.rx_active.retain(|&v| v != vif);
        Some(queue)
    }

    pub(crate) fn tx_install(&mut self, vif: VifIndex, queue: TxQueue) -> Result<()> {
        let slot = &mut self.tx_queues[vif as usize];
        if slot.is_some() {
            return Err(Error::QueueSlotOccupied {
                lcore: self.lcore_id,
                vif,
            });
        }
        *slot = Some(queue);
        self.tx_active.push(vif);
        Ok(())
    }

    /// Remove the interface's transmit queue, flushing buffered packets
    /// first so nothing is stranded in the hot handle.
    pub(crate) fn tx_remove(&mut self, vif: VifIndex) -> Option<TxQueue> {
        let mut queue = self.tx_queues[vif as usize].take()?;
        queue.flush();
        self.tx_active.retain(|&v| v != vif);
        Some(queue)
    }

    /// Buffer packets on the interface's transmit queue. Packets for an
    /// interface with no queue on this lcore are dropped.
    pub(crate) fn tx(&mut self, vif: VifIndex, pkts: PacketBurst) -> usize {
        match self.tx_queues.get_mut(vif as usize).and_then(Option::as_mut) {
            Some(queue) => queue.tx(pkts),
            None => 0,
        }
    }

    fn has_queues(&self) -> bool {
        !self.rx_active.is_empty() || !self.tx_active.is_empty()
    }

    /// One pass of the run-to-completion loop. Returns the number of
    /// packets moved; 0 means a fully idle pass.
    pub(crate) fn iteration(&mut self, shared: &LcoreShared) -> usize {
        if !self.has_queues() {
            std::thread::sleep(Duration::from_micros(SLEEP_NO_QUEUES_US));
            return 0;
        }

        let mut moved = 0;
        for i in 0..self.rx_active.len() {
            let vif = self.rx_active[i];
            let mut burst = PacketBurst::new();
            let n = match self.rx_queues.get_mut(vif as usize).and_then(Option::as_mut) {
                Some(queue) => queue.rx_burst(&mut burst),
                None => 0,
            };
            if n > 0 {
                moved += n;
                self.router.route_burst(vif, burst);
            }
        }

        moved += self.push_rings(shared);

        self.nb_loops = self.nb_loops.wrapping_add(1);
        #[cfg(not(feature = "tx-flush-timer"))]
        if self.nb_loops % TX_FLUSH_LOOPS == 0 {
            moved += self.flush_all();
        }
        #[cfg(feature = "tx-flush-timer")]
        if self.last_flush.elapsed() >= Duration::from_micros(TX_FLUSH_US) {
            moved += self.flush_all();
            self.last_flush = std::time::Instant::now();
        }

        moved
    }

    /// Drain each registered peer ring into this lcore's own transmit
    /// queue for the ring's interface, bounded by the queue's free
    /// space. Whatever does not fit stays in the ring for the next pass.
    fn push_rings(&mut self, shared: &LcoreShared) -> usize {
        let rings = shared.rings_to_push.load();
        let mut moved = 0;
        for rtp in rings.iter() {
            let Some(queue) = self.tx_queues.get_mut(rtp.vif as usize).and_then(Option::as_mut)
            else {
                continue;
            };
            let room = queue.room();
            if room == 0 {
                continue;
            }
            let mut burst = PacketBurst::new();
            if rtp.ring.dequeue_burst(&mut burst, room) > 0 {
                moved += queue.tx(burst);
            }
        }
        moved
    }

    /// Flush every transmit queue. Returns the number of packets the
    /// backends accepted.
    pub(crate) fn flush_all(&mut self) -> usize {
        let mut flushed = 0;
        for i in 0..self.tx_active.len() {
            let vif = self.tx_active[i];
            if let Some(queue) = self.tx_queues.get_mut(vif as usize).and_then(Option::as_mut) {
                flushed += queue.flush();
            }
        }
        flushed
    }

    /// Service at most one pending command. A half-posted command (tag
    /// still `CMD_CLAIMED`) is left for the next pass.
    pub(crate) fn handle_cmd(&mut self, shared: &LcoreShared) {
        let cmd = shared.cmd.load(Ordering::Acquire);
        if cmd == CMD_NONE || cmd == CMD_CLAIMED {
            return;
        }
        let param = shared.cmd_param.load(Ordering::Relaxed);
        let vif = param as VifIndex;
        match cmd {
            CMD_RX_RM => {
                // Dropping the hot handle is the whole removal here;
                // backend release happens control-side after the ack.
                self.rx_remove(vif);
            }
            CMD_TX_RM => {
                self.tx_remove(vif);
            }
            CMD_RX_ADD => self.cmd_rx_add(shared, vif),
            CMD_TX_ADD => self.cmd_tx_add(shared, vif),
            other => {
                tracing::warn!(lcore = self.lcore_id, cmd = other, "unknown command ignored");
            }
        }
        shared.cmd.store(CMD_NONE, Ordering::Release);
    }

    /// Execute a staged receive-queue add. An occupied slot leaves the
    /// payload staged so the poster sees the rejection after the ack.
    fn cmd_rx_add(&mut self, shared: &LcoreShared, vif: VifIndex) {
        let mut slot = shared.payload_slot();
        if let Some(CmdPayload::Rx(queue)) = slot.take() {
            if self.rx_queues[vif as usize].is_none() {
                drop(slot);
                let _ = self.rx_install(vif, queue);
            } else {
                tracing::warn!(lcore = self.lcore_id, vif, "rx slot occupied, add rejected");
                *slot = Some(CmdPayload::Rx(queue));
            }
        }
    }

    fn cmd_tx_add(&mut self, shared: &LcoreShared, vif: VifIndex) {
        let mut slot = shared.payload_slot();
        if let Some(CmdPayload::Tx(queue)) = slot.take() {
            if self.tx_queues[vif as usize].is_none() {
                drop(slot);
                let _ = self.tx_install(vif, queue);
            } else {
                tracing::warn!(lcore = self.lcore_id, vif, "tx slot occupied, add rejected");
                *slot = Some(CmdPayload::Tx(queue));
            }
        }
    }
}

/// The forwarding loop body, run on the lcore's own thread. Returns the
/// tables so the control path regains ownership after termination.
pub(crate) fn forwarding_loop(
    mut tables: Box<LcoreTables>,
    shared: &LcoreShared,
) -> Box<LcoreTables> {
    shared.set_state(LcoreState::Running);
    tracing::info!(lcore = tables.lcore_id, "forwarding lcore started");
    while !shared.stop_requested() {
        let moved = tables.iteration(shared);
        tables.handle_cmd(shared);
        if moved == 0 {
            std::thread::yield_now();
        }
    }
    shared.set_state(LcoreState::Stopping);
    tables.flush_all();
    shared.set_state(LcoreState::Terminated);
    tracing::info!(lcore = tables.lcore_id, "forwarding lcore stopped");
    tables
}

/// Least-loaded lcore by assigned receive queues, skipping `exclude`.
/// Ties break toward the lowest index.
pub(crate) fn least_used(
    lcores: &[Arc<LcoreShared>],
    exclude: &[LcoreIndex],
) -> Option<LcoreIndex> {
    lcores
        .iter()
        .enumerate()
        .filter(|(i, _)| !exclude.contains(i))
        .min_by_key(|(i, s)| (s.nb_rx_queues(), *i))
        .map(|(i, _)| i)
}

/// Least-loaded lcore among those owning a physical transmit queue.
pub(crate) fn phys_least_used(
    lcores: &[Arc<LcoreShared>],
    exclude: &[LcoreIndex],
) -> Option<LcoreIndex> {
    lcores
        .iter()
        .enumerate()
        .filter(|(i, s)| !exclude.contains(i) && s.nb_phys_tx_queues() > 0)
        .min_by_key(|(i, s)| (s.nb_rx_queues(), *i))
        .map(|(i, _)| i)
}
