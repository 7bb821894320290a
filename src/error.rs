use std::fmt;

use crate::ethdev::QueueState;
use crate::packet::VifIndex;
use crate::port::{PortId, QueueId};

/// A boxed error type for backend (device driver) failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for dataplane operations.
///
/// Capacity exhaustion and backend failures are ordinary, recoverable
/// conditions: the caller decides whether to reject an interface, retry
/// with fewer queues, or give up. Protocol violations indicate a caller
/// bug and are reported instead of causing undefined behavior.
#[derive(Debug)]
pub enum Error {
    /// No hardware receive queue left in the ready state.
    NoFreeHwQueue,
    /// The global free-mempool list is exhausted.
    NoFreeMempool,
    /// No lcore is eligible to take another queue.
    NoLcoreAvailable,
    /// The per-lcore rings-to-push table is full.
    RingTableFull,
    /// A ring with this name already exists.
    RingNameCollision(String),
    /// Ring capacity is not a power of two.
    RingSize(usize),
    /// The named ring is not registered with this lcore as its owner.
    RingOwner {
        name: String,
        lcore: usize,
    },
    /// A hardware queue is in the wrong state for the requested operation.
    QueueState {
        queue: QueueId,
        state: QueueState,
    },
    /// The interface index is not registered.
    NoVif(VifIndex),
    /// No ethdev is configured for this port.
    NoEthdev(PortId),
    /// The interface has no hardware port bound to it.
    NoPortBound(VifIndex),
    /// No kernel-bridge device is attached to this interface.
    NoKnbDevice(VifIndex),
    /// A queue is already installed in this (lcore, interface) table slot.
    QueueSlotOccupied {
        lcore: usize,
        vif: VifIndex,
    },
    /// The interface index table is full.
    VifTableFull,
    /// The dataplane was already started.
    AlreadyStarted,
    /// The dataplane is shutting down; no reconfiguration is accepted.
    Stopped,
    /// Failure reported by a device backend.
    Port(BoxError),
    /// An lcore thread could not be spawned.
    Spawn(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoFreeHwQueue => write!(f, "no hardware queue in ready state"),
            Error::NoFreeMempool => write!(f, "free-mempool list exhausted"),
            Error::NoLcoreAvailable => write!(f, "no eligible lcore available"),
            Error::RingTableFull => write!(f, "rings-to-push table is full"),
            Error::RingNameCollision(name) => write!(f, "ring {name:?} already exists"),
            Error::RingSize(size) => {
                write!(f, "ring size {size} is not a power of two")
            }
            Error::RingOwner { name, lcore } => {
                write!(f, "ring {name:?} is not registered to lcore {lcore}")
            }
            Error::QueueState { queue, state } => {
                write!(f, "hardware queue {queue} is in state {state:?}")
            }
            Error::NoVif(vif) => write!(f, "interface {vif} is not registered"),
            Error::NoEthdev(port) => write!(f, "no ethdev configured for port {port}"),
            Error::NoPortBound(vif) => {
                write!(f, "interface {vif} has no hardware port bound")
            }
            Error::NoKnbDevice(vif) => {
                write!(f, "interface {vif} has no kernel-bridge device")
            }
            Error::QueueSlotOccupied { lcore, vif } => {
                write!(f, "lcore {lcore} already owns a queue for interface {vif}")
            }
            Error::VifTableFull => write!(f, "interface table is full"),
            Error::AlreadyStarted => write!(f, "dataplane already started"),
            Error::Stopped => write!(f, "dataplane is stopped"),
            Error::Port(e) => write!(f, "device backend error: {e}"),
            Error::Spawn(e) => write!(f, "failed to spawn lcore thread: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Port(e) => Some(e.as_ref()),
            Error::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias for dataplane operations.
pub type Result<T> = std::result::Result<T, Error>;
