//! User-space forwarding plane for a virtual router.
//!
//! A [`Dataplane`] runs one polling thread per forwarding lcore in a
//! run-to-completion loop: burst-receive from hardware queues,
//! kernel-bridge devices and inter-core rings, hand each burst to a
//! [`PacketRouter`], and burst-transmit with buffering. The packet path
//! takes no locks; reconfiguration reaches a running lcore through a
//! single-slot command mailbox serviced between iterations.
//!
//! Device drivers stay outside the crate: hardware ports and
//! kernel-bridge devices are consumed through the [`EthPort`] and
//! [`KnbDevice`] capability traits.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use vrouter_dataplane::{Dataplane, DataplaneConfig, PacketRouter};
//! use vrouter_dataplane::ethdev::{eth_rx_queue_init, eth_tx_queue_init};
//!
//! let config = DataplaneConfig::new().nb_fwd_lcores(4).service_lcore(true);
//! let dp = Dataplane::new(config, router);
//!
//! dp.vif_register(0)?;
//! dp.ethdev_init(0, 0, port)?;
//! let rss = dp.ethdev_rss_init(0)?;
//! dp.if_schedule(0, None, rss.len() as u16, eth_rx_queue_init, 2, eth_tx_queue_init)?;
//!
//! dp.start()?;
//! // ... forwarders poll until:
//! dp.stop();
//! ```

pub mod config;
pub mod dataplane;
pub mod error;
pub mod ethdev;
pub mod knb;
pub mod lcore;
pub mod mempool;
pub mod packet;
pub mod port;
pub mod queue;
pub mod ring;
pub mod router;

pub use config::DataplaneConfig;
pub use dataplane::{Dataplane, SchedCtx};
pub use error::{BoxError, Error, Result};
pub use knb::KnbDevice;
pub use mempool::{Mempool, PoolBuf};
pub use packet::{Packet, PacketBurst, VifIndex};
pub use port::{EthPort, PortId, PortInfo, QueueId};
pub use queue::{RxQueueInitOp, TxQueueInitOp};
pub use ring::VrRing;
pub use router::PacketRouter;
