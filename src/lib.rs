//! Host-managed flash translation layer for open-channel SSDs.
//!
//! Two subsystems do the work: [`block_manager::BlockManager`] owns LUN and
//! block inventory (bad-block application, free/used/bad bookkeeping), and
//! [`rrpc::Rrpc`] is the round-robin page FTL built on top of it (address
//! translation, inflight locking, write-path mapping, garbage collection).
//! A production integrator supplies a [`device::DeviceAdapter`]; this crate
//! ships [`sim::MemDevice`] as a reference implementation and a
//! thread-backed [`workqueue::Workqueue`] as a reference executor for the
//! two work queues the design calls for (per-LUN ordered, background).
//!
//! ```
//! use std::sync::Arc;
//! use hbftl::block_manager::BlockManager;
//! use hbftl::device::BioDirection;
//! use hbftl::rrpc::Rrpc;
//! use hbftl::sim::MemDevice;
//!
//! let device = Arc::new(MemDevice::new(1, 16, 8));
//! let bm = Arc::new(BlockManager::attach(device).unwrap());
//! let rrpc = Rrpc::new(bm).unwrap();
//!
//! let mut data = vec![0xab; 512];
//! rrpc.make_rq(BioDirection::Write, 0, &mut data);
//!
//! let mut out = vec![0u8; 512];
//! rrpc.make_rq(BioDirection::Read, 0, &mut out);
//! assert_eq!(out, data);
//! ```

pub mod bitmap;
pub mod block_manager;
pub mod device;
pub mod error;
pub mod rrpc;
pub mod sim;
pub mod workqueue;
