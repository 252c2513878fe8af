//! io-core: a user-space block device runtime with an NVMe multipath
//! engine.
//!
//! The crate is organized the way the data flows:
//!
//! - [`core`] is the cooperative runtime: logical threads with message
//!   queues, pollers, the tick clock and the process `Runtime` handle.
//! - [`bdev`] is the generic block layer: devices, descriptors, the
//!   submit pipeline (reset freeze, range locks, splitting, QoS, NOMEM
//!   back-pressure), claims and statistics.
//! - [`bdev_api`] is the user-facing operation surface over an open
//!   descriptor.
//! - [`nvme`] is the multipath engine: controller lifecycle with
//!   failover and reconnect timers, ANA handling, per-channel I/O path
//!   selection and generic-to-NVMe command translation.

pub mod bdev;
pub mod bdev_api;
pub mod core;
pub mod jsonrpc;
pub mod nvme;
