//! The seam between the generic layer and device modules: a capability
//! trait per bdev plus a small registry used during examine.

use std::{any::Any, sync::Arc};

use super::{bdev::Bdev, io::BdevIo, io::IoType};
use crate::core::Thread;

/// Opaque per-thread channel owned by the module.
pub type ModuleChannel = Arc<dyn Any + Send + Sync>;

/// Per-bdev operations implemented by the owning module.
pub trait BdevOps: Send + Sync {
    /// Dispatch one I/O on the module channel. Completion is reported via
    /// `BdevIo::complete`, possibly synchronously.
    fn submit_request(&self, chan: &ModuleChannel, io: &Arc<BdevIo>);

    fn io_type_supported(&self, io_type: IoType) -> bool;

    /// Create (or share) the module channel for a thread.
    fn get_io_channel(&self, thread: &Arc<Thread>) -> ModuleChannel;

    /// Called once the bdev is fully unregistered.
    fn destruct(&self) {}

    fn dump_info_json(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    /// Number of memory domains the module can address directly. Zero
    /// forces the generic layer to bounce foreign-domain payloads.
    fn get_memory_domains(&self) -> u32 {
        0
    }

    /// Whether the module executes attached accel sequences itself for
    /// the given I/O type.
    fn accel_sequence_supported(&self, _io_type: IoType) -> bool {
        false
    }

    fn reset_device_stat(&self) {}

    /// Key aggregating NOMEM back-pressure: channels that report the same
    /// key sit on the same underlying device and share one retry queue.
    fn shared_resource_key(&self, chan: &ModuleChannel) -> usize {
        Arc::as_ptr(chan) as *const () as usize
    }
}

/// A registered bdev module. Modules get a chance to examine (and claim)
/// every newly registered bdev.
pub trait BdevModule: Send + Sync {
    fn name(&self) -> &str;

    /// Inspect a new bdev; claims taken here use the module's identity.
    fn examine(&self, _bdev: &Arc<Bdev>) {}
}
