//!
//! The generic block device layer: device objects and descriptors, the
//! submit/completion pipeline with splitting, QoS, LBA range locks and
//! NOMEM back-pressure, the claim protocol and the shared I/O pool.

pub use bdev::{Bdev, BdevBuilder, BdevProps, BdevStatus, DifType, ZoneInfo};
pub use claim::{ClaimOpts, ClaimType};
pub use desc::{open_async, BdevDesc, BdevEvent, TimeoutAction};
pub use io::{
    BdevIo,
    ExtIoOpts,
    IoBuffer,
    IoCompletion,
    IoStatus,
    IoType,
    IoVec,
    NvmePassthruCmd,
    RetryState,
    ZoneArgs,
};
pub use lock::{lock_lba_range, quiesce_range, unlock_lba_range, LbaRange};
pub use module::{BdevModule, BdevOps, ModuleChannel};
pub use qos::{set_qos_rate_limits, Qos, RateLimitKind};
pub use stats::{BdevIoStats, ErrorStat, LatencyHistogram, StatReset};

#[allow(clippy::module_inception)]
pub mod bdev;
pub mod channel;
pub mod claim;
pub mod desc;
pub mod io;
pub mod lock;
pub mod malloc;
pub mod module;
pub mod pool;
pub mod qos;
pub mod split;
pub mod stats;
