//!
//! core contains the runtime primitives the engine is built on: the tick
//! clock, logical threads with message queues, pollers and the process
//! runtime handle, plus the error type shared by the whole crate.

use nix::errno::Errno;
use snafu::Snafu;

pub use poller::{PollStatus, Poller};
pub use runtime::{BdevOpts, Runtime};
pub use thread::Thread;
pub use ticks::TickSource;

pub mod poller;
pub mod runtime;
pub mod thread;
pub mod ticks;

use crate::bdev::io::IoType;

/// Obtain the full error chain.
pub trait VerboseError {
    fn verbose(&self) -> String;
}

impl<T> VerboseError for T
where
    T: std::error::Error,
{
    /// loops through the error chain and formats into a single string
    /// containing all the lower level errors
    fn verbose(&self) -> String {
        let mut msg = format!("{}", self);
        let mut opt_source = self.source();
        while let Some(source) = opt_source {
            msg = format!("{}: {}", msg, source);
            opt_source = source.source();
        }
        msg
    }
}

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum CoreError {
    #[snafu(display("bdev {} not found", name))]
    BdevNotFound {
        name: String,
    },
    #[snafu(display("bdev {} already exists", name))]
    BdevExists {
        name: String,
    },
    #[snafu(display("alias {} already claims another bdev", alias))]
    AliasExists {
        alias: String,
    },
    #[snafu(display("failed to open bdev {}: {}", name, source))]
    OpenBdev {
        source: Errno,
        name: String,
    },
    #[snafu(display("descriptor for {} is not writable", name))]
    NotWritable {
        name: String,
    },
    #[snafu(display(
        "invalid lba range: offset {} num_blocks {}",
        offset,
        num_blocks
    ))]
    InvalidLbaRange {
        offset: u64,
        num_blocks: u64,
    },
    #[snafu(display("I/O type {:?} not supported by bdev {}", io_type, name))]
    IoTypeNotSupported {
        io_type: IoType,
        name: String,
    },
    #[snafu(display("bdev io pool exhausted"))]
    NoIoDescriptors {},
    #[snafu(display("bdev {} is claimed ({:?})", name, claim))]
    ClaimConflict {
        name: String,
        claim: crate::bdev::claim::ClaimType,
    },
    #[snafu(display("shared claim on {} requires a matching non-zero key", name))]
    ClaimBadKey {
        name: String,
    },
    #[snafu(display("descriptor already holds a claim on {}", name))]
    ClaimExists {
        name: String,
    },
    #[snafu(display("invalid qos rate {} for {:?}", rate, kind))]
    QosInvalidRate {
        kind: crate::bdev::qos::RateLimitKind,
        rate: u64,
    },
    #[snafu(display("Failed to dispatch reset: {}", source))]
    ResetDispatch {
        source: Errno,
    },
    #[snafu(display("controller {} is being destructed", name))]
    CtrlrDestruct {
        name: String,
    },
    #[snafu(display("controller {} reset already in progress", name))]
    CtrlrResetting {
        name: String,
    },
    #[snafu(display("controller {} already in the requested state", name))]
    CtrlrAlreadySo {
        name: String,
    },
    #[snafu(display("no I/O path available for {}", name))]
    NoPathAvailable {
        name: String,
    },
    #[snafu(display("failed to get IO channel for {}", name))]
    GetIoChannel {
        name: String,
    },
    #[snafu(display("async open of {} timed out", name))]
    OpenTimedOut {
        name: String,
    },
    #[snafu(display("invalid option: {}", reason))]
    InvalidOpts {
        reason: String,
    },
    #[snafu(display(
        "Failed to dispatch NVMe IO passthru command {:x}h: {}",
        opcode,
        source
    ))]
    NvmeIoPassthruDispatch {
        source: Errno,
        opcode: u8,
    },
    #[snafu(display("the operation is invalid for this bdev: {}", source))]
    NotSupported {
        source: Errno,
    },
}

/// Represent error as Errno value.
pub trait ToErrno {
    fn to_errno(self) -> Errno;
}

/// Map CoreError to errno code, for the callers that surface failures as
/// negative integers.
impl ToErrno for CoreError {
    fn to_errno(self) -> Errno {
        match self {
            Self::BdevNotFound {
                ..
            } => Errno::ENODEV,
            Self::BdevExists {
                ..
            }
            | Self::AliasExists {
                ..
            } => Errno::EEXIST,
            Self::OpenBdev {
                source, ..
            } => source,
            Self::NotWritable {
                ..
            } => Errno::EPERM,
            Self::InvalidLbaRange {
                ..
            }
            | Self::QosInvalidRate {
                ..
            }
            | Self::InvalidOpts {
                ..
            } => Errno::EINVAL,
            Self::IoTypeNotSupported {
                ..
            } => Errno::ENOTSUP,
            Self::NoIoDescriptors {
                ..
            } => Errno::ENOMEM,
            Self::ClaimConflict {
                ..
            }
            | Self::ClaimExists {
                ..
            }
            | Self::CtrlrResetting {
                ..
            } => Errno::EBUSY,
            Self::ClaimBadKey {
                ..
            } => Errno::EINVAL,
            Self::ResetDispatch {
                source,
            } => source,
            Self::CtrlrDestruct {
                ..
            }
            | Self::NoPathAvailable {
                ..
            }
            | Self::GetIoChannel {
                ..
            } => Errno::ENXIO,
            Self::CtrlrAlreadySo {
                ..
            } => Errno::EALREADY,
            Self::OpenTimedOut {
                ..
            } => Errno::ETIMEDOUT,
            Self::NvmeIoPassthruDispatch {
                source, ..
            } => source,
            Self::NotSupported {
                source,
            } => source,
        }
    }
}
